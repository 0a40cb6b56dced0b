use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    User,
    Responder,
    Admin,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anonymous" | "guest" => Some(Role::Anonymous),
            "user" | "patient" => Some(Role::User),
            "responder" | "ambulance" => Some(Role::Responder),
            "admin" => Some(Role::Admin),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::User => "user",
            Role::Responder => "responder",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Role::Anonymous)
    }

    pub fn can_respond(&self) -> bool {
        matches!(self, Role::Responder | Role::System)
    }
}
