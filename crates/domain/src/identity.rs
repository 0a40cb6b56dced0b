use serde::{Deserialize, Serialize};

/// Caller identity resolved by the transport layer. Every core operation
/// receives it explicitly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorIdentity {
    pub user_id: String,
    pub username: String,
}

impl ActorIdentity {
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            user_id: user_id.clone(),
            username: user_id,
        }
    }
}
