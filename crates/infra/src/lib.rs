pub mod alerts;
pub mod backends;
pub mod config;
pub mod db;
pub mod idempotency;
pub mod logging;
pub mod realtime;
pub mod repositories;
