use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod contacts;
pub mod db;
pub mod geolocation;
pub mod idempotency;
pub mod realtime;
pub mod responders;
pub mod sos;
