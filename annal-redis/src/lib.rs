//! Redis-backed implementations of the Annal core traits.
//!
//! This crate provides:
//!
//! - [`Supervisor`] - An implementation of
//!   [`annal_core::projector::ProjectorSupervisor`] that keeps projection
//!   cursors in Redis and serializes runs with distributed locks
//! - [`lock::LockManager`] - The underlying token-checked lock primitive
//!
//! The journal itself lives in another backend; pair this supervisor with
//! any [`annal_core::store::EventStore`].

pub mod lock;
pub mod supervisor;

pub use lock::{LockGuard, LockManager};
pub use supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
