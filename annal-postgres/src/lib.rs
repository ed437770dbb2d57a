//! Postgres-backed implementations of the Annal core traits.
//!
//! This crate provides:
//!
//! - [`Store`] - An implementation of [`annal_core::store::EventStore`]
//! - [`PgKeyStore`] - An implementation of [`annal_core::crypto::KeyStore`]
//! - [`PgEventNotifier`] - An implementation of
//!   [`annal_core::notifier::EventNotifier`] over `LISTEN`/`NOTIFY`
//! - [`Supervisor`] - An implementation of
//!   [`annal_core::projector::ProjectorSupervisor`] with row-locked state
//!
//! All share the same database and can share a connection pool.

pub mod crypto;
pub mod error;
pub mod notifier;
pub mod schema;
pub mod store;
pub mod supervisor;

pub use crypto::PgKeyStore;
pub use error::Error;
pub use notifier::PgEventNotifier;
pub use store::Store;
pub use supervisor::{PostgresProjector, Supervisor};
