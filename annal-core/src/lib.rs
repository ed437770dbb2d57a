//! Core traits and types for the Annal event-sourced aggregate store.
//!
//! This crate provides the backend-agnostic abstractions:
//!
//! - [`event`] - Event primitives (`DomainEvent`, `JournalEvent`, `JournalEventMapper`)
//! - [`aggregate`] - Writer-side primitives (`BaseWriter`, `ChangeIntent`, `VersionMatcher`)
//! - [`query`] - Declarative journal queries (`JournalQuery`, `QueryOptions`)
//! - [`store`] - The store contract (`EventStore`, unique constraints, lookups)
//! - [`crypto`] - Field-level encryption and crypto shredding (`KeyStore`, `EventCrypto`)
//! - [`notifier`] - Change notification (`EventNotifier`, `EventListener`)
//! - [`projector`] - Projections and their supervision (`Projector`, `ProjectorSupervisor`)
//!
//! Each of [`store`], [`crypto`], [`notifier`], and [`projector`] ships an
//! `inmemory` reference implementation honoring the full contract, so
//! domain code and projections can be tested without external services.
//!
//! Most users should depend on the `annal` crate, which re-exports these
//! types together with the persistent backends.

pub mod aggregate;
pub mod crypto;
pub mod event;
pub mod notifier;
pub mod projector;
pub mod query;
pub mod store;
