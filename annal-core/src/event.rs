//! Event envelope primitives.
//!
//! This module defines the identifier newtypes shared across the store, the
//! [`DomainEvent`] trait every concrete event implements (descriptors plus
//! optional side-effect facets), the [`JournalEvent`] envelope returned by
//! queries, and the [`JournalEventMapper`] seam through which the domain
//! teaches the store how to turn persisted rows back into typed events.

use std::{any::Any, borrow::Cow, fmt};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    crypto::{CryptoError, CryptoTransformer},
    store::{LookupFieldName, LookupMap, UniqueConstraint},
};

/// Identifier of a single aggregate instance.
///
/// Opaque to the store; domain code decides the format (UUIDs, KSUIDs,
/// human-readable slugs — anything stable and unique per aggregate type).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Cow<'static, str>);

        impl $name {
            /// Construct from a static string, usable in `const` contexts so
            /// domain crates can declare their identifiers as constants.
            #[must_use]
            pub const fn from_static(name: &'static str) -> Self {
                Self(Cow::Borrowed(name))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(Cow::Owned(name.to_owned()))
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(Cow::Owned(name))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type! {
    /// Kind of an aggregate (`"club"`, `"account"`, ...). One aggregate type
    /// owns many aggregate instances, each with its own event stream.
    AggregateType
}

name_type! {
    /// Kind of an event within an aggregate type (`"club_created"`, ...).
    EventType
}

name_type! {
    /// Schema-evolution tag carried next to the payload (`"v1"`, `"v2"`, ...).
    /// The store persists it verbatim; interpreting it is the mapper's job.
    EventVersion
}

/// Per-aggregate version counter. `0` means "no events yet".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AggregateVersion(pub u64);

impl AggregateVersion {
    /// Version after appending `offset` more events on top of `self`.
    #[must_use]
    pub const fn incremented_by(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AggregateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Total order over the whole journal.
///
/// Backed by an arbitrary-precision decimal so a backend may later insert
/// between two existing positions without renumbering.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JournalPosition(Decimal);

impl JournalPosition {
    #[must_use]
    pub const fn new(position: Decimal) -> Self {
        Self(position)
    }

    #[must_use]
    pub const fn into_inner(self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for JournalPosition {
    fn from(position: Decimal) -> Self {
        Self(position)
    }
}

impl From<i64> for JournalPosition {
    fn from(position: i64) -> Self {
        Self(Decimal::from(position))
    }
}

impl fmt::Display for JournalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Store-assigned identifier of one persisted journal row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source of event identifiers, injected into every store backend.
pub trait IdGen: Send + Sync {
    fn next_id(&self) -> EventId;
}

/// Default [`IdGen`] producing random UUIDs.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn next_id(&self) -> EventId {
        EventId(Uuid::new_v4())
    }
}

/// An immutable domain fact, plus the optional side-effect declarations the
/// store discovers per event instance.
///
/// The required methods describe the event (which aggregate it targets, its
/// type and schema version) and how to serialize its payload. The provided
/// methods are *facets*: an event overrides exactly those that apply to it —
/// unique-constraint maintenance, lookup-table maintenance, and field-level
/// encryption. The default implementations declare nothing.
pub trait DomainEvent: Any + Send + Sync {
    fn aggregate_id(&self) -> &AggregateId;

    fn aggregate_type(&self) -> AggregateType;

    fn event_type(&self) -> EventType;

    fn event_version(&self) -> EventVersion;

    /// Serialize the payload for persistence. Descriptor fields (aggregate
    /// id, type, ...) are stored in their own columns and must not appear in
    /// the payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if the payload cannot be
    /// serialized.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Upcast for type-switch dispatch in reducers and projectors.
    fn as_any(&self) -> &dyn Any;

    /// Whether any encrypted field of this event was shredded during
    /// decryption. Events without encrypted fields stay `false`.
    fn is_shredded(&self) -> bool {
        false
    }

    /// Unique constraints this event claims for its aggregate.
    fn unique_constraints_to_add(&self) -> Vec<UniqueConstraint> {
        Vec::new()
    }

    /// Unique constraints this event releases.
    fn unique_constraints_to_remove(&self) -> Vec<UniqueConstraint> {
        Vec::new()
    }

    /// Lookup values this event publishes, keyed by field name.
    /// Last write wins per `(aggregate, field name)`.
    fn lookup_values(&self) -> LookupMap {
        LookupMap::new()
    }

    /// Lookup field names this event retracts for its aggregate.
    fn lookup_removals(&self) -> Vec<LookupFieldName> {
        Vec::new()
    }

    /// Owners whose keys are needed to encrypt or decrypt this event's
    /// tagged fields. Non-empty marks the event as carrying encrypted data.
    fn encrypted_field_owners(&self) -> Vec<AggregateId> {
        Vec::new()
    }

    /// Visit every encrypted field with the given transformer.
    ///
    /// # Errors
    ///
    /// Propagates any failure of the transformer (missing key on encrypt,
    /// malformed ciphertext on decrypt).
    fn accept_crypto(&mut self, transformer: &mut dyn CryptoTransformer) -> Result<(), CryptoError> {
        let _ = transformer;
        Ok(())
    }
}

/// A persisted event: the domain fact plus store-assigned metadata.
pub struct JournalEvent {
    event: Box<dyn DomainEvent>,
    event_id: EventId,
    aggregate_version: AggregateVersion,
    journal_position: JournalPosition,
    inserted_at: DateTime<Utc>,
}

impl JournalEvent {
    #[must_use]
    pub fn new(
        event: Box<dyn DomainEvent>,
        event_id: EventId,
        aggregate_version: AggregateVersion,
        journal_position: JournalPosition,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            event_id,
            aggregate_version,
            journal_position,
            inserted_at,
        }
    }

    #[must_use]
    pub fn event(&self) -> &dyn DomainEvent {
        self.event.as_ref()
    }

    /// Mutable access, used by the crypto layer to decrypt fields in place.
    pub fn event_mut(&mut self) -> &mut dyn DomainEvent {
        self.event.as_mut()
    }

    /// Downcast the inner event for type-switch dispatch.
    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref()
    }

    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    #[must_use]
    pub fn aggregate_version(&self) -> AggregateVersion {
        self.aggregate_version
    }

    #[must_use]
    pub fn journal_position(&self) -> JournalPosition {
        self.journal_position
    }

    #[must_use]
    pub fn inserted_at(&self) -> DateTime<Utc> {
        self.inserted_at
    }
}

impl fmt::Debug for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalEvent")
            .field("event_id", &self.event_id)
            .field("aggregate_id", self.event.aggregate_id())
            .field("aggregate_type", &self.event.aggregate_type())
            .field("event_type", &self.event.event_type())
            .field("aggregate_version", &self.aggregate_version)
            .field("journal_position", &self.journal_position)
            .finish_non_exhaustive()
    }
}

/// Raw persisted journal row, before the domain has mapped it back to a
/// typed event.
#[derive(Clone, Debug)]
pub struct JournalRecord {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    pub aggregate_version: AggregateVersion,
    pub journal_position: JournalPosition,
    pub event_type: EventType,
    pub event_version: EventVersion,
    pub payload: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
}

/// Error raised while mapping a [`JournalRecord`] back to a typed event.
#[derive(Debug, Error)]
pub enum MapEventError {
    /// The mapper does not know this `(aggregate type, event type, event
    /// version)` combination.
    #[error("no event registered for {aggregate_type}::{event_type} {event_version}")]
    UnknownEvent {
        aggregate_type: AggregateType,
        event_type: EventType,
        event_version: EventVersion,
    },
    /// The payload did not deserialize into the registered event shape.
    #[error("failed to deserialize event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Maps persisted journal rows back to typed domain events.
///
/// Implemented by domain code as an explicit type switch over
/// `(aggregate type, event type, event version)`; the version tag is where
/// payload schema evolution is handled.
pub trait JournalEventMapper: Send + Sync {
    /// Reconstruct the typed event and wrap it in its journal envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MapEventError::UnknownEvent`] for unregistered combinations
    /// and [`MapEventError::Payload`] for undeserializable payloads.
    fn map(&self, record: JournalRecord) -> Result<JournalEvent, MapEventError>;
}
