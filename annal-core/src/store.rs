//! The event store contract.
//!
//! [`EventStore`] is the seam every backend implements: transactional append
//! of change intents, declarative journal queries, and reads against the
//! lookup side table. The unique-constraint and lookup types live here too,
//! since both the store trait and the event facets speak them.

use std::{collections::BTreeMap, error::Error as StdError, fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    aggregate::{ChangeIntent, ChangeProducer, JournalViewer},
    crypto::CryptoError,
    event::{AggregateId, AggregateType, AggregateVersion, JournalEvent, MapEventError},
    query::{JournalQuery, QueryOptions},
};

pub mod inmemory;

/// A claim on a globally unique `(field, value)` pair, owned by one
/// aggregate. Events add claims when a value comes into use and remove them
/// when it is released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniqueConstraint {
    owner: AggregateId,
    field: String,
    value: String,
}

impl UniqueConstraint {
    #[must_use]
    pub fn new(owner: AggregateId, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            owner,
            field: field.into(),
            value: value.into(),
        }
    }

    /// A removal matching every constraint the owner holds, regardless of
    /// field and value. Used by deletion events.
    #[must_use]
    pub fn delete_all(owner: AggregateId) -> Self {
        Self {
            owner,
            field: String::new(),
            value: String::new(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &AggregateId {
        &self.owner
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn is_delete_all(&self) -> bool {
        self.field.is_empty() && self.value.is_empty()
    }
}

/// An append tried to claim a `(field, value)` pair already held by another
/// aggregate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unique constraint violated: {field} = {value:?} is already taken")]
pub struct UniqueConstraintViolation {
    pub field: String,
    pub value: String,
}

/// Name of a lookup field (`"name"`, `"slug"`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupFieldName(String);

impl LookupFieldName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LookupFieldName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for LookupFieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value published under a lookup field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupFieldValue(String);

impl LookupFieldValue {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for LookupFieldValue {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for LookupFieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup values published by one event, keyed by field name. Ordered so
/// upserts apply deterministically.
pub type LookupMap = BTreeMap<LookupFieldName, LookupFieldValue>;

/// Read against the lookup side table.
///
/// [`EventStore::lookup`] resolves the current value for a field, with the
/// aggregate id as an optional narrowing filter; [`EventStore::owner_lookup`]
/// resolves which aggregate currently publishes a given value, which is how
/// "find the club named X" reads work without replaying the journal.
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub aggregate_type: AggregateType,
    pub aggregate_id: Option<AggregateId>,
    pub field_name: LookupFieldName,
    pub field_value: Option<LookupFieldValue>,
}

impl LookupQuery {
    /// Current value published under `field_name` by any aggregate of the
    /// type. Useful when the type has a single instance or the caller does
    /// not care which aggregate publishes the field.
    #[must_use]
    pub fn value_for_type(aggregate_type: AggregateType, field_name: LookupFieldName) -> Self {
        Self {
            aggregate_type,
            aggregate_id: None,
            field_name,
            field_value: None,
        }
    }

    /// Value of `field_name` currently published by the given aggregate.
    #[must_use]
    pub fn value_of(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        field_name: LookupFieldName,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id: Some(aggregate_id),
            field_name,
            field_value: None,
        }
    }

    /// Aggregate currently publishing `field_value` under `field_name`.
    #[must_use]
    pub fn owner_of(
        aggregate_type: AggregateType,
        field_name: LookupFieldName,
        field_value: LookupFieldValue,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id: None,
            field_name,
            field_value: Some(field_value),
        }
    }
}

/// Errors surfaced by [`EventStore`] operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The intent's version precondition failed against the persisted
    /// version. Nothing was written.
    #[error("version conflict: intent at version {expected}, journal at {actual}")]
    VersionConflict {
        expected: AggregateVersion,
        actual: AggregateVersion,
    },
    /// Waiting on another append's row lock for the same aggregate timed
    /// out; the caller should re-read and retry.
    #[error("another append for this aggregate is in flight")]
    IntentOutdated,
    #[error(transparent)]
    UniqueConstraint(#[from] UniqueConstraintViolation),
    /// A lookup query matched no row.
    #[error("no lookup value found")]
    ValueNotFound,
    /// An owner lookup matched no row.
    #[error("no aggregate publishes this value")]
    OwnerNotFound,
    /// Appending more than one intent per call is not supported.
    #[error("expected at most one change intent, got {0}")]
    UnsupportedIntentCount(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Map(#[from] MapEventError),
    #[error("payload serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

/// Post-persistence callback, invoked after a successful append commit.
///
/// Hook failures are logged by the store and never fail the append; the
/// events are already durable by the time hooks run.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn post_persist(
        &self,
        events: &[JournalEvent],
    ) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

/// Transactional event journal with unique constraints, lookups, and
/// field-level crypto.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append the intents' events.
    ///
    /// All constraint maintenance, lookup maintenance, encryption, and the
    /// journal insert commit together or not at all. Returns the persisted
    /// events with their assigned versions and positions. Intents with no
    /// events succeed as a no-op; a batch of zero intents likewise.
    ///
    /// # Errors
    ///
    /// See [`EventStoreError`]; version conflicts and unique-constraint
    /// violations leave the journal untouched.
    async fn append(
        &self,
        intents: Vec<ChangeIntent>,
    ) -> Result<Vec<JournalEvent>, EventStoreError>;

    /// Events matching the query, in ascending journal position, decrypted.
    async fn query(
        &self,
        query: &JournalQuery,
        options: QueryOptions,
    ) -> Result<Vec<JournalEvent>, EventStoreError>;

    /// Current lookup value for an aggregate's field.
    async fn lookup(&self, query: LookupQuery) -> Result<LookupFieldValue, EventStoreError>;

    /// Aggregate currently publishing a value under a field.
    async fn owner_lookup(&self, query: LookupQuery) -> Result<AggregateId, EventStoreError>;

    /// Register a post-persistence hook.
    fn add_hook(&self, hook: Arc<dyn Hook>);

    /// Drain a producer's changes and append them.
    async fn produce_append(
        &self,
        producer: &mut (dyn ChangeProducer + Send),
    ) -> Result<(), EventStoreError> {
        let intent = producer.changes();
        self.append(vec![intent]).await?;
        Ok(())
    }

    /// Run a viewer's query and reduce the result into it.
    async fn view(&self, viewer: &mut (dyn JournalViewer + Send)) -> Result<(), EventStoreError> {
        let events = self.query(&viewer.query(), QueryOptions::default()).await?;
        viewer.reduce(&events);
        Ok(())
    }
}
