//! Projections and their supervision.
//!
//! A [`Projector`] folds journal events into some external read model. A
//! supervisor owns the bookkeeping around it: per-projection state (last
//! processed position), catch-up queries, mutual exclusion so only one
//! instance of a projection runs at a time, and wiring into the change
//! notifier. The state shape and catch-up logic are backend-agnostic and
//! live here; locking is backend-specific.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aggregate::JournalInquirer,
    event::{AggregateVersion, EventId, JournalEvent, JournalPosition},
    notifier::{EventInterest, EventInterestSet},
    query::JournalQuery,
};

pub mod inmemory;

/// Name identifying one projection, unique per supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionName(String);

impl ProjectionName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectionName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for ProjectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable progress of one projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState {
    pub name: ProjectionName,
    pub last_processed_event_id: Option<EventId>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub aggregate_version: AggregateVersion,
    pub global_position: JournalPosition,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionState {
    /// State of a projection that has processed nothing yet.
    #[must_use]
    pub fn initial(name: ProjectionName) -> Self {
        Self {
            name,
            last_processed_event_id: None,
            last_processed_at: None,
            aggregate_version: AggregateVersion::default(),
            global_position: JournalPosition::default(),
            updated_at: Utc::now(),
        }
    }

    /// State after successfully projecting a batch. An empty batch only
    /// refreshes `updated_at`; otherwise the cursor advances to the
    /// highest-position event.
    #[must_use]
    pub fn advanced(&self, events: &[JournalEvent]) -> Self {
        let now = Utc::now();
        let Some(last) = events
            .iter()
            .max_by_key(|event| event.journal_position())
        else {
            return Self {
                updated_at: now,
                ..self.clone()
            };
        };
        Self {
            name: self.name.clone(),
            last_processed_event_id: Some(last.event_id()),
            last_processed_at: Some(now),
            aggregate_version: last.aggregate_version(),
            global_position: last.journal_position(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    /// The projection rejected a batch; its state cursor is not advanced.
    #[error("projection failed: {0}")]
    Projection(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("projection state: {0}")]
    State(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Store(#[from] crate::store::EventStoreError),
}

/// A read model fed from the journal.
///
/// `query` (from [`JournalInquirer`]) declares the slice of the journal this
/// projection is built from; the supervisor derives both its notification
/// interests and its catch-up reads from that query.
#[async_trait]
pub trait Projector: JournalInquirer + Send + Sync {
    fn projection(&self) -> ProjectionName;

    /// Prepare the read model (create tables, indexes, ...). Must be
    /// idempotent; supervisors call it on every registration.
    async fn init(&self) -> Result<(), ProjectorError>;

    /// Fold a batch of events, ordered by journal position, into the read
    /// model.
    async fn project(&self, events: &[JournalEvent]) -> Result<(), ProjectorError>;
}

/// Notification interests implied by a projector's query: one per
/// `(aggregate type, event type)` pair it selects.
#[must_use]
pub fn interests_of(projector: &dyn Projector) -> EventInterestSet {
    let query = projector.query();
    query
        .by_type()
        .iter()
        .flat_map(|(aggregate_type, clause)| {
            clause.events.iter().map(move |event_type| EventInterest {
                aggregate_type: aggregate_type.clone(),
                event_type: event_type.clone(),
            })
        })
        .collect()
}

/// The projector's base query, resumed after the state's cursor.
#[must_use]
pub fn catch_up_query(base: &JournalQuery, state: &ProjectionState) -> JournalQuery {
    base.starting_after(state.global_position)
}

/// Shared projector bookkeeping used by every supervisor backend.
#[derive(Default)]
pub struct ProjectorRegistry {
    by_name: RwLock<HashMap<ProjectionName, Arc<dyn Projector>>>,
}

impl ProjectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, projector: Arc<dyn Projector>) {
        self.by_name
            .write()
            .expect("lock poisoned")
            .insert(projector.projection(), projector);
    }

    #[must_use]
    pub fn resolve(&self, name: &ProjectionName) -> Option<Arc<dyn Projector>> {
        self.by_name.read().expect("lock poisoned").get(name).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Projector>> {
        self.by_name
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Union of all registered projectors' interests.
    #[must_use]
    pub fn interests(&self) -> EventInterestSet {
        self.all()
            .iter()
            .flat_map(|projector| {
                interests_of(projector.as_ref())
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Projectors whose interests contain any of the given interests.
    #[must_use]
    pub fn interested_in(&self, interests: &[EventInterest]) -> Vec<Arc<dyn Projector>> {
        self.all()
            .into_iter()
            .filter(|projector| {
                let own = interests_of(projector.as_ref());
                interests.iter().any(|interest| own.contains(interest))
            })
            .collect()
    }
}

/// Drives registered projectors: catches them up when notified and on
/// explicit trigger. Doubles as the notifier's listener.
#[async_trait]
pub trait ProjectorSupervisor: crate::notifier::EventListener {
    /// Register a projector and run its `init`.
    async fn register(&self, projector: Arc<dyn Projector>) -> Result<(), ProjectorError>;

    /// Start reacting to notifications. Before this, notifications are
    /// ignored, so registration can complete before the first catch-up.
    fn enable(&self);

    /// Catch up the named projections now, and all of them if `names` is
    /// empty. Waits for projection locks rather than skipping. Unknown
    /// names and failures of individual projections are logged, not
    /// returned.
    async fn trigger(&self, names: &[ProjectionName]);
}
