//! Aggregate identity, version matching, and the writer seam.
//!
//! Aggregates stay outside the store; what crosses the boundary is a
//! [`ChangeIntent`] (new events plus a concurrency precondition) on the way
//! in, and reduced [`JournalEvent`]s on the way out. [`BaseWriter`] is the
//! embeddable bookkeeping struct that keeps domain aggregates honest about
//! both directions.

use std::fmt;

use thiserror::Error;

use crate::{
    event::{AggregateId, AggregateType, AggregateVersion, DomainEvent, JournalEvent},
    query::JournalQuery,
};

/// Identity and known version of one aggregate instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    pub id: AggregateId,
    pub aggregate_type: AggregateType,
    pub version: AggregateVersion,
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.aggregate_type, self.id, self.version)
    }
}

/// Concurrency precondition attached to a [`ChangeIntent`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionMatcher {
    /// The intent's last known version must equal the persisted version.
    /// This is the optimistic-concurrency default.
    #[default]
    Exact,
    /// Append regardless of the persisted version. For streams where every
    /// writer appends independent facts (audit trails, metrics).
    Always,
}

impl VersionMatcher {
    /// Whether an intent recorded at `known` may append on top of `actual`.
    #[must_use]
    pub fn matches(self, known: AggregateVersion, actual: AggregateVersion) -> bool {
        match self {
            Self::Exact => known == actual,
            Self::Always => true,
        }
    }
}

/// Error raised while constructing a [`ChangeIntent`] from events that do
/// not all target the intent's aggregate.
#[derive(Debug, Error)]
#[error("event {event_index} targets {found_type}/{found_id}, intent is for {aggregate}")]
pub struct ForeignEventError {
    pub aggregate: Aggregate,
    pub event_index: usize,
    pub found_id: AggregateId,
    pub found_type: AggregateType,
}

/// A batch of uncommitted events for one aggregate, plus the version the
/// producer last observed and the matcher deciding how strictly that
/// version is enforced.
pub struct ChangeIntent {
    aggregate: Aggregate,
    events: Vec<Box<dyn DomainEvent>>,
    matcher: VersionMatcher,
}

impl ChangeIntent {
    /// Build an intent, verifying that every event targets the intent's
    /// aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`ForeignEventError`] naming the first offending event.
    pub fn new(
        aggregate: Aggregate,
        events: Vec<Box<dyn DomainEvent>>,
        matcher: VersionMatcher,
    ) -> Result<Self, ForeignEventError> {
        for (event_index, event) in events.iter().enumerate() {
            if event.aggregate_id() != &aggregate.id
                || event.aggregate_type() != aggregate.aggregate_type
            {
                return Err(ForeignEventError {
                    found_id: event.aggregate_id().clone(),
                    found_type: event.aggregate_type(),
                    aggregate,
                    event_index,
                });
            }
        }
        Ok(Self {
            aggregate,
            events,
            matcher,
        })
    }

    /// Build without the target check. [`BaseWriter`] only ever records
    /// events for its own aggregate, so its drain path skips the scan.
    pub(crate) fn new_unchecked(
        aggregate: Aggregate,
        events: Vec<Box<dyn DomainEvent>>,
        matcher: VersionMatcher,
    ) -> Self {
        Self {
            aggregate,
            events,
            matcher,
        }
    }

    #[must_use]
    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    #[must_use]
    pub fn events(&self) -> &[Box<dyn DomainEvent>] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [Box<dyn DomainEvent>] {
        &mut self.events
    }

    pub(crate) fn into_events(self) -> Vec<Box<dyn DomainEvent>> {
        self.events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn last_known_version(&self) -> AggregateVersion {
        self.aggregate.version
    }

    /// Whether this intent may append on top of the given persisted version.
    #[must_use]
    pub fn version_matches(&self, actual: AggregateVersion) -> bool {
        self.matcher.matches(self.aggregate.version, actual)
    }
}

impl fmt::Debug for ChangeIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeIntent")
            .field("aggregate", &self.aggregate)
            .field("events", &self.events.len())
            .field("matcher", &self.matcher)
            .finish()
    }
}

/// Anything that can state which slice of the journal it wants to see.
pub trait JournalInquirer {
    fn query(&self) -> JournalQuery;
}

/// A read-model over the journal: states its query and folds the resulting
/// events into itself.
pub trait JournalViewer: JournalInquirer + Send {
    fn reduce(&mut self, events: &[JournalEvent]);
}

/// Anything that produces change intents. Draining semantics: a call hands
/// over all recorded events and leaves the producer empty.
pub trait ChangeProducer {
    fn changes(&mut self) -> ChangeIntent;
}

/// A domain aggregate as the store sees it: replayable and productive.
pub trait Writer: JournalViewer + ChangeProducer {}

impl<T: JournalViewer + ChangeProducer> Writer for T {}

/// Embeddable bookkeeping for domain aggregates.
///
/// Tracks the persisted version, buffers uncommitted events, and produces
/// the [`ChangeIntent`] snapshotting both. Domain aggregates hold one of
/// these, delegate `changes` and version advancement to it, and keep their
/// own state machine on top.
pub struct BaseWriter {
    aggregate_id: AggregateId,
    aggregate_type: AggregateType,
    version: AggregateVersion,
    pending: Vec<Box<dyn DomainEvent>>,
    matcher: VersionMatcher,
}

impl BaseWriter {
    #[must_use]
    pub fn new(aggregate_id: AggregateId, aggregate_type: AggregateType) -> Self {
        Self::with_matcher(aggregate_id, aggregate_type, VersionMatcher::default())
    }

    #[must_use]
    pub fn with_matcher(
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        matcher: VersionMatcher,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type,
            version: AggregateVersion::default(),
            pending: Vec::new(),
            matcher,
        }
    }

    #[must_use]
    pub fn id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    #[must_use]
    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    #[must_use]
    pub fn version(&self) -> AggregateVersion {
        self.version
    }

    #[must_use]
    pub fn aggregate(&self) -> Aggregate {
        Aggregate {
            id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            version: self.version,
        }
    }

    /// Record an uncommitted event. The caller has already applied the
    /// event's effect to its own state.
    pub fn append(&mut self, event: Box<dyn DomainEvent>) {
        self.pending.push(event);
    }

    /// Drain all recorded events into an intent pinned at the version this
    /// writer last reduced to.
    pub fn changes(&mut self) -> ChangeIntent {
        let events = std::mem::take(&mut self.pending);
        ChangeIntent::new_unchecked(self.aggregate(), events, self.matcher)
    }

    /// Advance the persisted version to that of the last reduced event.
    /// Events are folded by the owning aggregate; this only moves the
    /// version cursor.
    pub fn reduce(&mut self, events: &[JournalEvent]) {
        if let Some(last) = events.last() {
            self.version = last.aggregate_version();
        }
    }
}

impl fmt::Debug for BaseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseWriter")
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_type", &self.aggregate_type)
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .field("matcher", &self.matcher)
            .finish()
    }
}

/// A command arrived while the aggregate was in a state that cannot accept
/// it. Aggregates raise this from their command methods without recording
/// any event.
#[derive(Debug, Error)]
#[error("aggregate {aggregate} is in state {actual}, command requires {expected}")]
pub struct InvalidStateError {
    pub aggregate: Aggregate,
    pub expected: String,
    pub actual: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{CLUB, ClubCreated};

    fn club_created(id: &str) -> Box<dyn DomainEvent> {
        Box::new(ClubCreated {
            club_id: AggregateId::from(id),
            name: "FC Awesome".to_owned(),
            slug: "fc-awesome".to_owned(),
        })
    }

    #[test]
    fn exact_matcher_requires_equal_versions() {
        assert!(VersionMatcher::Exact.matches(AggregateVersion(2), AggregateVersion(2)));
        assert!(!VersionMatcher::Exact.matches(AggregateVersion(2), AggregateVersion(3)));
        assert!(VersionMatcher::Always.matches(AggregateVersion(0), AggregateVersion(7)));
    }

    #[test]
    fn intent_rejects_events_for_other_aggregates() {
        let aggregate = Aggregate {
            id: AggregateId::from("club-1"),
            aggregate_type: CLUB,
            version: AggregateVersion::default(),
        };
        let error = ChangeIntent::new(
            aggregate,
            vec![club_created("club-2")],
            VersionMatcher::Exact,
        )
        .unwrap_err();
        assert_eq!(error.event_index, 0);
        assert_eq!(error.found_id, AggregateId::from("club-2"));
    }

    #[test]
    fn changes_drains_pending_events() {
        let mut writer = BaseWriter::new(AggregateId::from("club-1"), CLUB);
        writer.append(club_created("club-1"));

        let intent = writer.changes();
        assert_eq!(intent.len(), 1);
        assert_eq!(intent.last_known_version(), AggregateVersion(0));

        let empty = writer.changes();
        assert!(empty.is_empty());
    }
}
