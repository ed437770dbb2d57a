//! Journal queries and query options.
//!
//! A [`JournalQuery`] selects journal rows by aggregate type, optionally
//! narrowed per type to one aggregate instance, a version cursor, or a set
//! of event types. Clauses for different aggregate types are combined with
//! OR; a global `position_after` cursor applies on top. The same query shape
//! drives aggregate rehydration, projector catch-up, and ad-hoc reads.

use std::collections::HashMap;

use crate::event::{AggregateId, AggregateType, AggregateVersion, EventType, JournalPosition};

/// Per-aggregate-type clause of a [`JournalQuery`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateQuery {
    /// Restrict to one aggregate instance.
    pub id: Option<AggregateId>,
    /// Only events with a version strictly greater than this.
    pub version_after: Option<AggregateVersion>,
    /// Only these event types. Empty means all.
    pub events: Vec<EventType>,
}

/// Declarative selection over the journal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalQuery {
    by_type: HashMap<AggregateType, AggregateQuery>,
    position_after: Option<JournalPosition>,
}

impl JournalQuery {
    #[must_use]
    pub fn builder() -> JournalQueryBuilder {
        JournalQueryBuilder::default()
    }

    #[must_use]
    pub fn by_type(&self) -> &HashMap<AggregateType, AggregateQuery> {
        &self.by_type
    }

    #[must_use]
    pub fn position_after(&self) -> Option<JournalPosition> {
        self.position_after
    }

    /// A query with no type clauses selects nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Copy of `self` with the position cursor replaced. Used by projector
    /// catch-up to resume a projector's base query after its last processed
    /// position.
    #[must_use]
    pub fn starting_after(&self, position: JournalPosition) -> Self {
        let mut query = self.clone();
        query.position_after = Some(position);
        query
    }
}

/// Builder for [`JournalQuery`]. Clauses are opened with
/// [`aggregate`](Self::aggregate) and closed with
/// [`finish`](AggregateQueryBuilder::finish).
#[derive(Debug, Default)]
#[must_use]
pub struct JournalQueryBuilder {
    query: JournalQuery,
}

impl JournalQueryBuilder {
    /// Open a clause for the given aggregate type. Re-opening a type merges
    /// into its existing clause.
    pub fn aggregate(self, aggregate_type: AggregateType) -> AggregateQueryBuilder {
        AggregateQueryBuilder {
            journal: self,
            aggregate_type,
            aggregate: AggregateQuery::default(),
        }
    }

    /// Only rows strictly after this journal position.
    pub fn position_after(mut self, position: JournalPosition) -> Self {
        self.query.position_after = Some(position);
        self
    }

    #[must_use]
    pub fn build(self) -> JournalQuery {
        self.query
    }
}

/// Builder for one per-type clause, returned by
/// [`JournalQueryBuilder::aggregate`].
#[derive(Debug)]
#[must_use]
pub struct AggregateQueryBuilder {
    journal: JournalQueryBuilder,
    aggregate_type: AggregateType,
    aggregate: AggregateQuery,
}

impl AggregateQueryBuilder {
    pub fn id(mut self, id: AggregateId) -> Self {
        self.aggregate.id = Some(id);
        self
    }

    /// Only events versioned strictly after this. Rehydration passes the
    /// version already reduced, so replay resumes where the viewer left off.
    pub fn version_after(mut self, version: AggregateVersion) -> Self {
        self.aggregate.version_after = Some(version);
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.aggregate.events.extend(events);
        self
    }

    /// Close the clause and return to the journal-level builder.
    pub fn finish(mut self) -> JournalQueryBuilder {
        let entry = self
            .journal
            .query
            .by_type
            .entry(self.aggregate_type)
            .or_default();
        if self.aggregate.id.is_some() {
            entry.id = self.aggregate.id;
        }
        if self.aggregate.version_after.is_some() {
            entry.version_after = self.aggregate.version_after;
        }
        entry.events.append(&mut self.aggregate.events);
        self.journal
    }
}

/// Per-call read options.
#[derive(Clone, Copy, Debug, Default)]
#[must_use]
pub struct QueryOptions {
    limit_to_oldest_running_transaction: bool,
    error_on_shredded: bool,
}

impl QueryOptions {
    /// Exclude rows committed after the oldest transaction still running
    /// when the query started. Projectors use this so a long-running append
    /// cannot commit "behind" a position the projector has already passed.
    pub fn limit_to_oldest_running_transaction(mut self) -> Self {
        self.limit_to_oldest_running_transaction = true;
        self
    }

    /// Fail the query if any returned event has a shredded encrypted field,
    /// instead of substituting defaults.
    pub fn error_on_shredded(mut self) -> Self {
        self.error_on_shredded = true;
        self
    }

    #[must_use]
    pub fn is_limited_to_oldest_running_transaction(self) -> bool {
        self.limit_to_oldest_running_transaction
    }

    #[must_use]
    pub fn errors_on_shredded(self) -> bool {
        self.error_on_shredded
    }
}
