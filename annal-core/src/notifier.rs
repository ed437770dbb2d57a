//! Change notification.
//!
//! A notifier watches the journal for freshly committed events and tells
//! registered listeners which `(aggregate type, event type)` pairs just
//! landed. Notifications carry no payloads and no ordering guarantees; they
//! are a wake-up signal, and listeners catch up through the journal itself.
//! Delivery is at-most-once per notifier process, so listeners must also
//! poll or be triggered out of band if they cannot afford to miss a cycle.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::watch;

use crate::event::{AggregateType, EventType};

pub mod inmemory;

/// Channel name prefix shared by all backends: one channel per aggregate
/// type, named `event_store_{aggregate_type}`, with the event type as the
/// notification payload.
pub const CHANNEL_PREFIX: &str = "event_store_";

/// Notification channel for an aggregate type.
#[must_use]
pub fn channel_for(aggregate_type: &AggregateType) -> String {
    format!("{CHANNEL_PREFIX}{aggregate_type}")
}

/// Reverse of [`channel_for`]. `None` if the channel does not carry the
/// expected prefix.
#[must_use]
pub fn interest_from_channel(channel: &str, payload: &str) -> Option<EventInterest> {
    let aggregate_type = channel.strip_prefix(CHANNEL_PREFIX)?;
    Some(EventInterest {
        aggregate_type: AggregateType::from(aggregate_type),
        event_type: EventType::from(payload),
    })
}

/// One `(aggregate type, event type)` pair a listener cares about, and the
/// unit in which notifications are delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventInterest {
    pub aggregate_type: AggregateType,
    pub event_type: EventType,
}

/// Deduplicated set of interests.
#[derive(Clone, Debug, Default)]
pub struct EventInterestSet {
    interests: HashSet<EventInterest>,
}

impl EventInterestSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, aggregate_type: AggregateType, event_type: EventType) {
        self.interests.insert(EventInterest {
            aggregate_type,
            event_type,
        });
    }

    #[must_use]
    pub fn contains(&self, interest: &EventInterest) -> bool {
        self.interests.contains(interest)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    /// Distinct aggregate types across all interests, which is the set of
    /// channels a backend needs to watch.
    #[must_use]
    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        let mut types: Vec<_> = self
            .interests
            .iter()
            .map(|interest| interest.aggregate_type.clone())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventInterest> {
        self.interests.iter()
    }
}

impl FromIterator<EventInterest> for EventInterestSet {
    fn from_iter<I: IntoIterator<Item = EventInterest>>(iter: I) -> Self {
        Self {
            interests: iter.into_iter().collect(),
        }
    }
}

/// Receiver of change notifications.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Interests this listener wants delivered.
    fn interests(&self) -> EventInterestSet;

    /// Deliver a batch of matched interests. Returning `false` asks the
    /// notifier to drop this listener.
    async fn notify(&self, interests: &[EventInterest]) -> bool;
}

#[derive(Debug, Error)]
pub enum NotifierError {
    /// The notification source failed repeatedly and the notifier gave up.
    #[error("notification source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Watches the journal and fans matched interests out to listeners.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    fn add_listener(&self, listener: std::sync::Arc<dyn EventListener>);

    /// Run the notification loop until `shutdown` flips to `true` or the
    /// source fails beyond recovery.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), NotifierError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_roundtrips() {
        let aggregate_type = AggregateType::from_static("club");
        let channel = channel_for(&aggregate_type);
        assert_eq!(channel, "event_store_club");

        let interest = interest_from_channel(&channel, "club_created").unwrap();
        assert_eq!(interest.aggregate_type, aggregate_type);
        assert_eq!(interest.event_type, EventType::from("club_created"));

        assert!(interest_from_channel("unrelated_channel", "x").is_none());
    }

    #[test]
    fn interest_set_deduplicates_aggregate_types() {
        let mut interests = EventInterestSet::new();
        interests.add(AggregateType::from_static("club"), EventType::from("a"));
        interests.add(AggregateType::from_static("club"), EventType::from("b"));
        interests.add(AggregateType::from_static("person"), EventType::from("c"));
        assert_eq!(
            interests.aggregate_types(),
            vec![
                AggregateType::from_static("club"),
                AggregateType::from_static("person")
            ]
        );
    }
}
