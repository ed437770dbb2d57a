//! In-memory notifier backed by a broadcast channel.
//!
//! The in-memory store publishes one [`EventInterest`] per appended event on
//! a broadcast channel; this notifier subscribes, filters against each
//! listener's interests, and fans out. It mirrors the delivery contract of
//! the production notifiers, including bounded retries and listener
//! eviction, so supervisor behaviour can be tested without a database.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::notifier::{EventInterest, EventListener, EventNotifier, NotifierError};

const MAX_RECEIVE_RETRIES: u32 = 3;

/// [`EventNotifier`] over a [`broadcast`] channel of interests.
pub struct BroadcastNotifier {
    source: broadcast::Sender<EventInterest>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl BroadcastNotifier {
    #[must_use]
    pub fn new(source: broadcast::Sender<EventInterest>) -> Self {
        Self {
            source,
            listeners: RwLock::new(Vec::new()),
        }
    }

    async fn dispatch(&self, interest: EventInterest) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|listener| listener.interests().contains(&interest))
            .cloned()
            .collect();

        let batch = [interest];
        for listener in listeners {
            if !listener.notify(&batch).await {
                debug!("evicting listener that declined notification");
                self.listeners
                    .write()
                    .expect("lock poisoned")
                    .retain(|kept| !Arc::ptr_eq(kept, &listener));
            }
        }
    }
}

#[async_trait]
impl EventNotifier for BroadcastNotifier {
    fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().expect("lock poisoned").push(listener);
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), NotifierError> {
        let mut receiver = self.source.subscribe();
        let mut retries = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                received = receiver.recv() => match received {
                    Ok(interest) => {
                        retries = 0;
                        self.dispatch(interest).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        retries += 1;
                        warn!(skipped, retries, "notification receiver lagged");
                        if retries >= MAX_RECEIVE_RETRIES {
                            return Err(NotifierError::Source(
                                broadcast::error::RecvError::Lagged(skipped).into(),
                            ));
                        }
                    }
                    // Source dropped: the store is gone, stop cleanly.
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}
