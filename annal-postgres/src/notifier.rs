//! LISTEN/NOTIFY-backed [`EventNotifier`].
//!
//! The journal's insert trigger emits one notification per appended event
//! on `event_store_{aggregate_type}` with the event type as payload. This
//! notifier listens on the channels its listeners are interested in and
//! fans matched interests out. Notifications are a wake-up only; Postgres
//! drops them if no listener is connected, so consumers must also trigger
//! catch-up on startup.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgListener};
use tokio::sync::watch;
use tracing::{debug, warn};

use annal_core::notifier::{
    EventInterest, EventListener, EventNotifier, NotifierError, channel_for, interest_from_channel,
};

const MAX_RECEIVE_RETRIES: u32 = 3;

pub struct PgEventNotifier {
    pool: PgPool,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl PgEventNotifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .listeners
            .read()
            .expect("lock poisoned")
            .iter()
            .flat_map(|listener| {
                listener
                    .interests()
                    .aggregate_types()
                    .iter()
                    .map(channel_for)
                    .collect::<Vec<_>>()
            })
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
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
impl EventNotifier for PgEventNotifier {
    /// Register a listener. Channels are subscribed when [`run`] starts, so
    /// all listeners must be added before the notifier is run.
    ///
    /// [`run`]: EventNotifier::run
    fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().expect("lock poisoned").push(listener);
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), NotifierError> {
        let channels = self.channels();
        if channels.is_empty() {
            debug!("no listener interests, notifier idle");
            shutdown
                .wait_for(|stopped| *stopped)
                .await
                .map_err(|closed| NotifierError::Source(closed.into()))?;
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|db_error| NotifierError::Source(db_error.into()))?;
        let channel_refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener
            .listen_all(channel_refs)
            .await
            .map_err(|db_error| NotifierError::Source(db_error.into()))?;

        let mut retries = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                received = listener.recv() => match received {
                    Ok(notification) => {
                        retries = 0;
                        match interest_from_channel(
                            notification.channel(),
                            notification.payload(),
                        ) {
                            Some(interest) => self.dispatch(interest).await,
                            None => debug!(
                                channel = notification.channel(),
                                "ignoring notification on unknown channel"
                            ),
                        }
                    }
                    // PgListener reconnects internally; recv only fails when
                    // reconnection itself keeps failing.
                    Err(db_error) => {
                        retries += 1;
                        warn!(%db_error, retries, "notification receive failed");
                        if retries >= MAX_RECEIVE_RETRIES {
                            return Err(NotifierError::Source(db_error.into()));
                        }
                    }
                },
            }
        }
    }
}
