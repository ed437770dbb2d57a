//! In-memory projector supervisor.
//!
//! Holds projection state in a map and serializes runs of each projection
//! with a per-name async mutex. A notification cycle uses try-lock
//! semantics (a busy projection is skipped; the running pass will observe
//! the new events anyway), while an explicit trigger waits for the lock.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::{
    notifier::{EventInterest, EventInterestSet, EventListener},
    projector::{
        Projector, ProjectorError, ProjectorRegistry, ProjectorSupervisor, ProjectionName,
        ProjectionState, catch_up_query,
    },
    query::QueryOptions,
    store::EventStore,
};

/// [`ProjectorSupervisor`] backed by process-local state.
pub struct Supervisor {
    store: Arc<dyn EventStore>,
    registry: ProjectorRegistry,
    locks: Mutex<HashMap<ProjectionName, Arc<tokio::sync::Mutex<()>>>>,
    states: RwLock<HashMap<ProjectionName, ProjectionState>>,
    started: AtomicBool,
}

impl Supervisor {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            registry: ProjectorRegistry::new(),
            locks: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Current state of a projection, if it has ever run.
    #[must_use]
    pub fn state(&self, name: &ProjectionName) -> Option<ProjectionState> {
        self.states.read().expect("lock poisoned").get(name).cloned()
    }

    fn lock_for(&self, name: &ProjectionName) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("lock poisoned")
            .entry(name.clone())
            .or_default()
            .clone()
    }

    #[instrument(skip(self, projector), fields(projection = %projector.projection()))]
    async fn advance(&self, projector: Arc<dyn Projector>, wait: bool) -> Result<(), ProjectorError> {
        let name = projector.projection();
        let lock = self.lock_for(&name);
        let _guard = if wait {
            lock.lock_owned().await
        } else {
            match lock.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("projection busy, skipping");
                    return Ok(());
                }
            }
        };

        let state = self
            .state(&name)
            .unwrap_or_else(|| ProjectionState::initial(name.clone()));
        let query = catch_up_query(&projector.query(), &state);
        let events = self
            .store
            .query(
                &query,
                QueryOptions::default().limit_to_oldest_running_transaction(),
            )
            .await?;
        projector.project(&events).await?;

        let advanced = state.advanced(&events);
        self.states
            .write()
            .expect("lock poisoned")
            .insert(name, advanced);
        Ok(())
    }

    async fn advance_all(&self, projectors: Vec<Arc<dyn Projector>>, wait: bool) {
        for projector in projectors {
            let name = projector.projection();
            if let Err(error) = self.advance(projector, wait).await {
                warn!(projection = %name, %error, "projection catch-up failed");
            }
        }
    }
}

#[async_trait]
impl EventListener for Supervisor {
    fn interests(&self) -> EventInterestSet {
        self.registry.interests()
    }

    async fn notify(&self, interests: &[EventInterest]) -> bool {
        // Not enabled yet: swallow the cycle but stay registered.
        if !self.started.load(Ordering::SeqCst) {
            return true;
        }
        let interested = self.registry.interested_in(interests);
        self.advance_all(interested, false).await;
        true
    }
}

#[async_trait]
impl ProjectorSupervisor for Supervisor {
    async fn register(&self, projector: Arc<dyn Projector>) -> Result<(), ProjectorError> {
        projector.init().await?;
        self.registry.register(projector);
        Ok(())
    }

    fn enable(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn trigger(&self, names: &[ProjectionName]) {
        let projectors = if names.is_empty() {
            self.registry.all()
        } else {
            names
                .iter()
                .filter_map(|name| {
                    let projector = self.registry.resolve(name);
                    if projector.is_none() {
                        warn!(projection = %name, "unknown projection, skipping");
                    }
                    projector
                })
                .collect()
        };
        self.advance_all(projectors, true).await;
    }
}
