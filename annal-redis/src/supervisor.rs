//! Projector supervisor with its state in Redis.
//!
//! Each projection's state lives as JSON under `projection:state:{name}:v1`
//! and is guarded by a distributed lock, so supervisors on different nodes
//! never run the same projection concurrently. The journal itself stays in
//! the primary store; Redis only holds cursors and locks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, instrument, warn};

use annal_core::{
    notifier::{EventInterest, EventInterestSet, EventListener},
    projector::{
        Projector, ProjectorError, ProjectorRegistry, ProjectorSupervisor, ProjectionName,
        ProjectionState, catch_up_query,
    },
    query::QueryOptions,
    store::EventStore,
};

use crate::lock::{LockGuard, LockManager};

fn state_key(name: &ProjectionName) -> String {
    format!("projection:state:{name}:v1")
}

fn lock_key(name: &ProjectionName) -> String {
    format!("projection:lock:{name}:v1")
}

fn state_error(error: impl std::error::Error + Send + Sync + 'static) -> ProjectorError {
    ProjectorError::State(Box::new(error))
}

/// [`ProjectorSupervisor`] holding projection state in Redis.
pub struct Supervisor {
    conn: ConnectionManager,
    store: Arc<dyn EventStore>,
    registry: ProjectorRegistry,
    locks: LockManager,
    started: AtomicBool,
}

impl Supervisor {
    #[must_use]
    pub fn new(conn: ConnectionManager, store: Arc<dyn EventStore>) -> Self {
        Self {
            locks: LockManager::new(conn.clone()),
            conn,
            store,
            registry: ProjectorRegistry::new(),
            started: AtomicBool::new(false),
        }
    }

    async fn load_state(&self, name: &ProjectionName) -> Result<ProjectionState, ProjectorError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(state_key(name)).await.map_err(state_error)?;
        match raw {
            None => Ok(ProjectionState::initial(name.clone())),
            Some(raw) => serde_json::from_str(&raw).map_err(state_error),
        }
    }

    async fn save_state(&self, state: &ProjectionState) -> Result<(), ProjectorError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(state).map_err(state_error)?;
        conn.set::<_, _, ()>(state_key(&state.name), raw)
            .await
            .map_err(state_error)
    }

    #[instrument(skip(self, projector), fields(projection = %projector.projection()))]
    async fn advance(
        &self,
        projector: Arc<dyn Projector>,
        wait: bool,
    ) -> Result<(), ProjectorError> {
        let name = projector.projection();
        let key = lock_key(&name);
        let guard: LockGuard = if wait {
            self.locks.acquire(&key).await.map_err(state_error)?
        } else {
            match self.locks.try_acquire(&key).await.map_err(state_error)? {
                Some(guard) => guard,
                None => {
                    debug!("projection locked elsewhere, skipping");
                    return Ok(());
                }
            }
        };

        let result = async {
            let state = self.load_state(&name).await?;
            let query = catch_up_query(&projector.query(), &state);
            let events = self
                .store
                .query(
                    &query,
                    QueryOptions::default().limit_to_oldest_running_transaction(),
                )
                .await?;
            projector.project(&events).await?;
            self.save_state(&state.advanced(&events)).await
        }
        .await;

        if let Err(release_error) = guard.release().await {
            warn!(%release_error, "failed to release projection lock");
        }
        result
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
