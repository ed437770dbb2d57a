//! Projector supervisor with its state in the `projection_state` table.
//!
//! Mutual exclusion between supervisor instances on different nodes uses
//! row locks on the state table: a notification cycle takes the row with
//! `FOR UPDATE NOWAIT` and skips when another instance is already catching
//! up, while an explicit trigger waits for the lock. Projectors may opt
//! into running inside the state transaction, so their read model and
//! their cursor commit atomically.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use annal_core::{
    event::{AggregateVersion, EventId, JournalEvent, JournalPosition},
    notifier::{EventInterest, EventInterestSet, EventListener},
    projector::{
        Projector, ProjectorError, ProjectorRegistry, ProjectorSupervisor, ProjectionName,
        ProjectionState, catch_up_query,
    },
    query::QueryOptions,
    store::EventStore,
};

use crate::error::{Error, is_lock_not_available};

/// A projector whose read model lives in the same database as the journal.
///
/// The default implementation ignores the transaction and delegates to
/// [`Projector::project`]; override `project_in_tx` to write the read model
/// through the supervisor's connection so it commits together with the
/// projection cursor.
#[async_trait]
pub trait PostgresProjector: Projector {
    async fn project_in_tx(
        &self,
        conn: &mut PgConnection,
        events: &[JournalEvent],
    ) -> Result<(), ProjectorError> {
        let _ = conn;
        self.project(events).await
    }
}

/// [`ProjectorSupervisor`] holding projection state in Postgres.
pub struct Supervisor {
    pool: PgPool,
    store: Arc<dyn EventStore>,
    registry: ProjectorRegistry,
    transactional: RwLock<HashMap<ProjectionName, Arc<dyn PostgresProjector>>>,
    started: AtomicBool,
}

impl Supervisor {
    #[must_use]
    pub fn new(pool: PgPool, store: Arc<dyn EventStore>) -> Self {
        Self {
            pool,
            store,
            registry: ProjectorRegistry::new(),
            transactional: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a projector that writes its read model through the state
    /// transaction, and run its `init`.
    ///
    /// # Errors
    ///
    /// Propagates the projector's `init` failure.
    pub async fn register_transactional(
        &self,
        projector: Arc<dyn PostgresProjector>,
    ) -> Result<(), ProjectorError> {
        projector.init().await?;
        self.transactional
            .write()
            .expect("lock poisoned")
            .insert(projector.projection(), projector.clone());
        self.registry.register(projector);
        Ok(())
    }

    async fn lock_state(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        name: &ProjectionName,
        wait: bool,
    ) -> Result<Option<Option<ProjectionState>>, ProjectorError> {
        let lock_clause = if wait { "FOR UPDATE" } else { "FOR UPDATE NOWAIT" };
        let row = sqlx::query(&format!(
            "SELECT name, last_processed_event_id, last_processed_at, \
                    aggregate_version, global_position, updated_at \
             FROM projection_state WHERE name = $1 {lock_clause}"
        ))
        .bind(name.as_str())
        .fetch_optional(&mut **tx)
        .await;

        match row {
            Ok(None) => Ok(Some(None)),
            Ok(Some(row)) => {
                let version: i64 = row.try_get("aggregate_version").map_err(state_error)?;
                let position: Decimal = row.try_get("global_position").map_err(state_error)?;
                let event_id: Option<Uuid> =
                    row.try_get("last_processed_event_id").map_err(state_error)?;
                Ok(Some(Some(ProjectionState {
                    name: name.clone(),
                    last_processed_event_id: event_id.map(EventId::new),
                    last_processed_at: row.try_get("last_processed_at").map_err(state_error)?,
                    aggregate_version: AggregateVersion(
                        u64::try_from(version).map_err(|_| {
                            state_error(Error::InvalidVersion(version))
                        })?,
                    ),
                    global_position: JournalPosition::from(position),
                    updated_at: row.try_get("updated_at").map_err(state_error)?,
                })))
            }
            Err(db_error) if is_lock_not_available(&db_error) => Ok(None),
            Err(db_error) => Err(state_error(db_error)),
        }
    }

    #[instrument(skip(self, projector), fields(projection = %projector.projection()))]
    async fn advance(
        &self,
        projector: Arc<dyn Projector>,
        wait: bool,
    ) -> Result<(), ProjectorError> {
        let name = projector.projection();
        let mut tx = self.pool.begin().await.map_err(state_error)?;

        let state = match Self::lock_state(&mut tx, &name, wait).await? {
            None => {
                debug!("projection state locked elsewhere, skipping");
                return Ok(());
            }
            Some(Some(state)) => state,
            Some(None) => {
                // First run: create the row, then lock it like any other.
                sqlx::query(
                    r"
                    INSERT INTO projection_state (name) VALUES ($1)
                    ON CONFLICT (name) DO NOTHING
                    ",
                )
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(state_error)?;
                match Self::lock_state(&mut tx, &name, wait).await? {
                    None => {
                        debug!("projection state locked elsewhere, skipping");
                        return Ok(());
                    }
                    Some(state) => state.unwrap_or_else(|| ProjectionState::initial(name.clone())),
                }
            }
        };

        let query = catch_up_query(&projector.query(), &state);
        let events = self
            .store
            .query(
                &query,
                QueryOptions::default().limit_to_oldest_running_transaction(),
            )
            .await?;

        let transactional = self
            .transactional
            .read()
            .expect("lock poisoned")
            .get(&name)
            .cloned();
        match transactional {
            Some(tx_projector) => tx_projector.project_in_tx(&mut tx, &events).await?,
            None => projector.project(&events).await?,
        }

        let advanced = state.advanced(&events);
        let version = i64::try_from(advanced.aggregate_version.0)
            .map_err(|_| state_error(Error::VersionOverflow(advanced.aggregate_version.0)))?;
        sqlx::query(
            r"
            UPDATE projection_state
            SET last_processed_event_id = $2,
                last_processed_at = $3,
                aggregate_version = $4,
                global_position = $5,
                updated_at = $6
            WHERE name = $1
            ",
        )
        .bind(name.as_str())
        .bind(advanced.last_processed_event_id.map(EventId::into_inner))
        .bind(advanced.last_processed_at)
        .bind(version)
        .bind(advanced.global_position.into_inner())
        .bind(advanced.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(state_error)?;

        tx.commit().await.map_err(state_error)?;
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

fn state_error(error: impl std::error::Error + Send + Sync + 'static) -> ProjectorError {
    ProjectorError::State(Box::new(error))
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
