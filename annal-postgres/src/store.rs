//! Postgres-backed [`EventStore`].
//!
//! Appends run in a single transaction: the latest journal row of the
//! target aggregate is locked with `FOR UPDATE`, so concurrent appends on
//! one aggregate queue behind the current writer and re-validate once it
//! commits or rolls back. With [`Store::with_lock_timeout`] set, waiting
//! past the timeout surfaces as [`EventStoreError::IntentOutdated`].
//! Constraint and lookup maintenance run next, tagged fields are encrypted,
//! and the journal insert commits the lot. Positions come from a sequence,
//! versions from the locked row.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, types::Json};
use tracing::error;
use uuid::Uuid;

use annal_core::{
    aggregate::ChangeIntent,
    crypto::{CryptoError, EventCrypto, NoCrypto},
    event::{
        AggregateId, AggregateVersion, DomainEvent, EventId, EventVersion, EventType, IdGen,
        JournalEvent, JournalEventMapper, JournalPosition, JournalRecord, UuidGen,
    },
    query::{JournalQuery, QueryOptions},
    store::{EventStore, EventStoreError, Hook, LookupFieldValue, LookupQuery},
};

use crate::error::{Error, is_lock_not_available, unique_violation};

/// Upper bound excluding rows committed after the oldest transaction that
/// was already running when the query started. A projector reading with
/// this bound can never skip past an event still being appended.
const OLDEST_RUNNING_TRANSACTION: &str = "(SELECT COALESCE(min(xact_start), now()) \
     FROM pg_stat_activity \
     WHERE datname = current_database() AND state <> 'idle')";

const JOURNAL_COLUMNS: &str = "id, aggregate_id, aggregate_type, aggregate_version, \
     event_type, event_version, payload, global_position, created_at";

/// A Postgres-backed [`EventStore`]. Cloning shares the pool and hooks.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    mapper: Arc<dyn JournalEventMapper>,
    crypto: Arc<dyn EventCrypto>,
    ids: Arc<dyn IdGen>,
    hooks: Arc<RwLock<Vec<Arc<dyn Hook>>>>,
    lock_timeout: Option<Duration>,
}

impl Store {
    /// A store without field encryption.
    #[must_use]
    pub fn new(pool: PgPool, mapper: Arc<dyn JournalEventMapper>) -> Self {
        Self::with_crypto(pool, mapper, Arc::new(NoCrypto))
    }

    #[must_use]
    pub fn with_crypto(
        pool: PgPool,
        mapper: Arc<dyn JournalEventMapper>,
        crypto: Arc<dyn EventCrypto>,
    ) -> Self {
        Self {
            pool,
            mapper,
            crypto,
            ids: Arc::new(UuidGen),
            hooks: Arc::new(RwLock::new(Vec::new())),
            lock_timeout: None,
        }
    }

    /// Replace the event-id source. Tests use this for deterministic ids.
    #[must_use]
    pub fn with_id_gen(mut self, ids: Arc<dyn IdGen>) -> Self {
        self.ids = ids;
        self
    }

    /// Bound how long an append waits for another writer's row lock.
    /// Expiry surfaces as [`EventStoreError::IntentOutdated`]. Without a
    /// timeout, appends wait until the competing transaction finishes.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the initial schema (idempotent). See [`crate::schema::migrate`].
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any schema query fails.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        crate::schema::migrate(&self.pool).await
    }

    /// Lock the latest journal row of the intent's aggregate, waiting for
    /// any in-flight append to commit or roll back first. A `lock_timeout`
    /// expiry raises `55P03` just like `NOWAIT` would.
    async fn locked_version(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        intent: &ChangeIntent,
    ) -> Result<AggregateVersion, EventStoreError> {
        let aggregate = intent.aggregate();
        let locked: Option<i64> = sqlx::query_scalar(
            r"
            SELECT aggregate_version FROM event_journal
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY aggregate_version DESC
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(aggregate.aggregate_type.as_str())
        .bind(aggregate.id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|db_error| {
            if is_lock_not_available(&db_error) {
                EventStoreError::IntentOutdated
            } else {
                Error::from(db_error).into()
            }
        })?;

        match locked {
            None => Ok(AggregateVersion::default()),
            Some(version) => Ok(AggregateVersion(
                u64::try_from(version).map_err(|_| Error::InvalidVersion(version))?,
            )),
        }
    }

    async fn maintain_side_tables(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        intent: &ChangeIntent,
    ) -> Result<(), EventStoreError> {
        let aggregate_type = intent.aggregate().aggregate_type.clone();
        for event in intent.events() {
            for removal in event.unique_constraints_to_remove() {
                if removal.is_delete_all() {
                    sqlx::query(r"DELETE FROM unique_constraint WHERE owner_aggregate_id = $1")
                        .bind(removal.owner().as_str())
                        .execute(&mut **tx)
                        .await
                        .map_err(Error::from)?;
                } else {
                    sqlx::query(
                        r"
                        DELETE FROM unique_constraint
                        WHERE field = $1 AND value = $2 AND owner_aggregate_id = $3
                        ",
                    )
                    .bind(removal.field())
                    .bind(removal.value())
                    .bind(removal.owner().as_str())
                    .execute(&mut **tx)
                    .await
                    .map_err(Error::from)?;
                }
            }

            let additions = event.unique_constraints_to_add();
            if !additions.is_empty() {
                let mut qb = QueryBuilder::<Postgres>::new(
                    "INSERT INTO unique_constraint (field, value, owner_aggregate_id) ",
                );
                qb.push_values(&additions, |mut b, constraint| {
                    b.push_bind(constraint.field());
                    b.push_bind(constraint.value());
                    b.push_bind(constraint.owner().as_str());
                });
                qb.build().execute(&mut **tx).await.map_err(|db_error| {
                    match unique_violation(&db_error) {
                        Some(violation) => EventStoreError::from(violation),
                        None => Error::from(db_error).into(),
                    }
                })?;
            }

            for (field_name, field_value) in event.lookup_values() {
                sqlx::query(
                    r"
                    INSERT INTO event_journal_lookup
                        (id, owner_aggregate_id, aggregate_type, field_name, field_value)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (owner_aggregate_id, field_name)
                    DO UPDATE SET field_value = EXCLUDED.field_value
                    ",
                )
                .bind(Uuid::new_v4())
                .bind(event.aggregate_id().as_str())
                .bind(aggregate_type.as_str())
                .bind(field_name.as_str())
                .bind(field_value.as_str())
                .execute(&mut **tx)
                .await
                .map_err(Error::from)?;
            }

            for field_name in event.lookup_removals() {
                sqlx::query(
                    r"
                    DELETE FROM event_journal_lookup
                    WHERE owner_aggregate_id = $1 AND field_name = $2
                    ",
                )
                .bind(event.aggregate_id().as_str())
                .bind(field_name.as_str())
                .execute(&mut **tx)
                .await
                .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    async fn insert_events(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        base_version: AggregateVersion,
        events: &[Box<dyn DomainEvent>],
    ) -> Result<Vec<JournalRecord>, EventStoreError> {
        struct PendingRow {
            event_id: EventId,
            aggregate_id: AggregateId,
            aggregate_type: annal_core::event::AggregateType,
            aggregate_version: AggregateVersion,
            event_type: EventType,
            event_version: EventVersion,
            payload: serde_json::Value,
        }

        let mut pending = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let aggregate_version = base_version.incremented_by(offset as u64 + 1);
            pending.push(PendingRow {
                event_id: self.ids.next_id(),
                aggregate_id: event.aggregate_id().clone(),
                aggregate_type: event.aggregate_type(),
                aggregate_version,
                event_type: event.event_type(),
                event_version: event.event_version(),
                payload: event.payload()?,
            });
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO event_journal \
             (id, aggregate_id, aggregate_type, aggregate_version, event_type, event_version, payload) ",
        );
        let mut bind_error = None;
        qb.push_values(&pending, |mut b, row| {
            b.push_bind(row.event_id.into_inner());
            b.push_bind(row.aggregate_id.as_str());
            b.push_bind(row.aggregate_type.as_str());
            match i64::try_from(row.aggregate_version.0) {
                Ok(version) => {
                    b.push_bind(version);
                }
                Err(_) => {
                    bind_error = Some(Error::VersionOverflow(row.aggregate_version.0));
                    b.push_bind(0_i64);
                }
            }
            b.push_bind(row.event_type.as_str());
            b.push_bind(row.event_version.as_str());
            b.push_bind(Json(row.payload.clone()));
        });
        if let Some(overflow) = bind_error {
            return Err(overflow.into());
        }
        qb.push(" RETURNING id, global_position, created_at");

        let returned = qb.build().fetch_all(&mut **tx).await.map_err(Error::from)?;
        if returned.len() != pending.len() {
            return Err(Error::MissingReturnedRow.into());
        }

        let mut records = Vec::with_capacity(pending.len());
        for (row, returned_row) in pending.into_iter().zip(returned) {
            let position: Decimal = returned_row.try_get("global_position").map_err(Error::from)?;
            let created_at: DateTime<Utc> =
                returned_row.try_get("created_at").map_err(Error::from)?;
            records.push(JournalRecord {
                event_id: row.event_id,
                aggregate_id: row.aggregate_id,
                aggregate_type: row.aggregate_type,
                aggregate_version: row.aggregate_version,
                journal_position: JournalPosition::from(position),
                event_type: row.event_type,
                event_version: row.event_version,
                payload: row.payload,
                inserted_at: created_at,
            });
        }
        Ok(records)
    }

    async fn map_and_decrypt(
        &self,
        rows: Vec<JournalRecord>,
        options: QueryOptions,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        let mut events = rows
            .into_iter()
            .map(|row| self.mapper.map(row))
            .collect::<Result<Vec<_>, _>>()?;
        self.crypto.decrypt_events(&mut events).await?;
        if options.errors_on_shredded()
            && let Some(shredded) = events.iter().find(|event| event.event().is_shredded())
        {
            return Err(CryptoError::AggregateShredded(
                shredded.event().aggregate_id().clone(),
            )
            .into());
        }
        Ok(events)
    }

    fn journal_row(row: &sqlx::postgres::PgRow) -> Result<JournalRecord, Error> {
        let version: i64 = row.try_get("aggregate_version")?;
        let position: Decimal = row.try_get("global_position")?;
        let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
        Ok(JournalRecord {
            event_id: EventId::new(row.try_get("id")?),
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
            aggregate_type: row.try_get::<String, _>("aggregate_type")?.into(),
            aggregate_version: AggregateVersion(
                u64::try_from(version).map_err(|_| Error::InvalidVersion(version))?,
            ),
            journal_position: JournalPosition::from(position),
            event_type: row.try_get::<String, _>("event_type")?.into(),
            event_version: row.try_get::<String, _>("event_version")?.into(),
            payload,
            inserted_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl EventStore for Store {
    #[tracing::instrument(skip_all, fields(intents = intents.len()))]
    async fn append(
        &self,
        mut intents: Vec<ChangeIntent>,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        if intents.len() > 1 {
            return Err(EventStoreError::UnsupportedIntentCount(intents.len()));
        }
        let Some(mut intent) = intents.pop() else {
            return Ok(Vec::new());
        };
        if intent.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        if let Some(timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(Error::from)?;
        }

        let actual = Self::locked_version(&mut tx, &intent).await?;
        if !intent.version_matches(actual) {
            return Err(EventStoreError::VersionConflict {
                expected: intent.last_known_version(),
                actual,
            });
        }

        Self::maintain_side_tables(&mut tx, &intent).await?;

        self.crypto.encrypt_events(intent.events_mut()).await?;
        let records = self.insert_events(&mut tx, actual, intent.events()).await?;

        tx.commit().await.map_err(Error::from)?;

        let persisted = self
            .map_and_decrypt(records, QueryOptions::default())
            .await?;

        let hooks: Vec<_> = self
            .hooks
            .read()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect();
        for hook in hooks {
            if let Err(hook_error) = hook.post_persist(&persisted).await {
                error!(error = %hook_error, "post-persist hook failed");
            }
        }

        Ok(persisted)
    }

    #[tracing::instrument(skip_all)]
    async fn query(
        &self,
        query: &JournalQuery,
        options: QueryOptions,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {JOURNAL_COLUMNS} FROM event_journal WHERE ("
        ));
        for (index, (aggregate_type, clause)) in query.by_type().iter().enumerate() {
            if index > 0 {
                qb.push(" OR ");
            }
            qb.push("(aggregate_type = ");
            qb.push_bind(aggregate_type.as_str().to_owned());
            if let Some(id) = &clause.id {
                qb.push(" AND aggregate_id = ");
                qb.push_bind(id.as_str().to_owned());
            }
            if let Some(version_after) = clause.version_after {
                qb.push(" AND aggregate_version > ");
                qb.push_bind(i64::try_from(version_after.0).unwrap_or(i64::MAX));
            }
            if !clause.events.is_empty() {
                let event_types: Vec<String> = clause
                    .events
                    .iter()
                    .map(|event_type| event_type.as_str().to_owned())
                    .collect();
                qb.push(" AND event_type = ANY(");
                qb.push_bind(event_types);
                qb.push(")");
            }
            qb.push(")");
        }
        qb.push(")");

        if let Some(position) = query.position_after() {
            qb.push(" AND global_position > ");
            qb.push_bind(position.into_inner());
        }
        if options.is_limited_to_oldest_running_transaction() {
            qb.push(format!(" AND created_at < {OLDEST_RUNNING_TRANSACTION}"));
        }
        qb.push(" ORDER BY global_position ASC");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(Error::from)?;
        let records = rows
            .iter()
            .map(Self::journal_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.map_and_decrypt(records, options).await
    }

    async fn lookup(&self, query: LookupQuery) -> Result<LookupFieldValue, EventStoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT field_value FROM event_journal_lookup WHERE aggregate_type = ",
        );
        qb.push_bind(query.aggregate_type.as_str().to_owned());
        qb.push(" AND field_name = ");
        qb.push_bind(query.field_name.as_str().to_owned());
        if let Some(id) = &query.aggregate_id {
            qb.push(" AND owner_aggregate_id = ");
            qb.push_bind(id.as_str().to_owned());
        }
        let value: Option<String> = qb
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?;
        value
            .map(LookupFieldValue::new)
            .ok_or(EventStoreError::ValueNotFound)
    }

    async fn owner_lookup(&self, query: LookupQuery) -> Result<AggregateId, EventStoreError> {
        let Some(value) = query.field_value else {
            return Err(EventStoreError::OwnerNotFound);
        };
        let owner: Option<String> = sqlx::query_scalar(
            r"
            SELECT owner_aggregate_id FROM event_journal_lookup
            WHERE aggregate_type = $1 AND field_name = $2 AND field_value = $3
            ",
        )
        .bind(query.aggregate_type.as_str())
        .bind(query.field_name.as_str())
        .bind(value.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;
        owner
            .map(AggregateId::new)
            .ok_or(EventStoreError::OwnerNotFound)
    }

    fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().expect("lock poisoned").push(hook);
    }
}
