//! A reference, in-memory implementation of [`EventStore`].
//!
//! Implements the full append contract (version matching, unique
//! constraints, lookups, crypto, hooks) against plain collections behind a
//! single async mutex, so every backend-agnostic behaviour can be tested
//! without a database. Queries re-map persisted rows through the configured
//! mapper exactly as the persistent backends do.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error};

use crate::{
    aggregate::ChangeIntent,
    crypto::{CryptoError, EventCrypto, NoCrypto},
    event::{
        AggregateId, AggregateType, AggregateVersion, IdGen, JournalEvent, JournalEventMapper,
        JournalPosition, JournalRecord, UuidGen,
    },
    notifier::EventInterest,
    query::{JournalQuery, QueryOptions},
    store::{
        EventStore, EventStoreError, Hook, LookupFieldName, LookupFieldValue, LookupQuery,
        UniqueConstraintViolation,
    },
};

type UniqueKey = (String, String);
type LookupKey = (AggregateType, AggregateId, LookupFieldName);

#[derive(Clone, Default)]
struct Journal {
    rows: Vec<JournalRecord>,
    unique: HashMap<UniqueKey, AggregateId>,
    lookups: HashMap<LookupKey, LookupFieldValue>,
    next_position: i64,
}

impl Journal {
    fn current_version(&self, id: &AggregateId, aggregate_type: &AggregateType) -> AggregateVersion {
        self.rows
            .iter()
            .filter(|row| &row.aggregate_id == id && &row.aggregate_type == aggregate_type)
            .map(|row| row.aggregate_version)
            .max()
            .unwrap_or_default()
    }
}

struct Inner {
    mapper: Arc<dyn JournalEventMapper>,
    crypto: Arc<dyn EventCrypto>,
    ids: Arc<dyn IdGen>,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    journal: Mutex<Journal>,
    interests: broadcast::Sender<EventInterest>,
}

/// In-memory [`EventStore`]. Cloning shares the underlying journal.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// A store without field encryption.
    #[must_use]
    pub fn new(mapper: Arc<dyn JournalEventMapper>) -> Self {
        Self::with_crypto(mapper, Arc::new(NoCrypto))
    }

    #[must_use]
    pub fn with_crypto(mapper: Arc<dyn JournalEventMapper>, crypto: Arc<dyn EventCrypto>) -> Self {
        let (interests, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                mapper,
                crypto,
                ids: Arc::new(UuidGen),
                hooks: RwLock::new(Vec::new()),
                journal: Mutex::new(Journal::default()),
                interests,
            }),
        }
    }

    /// Sender on which one [`EventInterest`] is published per appended
    /// event. Hand it to a
    /// [`BroadcastNotifier`](crate::notifier::inmemory::BroadcastNotifier).
    #[must_use]
    pub fn interest_sender(&self) -> broadcast::Sender<EventInterest> {
        self.inner.interests.clone()
    }

    async fn map_and_decrypt(
        &self,
        rows: Vec<JournalRecord>,
        options: QueryOptions,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        let mut events = rows
            .into_iter()
            .map(|row| self.inner.mapper.map(row))
            .collect::<Result<Vec<_>, _>>()?;
        self.inner.crypto.decrypt_events(&mut events).await?;
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

    fn apply_side_tables(
        journal: &mut Journal,
        intent: &ChangeIntent,
    ) -> Result<(), EventStoreError> {
        let aggregate_type = &intent.aggregate().aggregate_type;
        for event in intent.events() {
            for removal in event.unique_constraints_to_remove() {
                if removal.is_delete_all() {
                    journal.unique.retain(|_, owner| owner != removal.owner());
                } else {
                    let key = (removal.field().to_owned(), removal.value().to_owned());
                    if journal.unique.get(&key) == Some(removal.owner()) {
                        journal.unique.remove(&key);
                    }
                }
            }
            for constraint in event.unique_constraints_to_add() {
                let key = (constraint.field().to_owned(), constraint.value().to_owned());
                if journal.unique.contains_key(&key) {
                    return Err(UniqueConstraintViolation {
                        field: key.0,
                        value: key.1,
                    }
                    .into());
                }
                journal.unique.insert(key, constraint.owner().clone());
            }
            for (field_name, field_value) in event.lookup_values() {
                let key = (
                    aggregate_type.clone(),
                    event.aggregate_id().clone(),
                    field_name,
                );
                journal.lookups.insert(key, field_value);
            }
            for field_name in event.lookup_removals() {
                let key = (
                    aggregate_type.clone(),
                    event.aggregate_id().clone(),
                    field_name,
                );
                journal.lookups.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for Store {
    async fn append(
        &self,
        mut intents: Vec<ChangeIntent>,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        if intents.len() > 1 {
            return Err(EventStoreError::UnsupportedIntentCount(intents.len()));
        }
        let Some(intent) = intents.pop() else {
            return Ok(Vec::new());
        };
        if intent.is_empty() {
            return Ok(Vec::new());
        }

        let mut journal = self.inner.journal.lock().await;

        let aggregate = intent.aggregate().clone();
        let actual = journal.current_version(&aggregate.id, &aggregate.aggregate_type);
        if !intent.version_matches(actual) {
            return Err(EventStoreError::VersionConflict {
                expected: intent.last_known_version(),
                actual,
            });
        }

        // Stage every mutation on a copy so a failure midway leaves the
        // journal untouched, mirroring a rolled-back transaction.
        let mut staged = journal.clone();
        Self::apply_side_tables(&mut staged, &intent)?;

        let mut events = intent.into_events();
        self.inner.crypto.encrypt_events(&mut events).await?;

        let mut new_rows = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            staged.next_position += 1;
            new_rows.push(JournalRecord {
                event_id: self.inner.ids.next_id(),
                aggregate_id: event.aggregate_id().clone(),
                aggregate_type: event.aggregate_type(),
                aggregate_version: actual.incremented_by(offset as u64 + 1),
                journal_position: JournalPosition::from(staged.next_position),
                event_type: event.event_type(),
                event_version: event.event_version(),
                payload: event.payload()?,
                inserted_at: chrono::Utc::now(),
            });
        }
        staged.rows.extend(new_rows.iter().cloned());
        *journal = staged;
        drop(journal);

        let persisted = self
            .map_and_decrypt(new_rows, QueryOptions::default())
            .await?;

        let hooks: Vec<_> = self
            .inner
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

        for event in &persisted {
            let interest = EventInterest {
                aggregate_type: event.event().aggregate_type(),
                event_type: event.event().event_type(),
            };
            if self.inner.interests.send(interest).is_err() {
                debug!("no notification receivers");
            }
        }

        Ok(persisted)
    }

    async fn query(
        &self,
        query: &JournalQuery,
        options: QueryOptions,
    ) -> Result<Vec<JournalEvent>, EventStoreError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        // The oldest-running-transaction bound is moot here: appends hold
        // the journal mutex, so nothing ever commits behind a read.
        let journal = self.inner.journal.lock().await;
        let mut rows: Vec<_> = journal
            .rows
            .iter()
            .filter(|row| {
                let Some(clause) = query.by_type().get(&row.aggregate_type) else {
                    return false;
                };
                if let Some(id) = &clause.id
                    && id != &row.aggregate_id
                {
                    return false;
                }
                if let Some(version_after) = clause.version_after
                    && row.aggregate_version <= version_after
                {
                    return false;
                }
                if !clause.events.is_empty() && !clause.events.contains(&row.event_type) {
                    return false;
                }
                if let Some(position) = query.position_after()
                    && row.journal_position <= position
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        drop(journal);

        rows.sort_by_key(|row| row.journal_position);
        self.map_and_decrypt(rows, options).await
    }

    async fn lookup(&self, query: LookupQuery) -> Result<LookupFieldValue, EventStoreError> {
        let journal = self.inner.journal.lock().await;
        match query.aggregate_id {
            Some(id) => journal
                .lookups
                .get(&(query.aggregate_type, id, query.field_name))
                .cloned(),
            None => journal
                .lookups
                .iter()
                .find(|((aggregate_type, _, field_name), _)| {
                    aggregate_type == &query.aggregate_type && field_name == &query.field_name
                })
                .map(|(_, field_value)| field_value.clone()),
        }
        .ok_or(EventStoreError::ValueNotFound)
    }

    async fn owner_lookup(&self, query: LookupQuery) -> Result<AggregateId, EventStoreError> {
        let journal = self.inner.journal.lock().await;
        let Some(value) = query.field_value else {
            return Err(EventStoreError::OwnerNotFound);
        };
        journal
            .lookups
            .iter()
            .find(|((aggregate_type, _, field_name), field_value)| {
                aggregate_type == &query.aggregate_type
                    && field_name == &query.field_name
                    && *field_value == &value
            })
            .map(|((_, id, _), _)| id.clone())
            .ok_or(EventStoreError::OwnerNotFound)
    }

    fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.inner.hooks.write().expect("lock poisoned").push(hook);
    }
}
