//! In-memory [`KeyStore`] for tests and the in-memory store.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    crypto::{CryptoError, KeyStore, KeysByOwner, generate_key},
    event::AggregateId,
};

/// Thread-safe key map. Cloning shares the underlying keys.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    keys: Arc<Mutex<HashMap<AggregateId, super::KeyBytes>>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key currently exists for the owner.
    #[must_use]
    pub fn contains(&self, owner: &AggregateId) -> bool {
        self.keys.lock().expect("lock poisoned").contains_key(owner)
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load_keys(&self, owners: &[AggregateId]) -> Result<KeysByOwner, CryptoError> {
        let keys = self.keys.lock().expect("lock poisoned");
        Ok(owners
            .iter()
            .filter_map(|owner| keys.get(owner).map(|key| (owner.clone(), *key)))
            .collect())
    }

    async fn load_or_create_keys(
        &self,
        owners: &[AggregateId],
    ) -> Result<KeysByOwner, CryptoError> {
        let mut keys = self.keys.lock().expect("lock poisoned");
        Ok(owners
            .iter()
            .map(|owner| {
                let key = match keys.entry(owner.clone()) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => *entry.insert(generate_key()),
                };
                (owner.clone(), key)
            })
            .collect())
    }

    async fn delete_keys(&self, owners: &[AggregateId]) -> Result<(), CryptoError> {
        let mut keys = self.keys.lock().expect("lock poisoned");
        for owner in owners {
            keys.remove(owner);
        }
        Ok(())
    }
}
