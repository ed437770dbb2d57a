//! Postgres-backed [`KeyStore`].

use async_trait::async_trait;
use sqlx::PgPool;

use annal_core::{
    crypto::{CryptoError, KeyBytes, KeyStore, KeysByOwner, generate_key},
    event::AggregateId,
};

/// Per-aggregate encryption keys in the `aggregate_keys` table.
#[derive(Clone)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn key_store_error(error: impl std::error::Error + Send + Sync + 'static) -> CryptoError {
    CryptoError::KeyStore(Box::new(error))
}

fn owner_ids(owners: &[AggregateId]) -> Vec<String> {
    owners.iter().map(|owner| owner.as_str().to_owned()).collect()
}

impl PgKeyStore {
    async fn load(&self, owners: &[AggregateId]) -> Result<KeysByOwner, CryptoError> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            r"SELECT owner_id, encryption_key FROM aggregate_keys WHERE owner_id = ANY($1)",
        )
        .bind(owner_ids(owners))
        .fetch_all(&self.pool)
        .await
        .map_err(key_store_error)?;

        rows.into_iter()
            .map(|(owner, key)| {
                let key: KeyBytes = key.try_into().map_err(|_| {
                    CryptoError::KeyStore(format!("stored key for {owner} has wrong length").into())
                })?;
                Ok((AggregateId::new(owner), key))
            })
            .collect()
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn load_keys(&self, owners: &[AggregateId]) -> Result<KeysByOwner, CryptoError> {
        self.load(owners).await
    }

    async fn load_or_create_keys(
        &self,
        owners: &[AggregateId],
    ) -> Result<KeysByOwner, CryptoError> {
        let existing = self.load(owners).await?;
        let missing: Vec<_> = owners
            .iter()
            .filter(|owner| !existing.contains_key(*owner))
            .collect();
        if missing.is_empty() {
            return Ok(existing);
        }

        // DO NOTHING on conflict: if two creators race, the first committed
        // key wins and the re-read below picks it up for both.
        for owner in missing {
            sqlx::query(
                r"
                INSERT INTO aggregate_keys (owner_id, encryption_key)
                VALUES ($1, $2)
                ON CONFLICT (owner_id) DO NOTHING
                ",
            )
            .bind(owner.as_str())
            .bind(generate_key().to_vec())
            .execute(&self.pool)
            .await
            .map_err(key_store_error)?;
        }

        self.load(owners).await
    }

    async fn delete_keys(&self, owners: &[AggregateId]) -> Result<(), CryptoError> {
        sqlx::query(r"DELETE FROM aggregate_keys WHERE owner_id = ANY($1)")
            .bind(owner_ids(owners))
            .execute(&self.pool)
            .await
            .map_err(key_store_error)?;
        Ok(())
    }
}
