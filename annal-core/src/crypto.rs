//! Field-level encryption and crypto shredding.
//!
//! Events may tag string fields as encrypted. On append the store encrypts
//! each tagged field with the AES-256-GCM key of its owning aggregate; on
//! query it decrypts them again. Deleting an owner's key ("shredding")
//! renders those fields permanently unreadable: decryption then substitutes
//! a default (the empty string unless the event chooses one) and flags the
//! event as shredded. Malformed ciphertext under a *present* key is
//! corruption and fails the query.
//!
//! Ciphertext wire format: `base64(nonce || aes_256_gcm_ciphertext)` with a
//! random 12-byte nonce.

use std::collections::HashMap;

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{AggregateId, DomainEvent, JournalEvent};

pub mod inmemory;

const NONCE_LEN: usize = 12;

/// A string field stored encrypted at rest.
///
/// Serializes as a plain string; `is_shredded` is in-memory state set by the
/// decryption pass when the owner's key is gone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedString {
    value: String,
    #[serde(skip)]
    is_shredded: bool,
}

impl EncryptedString {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_shredded: false,
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the field's key was deleted and the value replaced by a
    /// default during decryption.
    #[must_use]
    pub fn is_shredded(&self) -> bool {
        self.is_shredded
    }
}

impl From<&str> for EncryptedString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EncryptedString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Visitor handed to [`DomainEvent::accept_crypto`]. Events call it once per
/// encrypted field, naming the owner whose key applies.
pub trait CryptoTransformer {
    /// Transform a field with its owner's key. On decryption this is
    /// [`transform_with_default`](Self::transform_with_default) with an
    /// empty default, so a shredded owner yields an empty, flagged field
    /// rather than an error.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MissingKey`] if an encryption key could not be
    /// loaded or created, or [`CryptoError::MalformedCiphertext`] if the
    /// stored value cannot be decrypted under the present key.
    fn transform(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
    ) -> Result<(), CryptoError>;

    /// Like [`transform`](Self::transform), but a missing key on decryption
    /// substitutes `default` and marks the field shredded instead of
    /// failing. On encryption the default is ignored.
    fn transform_with_default(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
        default: &str,
    ) -> Result<(), CryptoError>;
}

#[derive(Debug, Error)]
pub enum CryptoError {
    /// No key could be loaded or created for the owner during encryption.
    #[error("no encryption key for aggregate {0}")]
    MissingKey(AggregateId),
    /// Ciphertext failed to decode or authenticate under a present key.
    #[error("malformed ciphertext for aggregate {0}")]
    MalformedCiphertext(AggregateId),
    /// A queried event had shredded fields and the caller opted into
    /// failing instead of defaulting.
    #[error("aggregate {0} has been shredded")]
    AggregateShredded(AggregateId),
    #[error("key store: {0}")]
    KeyStore(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Raw AES-256 key material.
pub type KeyBytes = [u8; 32];

/// Keys loaded for one crypto pass, by owning aggregate.
pub type KeysByOwner = HashMap<AggregateId, KeyBytes>;

/// Generate a fresh random AES-256 key.
#[must_use]
pub fn generate_key() -> KeyBytes {
    let mut key = KeyBytes::default();
    OsRng.fill_bytes(&mut key);
    key
}

/// Persistence of per-aggregate encryption keys.
///
/// `load_or_create_keys` must be race-safe: two concurrent creators for the
/// same owner must converge on a single persisted key.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load existing keys for the given owners. Owners without a key are
    /// simply absent from the result.
    async fn load_keys(&self, owners: &[AggregateId]) -> Result<KeysByOwner, CryptoError>;

    /// Load keys, generating and persisting one for each owner that has
    /// none yet.
    async fn load_or_create_keys(
        &self,
        owners: &[AggregateId],
    ) -> Result<KeysByOwner, CryptoError>;

    /// Delete the owners' keys, shredding every field encrypted under them.
    async fn delete_keys(&self, owners: &[AggregateId]) -> Result<(), CryptoError>;
}

/// Crypto pass applied by the store around persistence.
#[async_trait]
pub trait EventCrypto: Send + Sync {
    /// Encrypt tagged fields of uncommitted events in place.
    async fn encrypt_events(
        &self,
        events: &mut [Box<dyn DomainEvent>],
    ) -> Result<(), CryptoError>;

    /// Decrypt tagged fields of queried events in place, shredding where
    /// keys are gone.
    async fn decrypt_events(&self, events: &mut [JournalEvent]) -> Result<(), CryptoError>;
}

/// No-op crypto for deployments without encrypted fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCrypto;

#[async_trait]
impl EventCrypto for NoCrypto {
    async fn encrypt_events(
        &self,
        _events: &mut [Box<dyn DomainEvent>],
    ) -> Result<(), CryptoError> {
        Ok(())
    }

    async fn decrypt_events(&self, _events: &mut [JournalEvent]) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// [`EventCrypto`] over any [`KeyStore`].
///
/// Collects the owners tagged by each batch, loads (or creates) their keys
/// in one round trip, then walks every event's encrypted fields with a
/// sealing or opening transformer.
pub struct KeyCrypto<S> {
    keys: S,
}

impl<S: KeyStore> KeyCrypto<S> {
    pub fn new(keys: S) -> Self {
        Self { keys }
    }

    pub fn key_store(&self) -> &S {
        &self.keys
    }
}

fn owners_of(owners: impl Iterator<Item = Vec<AggregateId>>) -> Vec<AggregateId> {
    let mut all: Vec<AggregateId> = owners.flatten().collect();
    all.sort_unstable();
    all.dedup();
    all
}

#[async_trait]
impl<S: KeyStore> EventCrypto for KeyCrypto<S> {
    async fn encrypt_events(
        &self,
        events: &mut [Box<dyn DomainEvent>],
    ) -> Result<(), CryptoError> {
        let owners = owners_of(events.iter().map(|event| event.encrypted_field_owners()));
        if owners.is_empty() {
            return Ok(());
        }
        let keys = self.keys.load_or_create_keys(&owners).await?;
        let mut sealer = FieldSealer { keys: &keys };
        for event in events
            .iter_mut()
            .filter(|event| !event.encrypted_field_owners().is_empty())
        {
            event.accept_crypto(&mut sealer)?;
        }
        Ok(())
    }

    async fn decrypt_events(&self, events: &mut [JournalEvent]) -> Result<(), CryptoError> {
        let owners = owners_of(
            events
                .iter()
                .map(|event| event.event().encrypted_field_owners()),
        );
        if owners.is_empty() {
            return Ok(());
        }
        let keys = self.keys.load_keys(&owners).await?;
        let mut opener = FieldOpener { keys: &keys };
        for event in events
            .iter_mut()
            .filter(|event| !event.event().encrypted_field_owners().is_empty())
        {
            event.event_mut().accept_crypto(&mut opener)?;
        }
        Ok(())
    }
}

fn seal(key: &KeyBytes, owner: &AggregateId, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))?;
    let mut nonce = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))?;
    let mut combined = Vec::with_capacity(NONCE_LEN + sealed.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&sealed);
    Ok(BASE64.encode(combined))
}

fn open(key: &KeyBytes, owner: &AggregateId, ciphertext: &str) -> Result<String, CryptoError> {
    let combined = BASE64
        .decode(ciphertext)
        .map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))?;
    if combined.len() < NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext(owner.clone()));
    }
    let (nonce, sealed) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::MalformedCiphertext(owner.clone()))
}

/// Encrypting transformer. Fails if an owner's key could not be created.
struct FieldSealer<'a> {
    keys: &'a KeysByOwner,
}

impl CryptoTransformer for FieldSealer<'_> {
    fn transform(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
    ) -> Result<(), CryptoError> {
        let key = self
            .keys
            .get(owner)
            .ok_or_else(|| CryptoError::MissingKey(owner.clone()))?;
        field.value = seal(key, owner, &field.value)?;
        Ok(())
    }

    fn transform_with_default(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
        _default: &str,
    ) -> Result<(), CryptoError> {
        self.transform(owner, field)
    }
}

/// Decrypting transformer. A missing key never errors here: the field is
/// shredded with its default (empty for the plain transform). Malformed
/// ciphertext under a present key always fails.
struct FieldOpener<'a> {
    keys: &'a KeysByOwner,
}

impl CryptoTransformer for FieldOpener<'_> {
    fn transform(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
    ) -> Result<(), CryptoError> {
        self.transform_with_default(owner, field, "")
    }

    fn transform_with_default(
        &mut self,
        owner: &AggregateId,
        field: &mut EncryptedString,
        default: &str,
    ) -> Result<(), CryptoError> {
        match self.keys.get(owner) {
            Some(key) => {
                field.value = open(key, owner, &field.value)?;
                field.is_shredded = false;
                Ok(())
            }
            None => {
                field.value = default.to_owned();
                field.is_shredded = true;
                Ok(())
            }
        }
    }
}
