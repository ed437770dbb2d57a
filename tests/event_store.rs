//! Store-contract tests against the in-memory backend.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use annal::{
    aggregate::{Aggregate, ChangeIntent, ChangeProducer, VersionMatcher},
    crypto::{CryptoError, KeyCrypto, inmemory::MemoryKeyStore},
    event::{AggregateId, AggregateVersion, DomainEvent, EventId},
    query::{JournalQuery, QueryOptions},
    store::{EventStore, EventStoreError, Hook, LookupQuery, inmemory},
};
use annal_core::test::{CLUB, Club, ClubCreated, ClubEventMapper, NAME_FIELD, SLUG_FIELD};

fn plain_store() -> inmemory::Store {
    inmemory::Store::new(Arc::new(ClubEventMapper))
}

fn crypto_store() -> (inmemory::Store, MemoryKeyStore) {
    let keys = MemoryKeyStore::new();
    let store = inmemory::Store::with_crypto(
        Arc::new(ClubEventMapper),
        Arc::new(KeyCrypto::new(keys.clone())),
    );
    (store, keys)
}

async fn create_club(store: &inmemory::Store, id: &str, name: &str, slug: &str) -> Club {
    let mut club = Club::new(AggregateId::from(id));
    club.init(name, slug).unwrap();
    store.produce_append(&mut club).await.unwrap();
    store.view(&mut club).await.unwrap();
    club
}

#[tokio::test]
async fn append_assigns_sequential_versions_and_increasing_positions() {
    let store = plain_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.rename("FC Mediocre").unwrap();
    club.rename("FC Decent").unwrap();
    store.produce_append(&mut club).await.unwrap();

    let all = store
        .query(
            &JournalQuery::builder().aggregate(CLUB).finish().build(),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    let versions: Vec<u64> = all.iter().map(|event| event.aggregate_version().0).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(
        all.windows(2)
            .all(|pair| pair[0].journal_position() < pair[1].journal_position())
    );
}

#[tokio::test]
async fn stale_intent_conflicts_and_persists_nothing() {
    let store = plain_store();
    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    let mut stale = Club::new(AggregateId::from("club-1"));
    stale.init("FC Racer", "fc-racer").unwrap();
    let error = store.produce_append(&mut stale).await.unwrap_err();
    let EventStoreError::VersionConflict { expected, actual } = error else {
        panic!("expected a version conflict, got {error}");
    };
    assert_eq!(expected, AggregateVersion(0));
    assert_eq!(actual, AggregateVersion(1));

    let events = store
        .query(
            &JournalQuery::builder().aggregate(CLUB).finish().build(),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1, "the stale intent left no trace");
}

#[tokio::test]
async fn always_matcher_appends_over_any_version() {
    let store = plain_store();
    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    let aggregate = Aggregate {
        id: AggregateId::from("club-1"),
        aggregate_type: CLUB,
        version: AggregateVersion(0),
    };
    let event: Box<dyn DomainEvent> = Box::new(ClubCreated {
        club_id: AggregateId::from("club-1"),
        name: "FC Other".to_owned(),
        slug: "fc-other".to_owned(),
    });
    let intent = ChangeIntent::new(aggregate, vec![event], VersionMatcher::Always).unwrap();
    let appended = store.append(vec![intent]).await.unwrap();
    assert_eq!(appended[0].aggregate_version(), AggregateVersion(2));
}

#[tokio::test]
async fn empty_batches_are_noop_successes() {
    let store = plain_store();
    assert!(store.append(Vec::new()).await.unwrap().is_empty());

    // A producer with no recorded changes appends nothing.
    let mut club = Club::new(AggregateId::from("club-1"));
    store.produce_append(&mut club).await.unwrap();
    let events = store
        .query(
            &JournalQuery::builder().aggregate(CLUB).finish().build(),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn multiple_intents_per_call_are_rejected() {
    let store = plain_store();
    let mut first = Club::new(AggregateId::from("club-1"));
    first.init("FC One", "fc-one").unwrap();
    let mut second = Club::new(AggregateId::from("club-2"));
    second.init("FC Two", "fc-two").unwrap();

    let error = store
        .append(vec![first.changes(), second.changes()])
        .await
        .unwrap_err();
    assert!(matches!(error, EventStoreError::UnsupportedIntentCount(2)));
}

#[tokio::test]
async fn duplicate_name_is_rejected_atomically() {
    let store = plain_store();
    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    let mut rival = Club::new(AggregateId::from("club-2"));
    rival.init("FC Awesome", "other-slug").unwrap();
    let error = store.produce_append(&mut rival).await.unwrap_err();
    let EventStoreError::UniqueConstraint(violation) = error else {
        panic!("expected a unique constraint violation, got {error}");
    };
    assert_eq!(violation.field, "club_name");
    assert_eq!(violation.value, "FC Awesome");

    // The rival's slug claim from the same event was rolled back too.
    let mut retry = Club::new(AggregateId::from("club-3"));
    retry.init("FC Unrelated", "other-slug").unwrap();
    store.produce_append(&mut retry).await.unwrap();
}

#[tokio::test]
async fn rename_swaps_the_name_claim() {
    let store = plain_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.rename("FC Mediocre").unwrap();
    store.produce_append(&mut club).await.unwrap();

    // The old name is claimable again, the new one is not.
    let mut newcomer = Club::new(AggregateId::from("club-2"));
    newcomer.init("FC Awesome", "fc-awesome-2").unwrap();
    store.produce_append(&mut newcomer).await.unwrap();

    let mut copycat = Club::new(AggregateId::from("club-3"));
    copycat.init("FC Mediocre", "fc-mediocre").unwrap();
    assert!(store.produce_append(&mut copycat).await.is_err());
}

#[tokio::test]
async fn delete_releases_all_claims_and_lookups() {
    let store = plain_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.delete().unwrap();
    store.produce_append(&mut club).await.unwrap();

    assert!(matches!(
        store
            .lookup(LookupQuery::value_of(
                CLUB,
                AggregateId::from("club-1"),
                NAME_FIELD.into(),
            ))
            .await,
        Err(EventStoreError::ValueNotFound)
    ));

    let mut successor = Club::new(AggregateId::from("club-2"));
    successor.init("FC Awesome", "fc-awesome").unwrap();
    store.produce_append(&mut successor).await.unwrap();
}

#[tokio::test]
async fn lookups_resolve_values_and_owners() {
    let store = plain_store();
    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    let name = store
        .lookup(LookupQuery::value_of(
            CLUB,
            AggregateId::from("club-1"),
            NAME_FIELD.into(),
        ))
        .await
        .unwrap();
    assert_eq!(name.as_str(), "FC Awesome");

    let owner = store
        .owner_lookup(LookupQuery::owner_of(
            CLUB,
            SLUG_FIELD.into(),
            "fc-awesome".into(),
        ))
        .await
        .unwrap();
    assert_eq!(owner, AggregateId::from("club-1"));

    assert!(matches!(
        store
            .owner_lookup(LookupQuery::owner_of(
                CLUB,
                NAME_FIELD.into(),
                "Nobody FC".into(),
            ))
            .await,
        Err(EventStoreError::OwnerNotFound)
    ));
}

#[tokio::test]
async fn lookup_without_an_id_reads_the_current_value() {
    let store = plain_store();
    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    let name = store
        .lookup(LookupQuery::value_for_type(CLUB, NAME_FIELD.into()))
        .await
        .unwrap();
    assert_eq!(name.as_str(), "FC Awesome");

    assert!(matches!(
        store
            .lookup(LookupQuery::value_for_type(CLUB, "motto".into()))
            .await,
        Err(EventStoreError::ValueNotFound)
    ));
}

#[tokio::test]
async fn version_after_is_an_exclusive_bound() {
    let store = plain_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.rename("FC Mediocre").unwrap();
    store.produce_append(&mut club).await.unwrap();

    let after_first = store
        .query(
            &JournalQuery::builder()
                .aggregate(CLUB)
                .id(AggregateId::from("club-1"))
                .version_after(AggregateVersion(1))
                .finish()
                .build(),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].aggregate_version(), AggregateVersion(2));
}

struct RecordingHook {
    seen: Mutex<Vec<EventId>>,
    fail: bool,
}

#[async_trait]
impl Hook for RecordingHook {
    async fn post_persist(
        &self,
        events: &[annal::event::JournalEvent],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.seen
            .lock()
            .unwrap()
            .extend(events.iter().map(annal::event::JournalEvent::event_id));
        if self.fail {
            return Err("hook exploded".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn hooks_run_after_commit_and_failures_are_swallowed() {
    let store = plain_store();
    let failing = Arc::new(RecordingHook {
        seen: Mutex::new(Vec::new()),
        fail: true,
    });
    let recording = Arc::new(RecordingHook {
        seen: Mutex::new(Vec::new()),
        fail: false,
    });
    store.add_hook(failing.clone());
    store.add_hook(recording.clone());

    create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;

    assert_eq!(failing.seen.lock().unwrap().len(), 1);
    assert_eq!(recording.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn encrypted_fields_roundtrip_through_the_journal() {
    let (store, _keys) = crypto_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.add_contact_info("captain@fc-awesome.example").unwrap();
    store.produce_append(&mut club).await.unwrap();

    let mut replayed = Club::new(AggregateId::from("club-1"));
    store.view(&mut replayed).await.unwrap();
    let email = replayed.contact_email.unwrap();
    assert_eq!(email.value(), "captain@fc-awesome.example");
    assert!(!email.is_shredded());
}

#[tokio::test]
async fn shredded_fields_default_and_can_be_escalated() {
    let (store, keys) = crypto_store();
    let mut club = create_club(&store, "club-1", "FC Awesome", "fc-awesome").await;
    club.add_contact_info("captain@fc-awesome.example").unwrap();
    store.produce_append(&mut club).await.unwrap();

    use annal::crypto::KeyStore;
    keys.delete_keys(&[AggregateId::from("club-1")]).await.unwrap();

    let mut shredded = Club::new(AggregateId::from("club-1"));
    store.view(&mut shredded).await.unwrap();
    let email = shredded.contact_email.unwrap();
    assert_eq!(email.value(), "");
    assert!(email.is_shredded());

    use annal::aggregate::JournalInquirer;
    let error = store
        .query(
            &Club::new(AggregateId::from("club-1")).query(),
            QueryOptions::default().error_on_shredded(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        EventStoreError::Crypto(CryptoError::AggregateShredded(_))
    ));
}
