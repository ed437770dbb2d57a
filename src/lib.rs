#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use annal_core::test;
pub use annal_core::{
    aggregate,
    aggregate::{
        Aggregate, BaseWriter, ChangeIntent, ChangeProducer, InvalidStateError, JournalInquirer,
        JournalViewer, VersionMatcher, Writer,
    },
    event,
    event::{
        AggregateId, AggregateType, AggregateVersion, DomainEvent, EventId, EventType,
        EventVersion, JournalEvent, JournalEventMapper, JournalPosition, JournalRecord,
        MapEventError,
    },
    query,
    query::{JournalQuery, QueryOptions},
};

pub mod store {

    pub use annal_core::store::{
        EventStore, EventStoreError, Hook, LookupFieldName, LookupFieldValue, LookupMap,
        LookupQuery, UniqueConstraint, UniqueConstraintViolation,
    };

    pub use annal_core::store::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use annal_postgres::{Error, Store, schema};
    }
}

pub mod crypto {

    pub use annal_core::crypto::{
        CryptoError, CryptoTransformer, EncryptedString, EventCrypto, KeyBytes, KeyCrypto,
        KeyStore, KeysByOwner, NoCrypto, generate_key,
    };

    pub use annal_core::crypto::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use annal_postgres::PgKeyStore;
    }
}

pub mod notifier {

    pub use annal_core::notifier::{
        CHANNEL_PREFIX, EventInterest, EventInterestSet, EventListener, EventNotifier,
        NotifierError, channel_for, interest_from_channel,
    };

    pub use annal_core::notifier::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use annal_postgres::PgEventNotifier;
    }
}

pub mod projector {

    pub use annal_core::projector::{
        ProjectionName, ProjectionState, Projector, ProjectorError, ProjectorRegistry,
        ProjectorSupervisor, catch_up_query, interests_of,
    };

    pub use annal_core::projector::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use annal_postgres::{PostgresProjector, Supervisor};
    }

    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    pub mod redis {
        pub use annal_redis::{LockGuard, LockManager, Supervisor};
    }
}
