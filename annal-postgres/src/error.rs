use annal_core::store::{EventStoreError, UniqueConstraintViolation};
use sqlx::postgres::PgDatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database did not return an inserted row")]
    MissingReturnedRow,
    #[error("aggregate version {0} does not fit the journal column")]
    VersionOverflow(u64),
    #[error("invalid aggregate version from database: {0}")]
    InvalidVersion(i64),
}

impl From<Error> for EventStoreError {
    fn from(error: Error) -> Self {
        EventStoreError::Backend(Box::new(error))
    }
}

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

fn pg_error(error: &sqlx::Error) -> Option<&PgDatabaseError> {
    match error {
        sqlx::Error::Database(db) => db.try_downcast_ref::<PgDatabaseError>(),
        _ => None,
    }
}

/// Whether the error is `SQLSTATE 55P03`, raised when a `lock_timeout`
/// expires (or a `NOWAIT` lock is taken) while another transaction holds
/// the row lock.
pub(crate) fn is_lock_not_available(error: &sqlx::Error) -> bool {
    pg_error(error).is_some_and(|db| db.code() == LOCK_NOT_AVAILABLE)
}

/// If the error is a unique-constraint violation (`SQLSTATE 23505`),
/// extract the violated field and value from the error detail.
pub(crate) fn unique_violation(error: &sqlx::Error) -> Option<UniqueConstraintViolation> {
    let db = pg_error(error)?;
    if db.code() != UNIQUE_VIOLATION {
        return None;
    }
    db.detail().and_then(parse_violation_detail)
}

/// Parse a detail line of the shape
/// `Key (field, value)=(club_name, FC Awesome) already exists.`
fn parse_violation_detail(detail: &str) -> Option<UniqueConstraintViolation> {
    let after_key = detail.strip_prefix("Key (field, value)=(")?;
    let inner = after_key.strip_suffix(") already exists.")?;
    let (field, value) = inner.split_once(", ")?;
    Some(UniqueConstraintViolation {
        field: field.to_owned(),
        value: value.to_owned(),
    })
}
