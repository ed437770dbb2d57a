//! Schema management for the Postgres backend.

use sqlx::PgPool;

/// Apply the initial schema (idempotent).
///
/// This uses `CREATE ... IF NOT EXISTS` style DDL so it can be run on
/// startup.
///
/// # Errors
///
/// Returns a `sqlx::Error` if any of the schema creation queries fail.
#[tracing::instrument(skip(pool))]
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Positions come from a sequence rather than a serial column so the
    // column can stay NUMERIC, leaving room for fractional back-fills.
    sqlx::query(r"CREATE SEQUENCE IF NOT EXISTS event_journal_position")
        .execute(pool)
        .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS event_journal (
            id                UUID PRIMARY KEY,
            aggregate_id      TEXT NOT NULL,
            aggregate_type    TEXT NOT NULL,
            aggregate_version BIGINT NOT NULL,
            event_type        TEXT NOT NULL,
            event_version     TEXT NOT NULL,
            payload           JSONB NOT NULL,
            global_position   NUMERIC NOT NULL DEFAULT nextval('event_journal_position'),
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (aggregate_type, aggregate_id, aggregate_version)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"CREATE INDEX IF NOT EXISTS event_journal_by_position ON event_journal(global_position)",
    )
    .execute(pool)
    .await?;

    // The (field, value) primary key is what enforces uniqueness; the
    // error detail of a conflicting insert names both columns.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS unique_constraint (
            field              TEXT NOT NULL,
            value              TEXT NOT NULL,
            owner_aggregate_id TEXT NOT NULL,
            PRIMARY KEY (field, value)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS event_journal_lookup (
            id                 UUID PRIMARY KEY,
            owner_aggregate_id TEXT NOT NULL,
            aggregate_type     TEXT NOT NULL,
            field_name         TEXT NOT NULL,
            field_value        TEXT NOT NULL,
            UNIQUE (owner_aggregate_id, field_name)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS aggregate_keys (
            owner_id       TEXT PRIMARY KEY,
            encryption_key BYTEA NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS projection_state (
            name                    TEXT PRIMARY KEY,
            last_processed_event_id UUID NULL,
            last_processed_at       TIMESTAMPTZ NULL,
            aggregate_version       BIGINT NOT NULL DEFAULT 0,
            global_position         NUMERIC NOT NULL DEFAULT 0,
            updated_at              TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE OR REPLACE FUNCTION event_journal_notify() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify('event_store_' || NEW.aggregate_type, NEW.event_type);
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE OR REPLACE TRIGGER event_journal_notify
        AFTER INSERT ON event_journal
        FOR EACH ROW EXECUTE FUNCTION event_journal_notify()
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
