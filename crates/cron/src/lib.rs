//! Cron-style scheduling with exactly-once firing over a shared store.
//!
//! Expressions compile to per-field bitmasks ([`Field`]) held by an
//! immutable [`Entry`]; a [`Scheduler`] ticks once per minute and, under the
//! [`Store`]'s lock, records an [`Event`] per newly matching entry before
//! dispatching its handler. Multiple scheduler instances may share one store;
//! the per-minute dedup key keeps each occurrence at exactly one firing.

pub mod error;
pub mod field;
pub mod parse;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    error::{Error, Result},
    field::Field,
    parse::parse,
    scheduler::{HandlerFn, Scheduler},
    store::Store,
    store_memory::MemoryStore,
    store_sqlite::SqliteStore,
    types::{Entry, Event},
};

/// Run database migrations for the schedule tables.
///
/// Creates the `entries` and `events` tables. Called by
/// [`Store::initialize`] on [`SqliteStore`]; call it directly when sharing a
/// pool that is migrated at application startup.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
