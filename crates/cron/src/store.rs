//! Persistence contract consumed by the scheduler.

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    Result,
    types::{Entry, Event},
};

/// Durable entry/event catalog with a mutual-exclusion primitive.
///
/// The scheduler's at-most-once guarantee rests entirely on [`Store::lock`]
/// serializing whole check cycles (read entries, read events, write new
/// events) across every scheduler instance sharing the backing data. A
/// durable implementation must therefore provide cross-process exclusion;
/// the in-memory reference provides the same contract with an in-process
/// exclusive lock so scheduler race tests stay honest.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent setup (e.g. create backing tables). Safe to call on every
    /// process start.
    async fn initialize(&self) -> Result<()>;

    /// Acquire the store's exclusive lock. Locking an already-locked store
    /// handle is an error.
    async fn lock(&self) -> Result<()>;

    /// Release the exclusive lock. Unlocking a store that is not locked is
    /// an error.
    async fn unlock(&self) -> Result<()>;

    /// All entries considered active.
    async fn entries(&self) -> Result<Vec<Entry>>;

    /// Register an entry.
    async fn add_entry(&self, entry: &Entry) -> Result<()>;

    /// Delete entries matching `entry` by `(expression, name)` equality, not
    /// object identity.
    async fn delete_entry(&self, entry: &Entry) -> Result<()>;

    /// Durably record a firing. Idempotent per `(entry name, minute)` key;
    /// safe to call many times with distinct events inside one locked cycle.
    async fn add_event(&self, event: &Event) -> Result<()>;

    /// Events with `time` in the half-open interval `[from, to)`.
    async fn events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Retention pruning: delete events with `time` before `before`. Returns
    /// the number of events removed.
    async fn delete_events(&self, before: DateTime<Utc>) -> Result<u64>;
}
