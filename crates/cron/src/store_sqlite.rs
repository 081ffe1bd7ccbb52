//! SQLite-backed store using sqlx.
//!
//! `lock` pins a pooled connection and opens an immediate transaction, which
//! is SQLite's cross-process write lock: a second scheduler instance issuing
//! `BEGIN IMMEDIATE` against the same database file waits (up to the busy
//! timeout) until the first commits. While locked, every data operation runs
//! on the pinned connection so a whole check cycle shares one transaction;
//! unlocked operations go through the pool.

use std::{str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    sqlx::{
        Row,
        pool::PoolConnection,
        sqlite::{
            Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
            SqliteRow,
        },
    },
    tokio::sync::Mutex as AsyncMutex,
};

use crate::{
    Result,
    error::Error,
    parse::parse,
    store::Store,
    types::{Entry, Event},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable store for entries and events on a shared SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    locked: AsyncMutex<Option<PoolConnection<Sqlite>>>,
}

impl SqliteStore {
    /// Connect with a dedicated pool. The database file is created when
    /// missing; [`Store::initialize`] applies the schema migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::with_pool(pool))
    }

    /// Wrap an existing pool. Call [`crate::run_migrations`] (or
    /// [`Store::initialize`]) before use.
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locked: AsyncMutex::new(None),
        }
    }

    /// Soft-(de)activation: flips the `active` flag for every location of
    /// `(expression, name)`. Inactive entries are invisible to
    /// [`Store::entries`] but keep their definition and event history.
    pub async fn set_active(&self, expression: &str, name: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE entries SET active = ? WHERE expression = ? AND name = ?")
            .bind(i64::from(active))
            .bind(expression)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        crate::run_migrations(&self.pool).await
    }

    async fn lock(&self) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if locked.is_some() {
            return Err(Error::message("already locked or transaction exists"));
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        *locked = Some(conn);
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let mut locked = self.locked.lock().await;
        let Some(mut conn) = locked.take() else {
            return Err(Error::message("not locked or transaction not exists"));
        };
        if let Err(error) = sqlx::query("COMMIT").execute(&mut *conn).await {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(error.into());
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<Entry>> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            entries_on(conn).await
        } else {
            let mut conn = self.pool.acquire().await?;
            entries_on(&mut conn).await
        }
    }

    async fn add_entry(&self, entry: &Entry) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            add_entry_on(conn, entry).await
        } else {
            let mut conn = self.pool.acquire().await?;
            add_entry_on(&mut conn, entry).await
        }
    }

    async fn delete_entry(&self, entry: &Entry) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            delete_entry_on(conn, entry).await
        } else {
            let mut conn = self.pool.acquire().await?;
            delete_entry_on(&mut conn, entry).await
        }
    }

    async fn add_event(&self, event: &Event) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            add_event_on(conn, event).await
        } else {
            let mut conn = self.pool.acquire().await?;
            add_event_on(&mut conn, event).await
        }
    }

    async fn events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            events_on(conn, from, to).await
        } else {
            let mut conn = self.pool.acquire().await?;
            events_on(&mut conn, from, to).await
        }
    }

    async fn delete_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut locked = self.locked.lock().await;
        if let Some(conn) = locked.as_mut() {
            delete_events_on(conn, before).await
        } else {
            let mut conn = self.pool.acquire().await?;
            delete_events_on(&mut conn, before).await
        }
    }
}

async fn entries_on(conn: &mut SqliteConnection) -> Result<Vec<Entry>> {
    let rows =
        sqlx::query("SELECT expression, location, name, meta FROM entries WHERE active = 1")
            .fetch_all(&mut *conn)
            .await?;

    rows.iter().map(row_entry).collect()
}

async fn add_entry_on(conn: &mut SqliteConnection, entry: &Entry) -> Result<()> {
    if entry.expression.is_empty() {
        return Err(Error::message("got empty expression"));
    }
    sqlx::query(
        "INSERT INTO entries (expression, location, name, meta, active) VALUES (?, ?, ?, ?, 1)
         ON CONFLICT(expression, location, name) DO UPDATE SET meta = excluded.meta, active = 1",
    )
    .bind(&entry.expression)
    .bind(entry.timezone.name())
    .bind(&entry.name)
    .bind(&entry.meta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_entry_on(conn: &mut SqliteConnection, entry: &Entry) -> Result<()> {
    sqlx::query("DELETE FROM entries WHERE expression = ? AND location = ? AND name = ?")
        .bind(&entry.expression)
        .bind(entry.timezone.name())
        .bind(&entry.name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn add_event_on(conn: &mut SqliteConnection, event: &Event) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (expression, location, name, meta, triggered_at) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(expression, location, name, triggered_at) DO NOTHING",
    )
    .bind(&event.entry.expression)
    .bind(event.entry.timezone.name())
    .bind(&event.entry.name)
    .bind(&event.entry.meta)
    .bind(event.time.timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn events_on(
    conn: &mut SqliteConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT expression, location, name, meta, triggered_at FROM events
         WHERE triggered_at >= ? AND triggered_at < ?
         ORDER BY triggered_at, name",
    )
    .bind(from.timestamp())
    .bind(to.timestamp())
    .fetch_all(&mut *conn)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        let triggered_at: i64 = row.get("triggered_at");
        let time = DateTime::from_timestamp(triggered_at, 0)
            .ok_or_else(|| Error::message("invalid triggered_at in events table"))?;
        events.push(Event {
            entry: row_entry(row)?,
            time,
        });
    }
    Ok(events)
}

async fn delete_events_on(conn: &mut SqliteConnection, before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM events WHERE triggered_at < ?")
        .bind(before.timestamp())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Rebuild an [`Entry`] from a stored row by re-parsing its expression in
/// its stored location.
fn row_entry(row: &SqliteRow) -> Result<Entry> {
    let expression: String = row.get("expression");
    let location: String = row.get("location");
    let name: String = row.get("name");
    let meta: Option<String> = row.get("meta");

    let timezone: Tz = location
        .parse()
        .map_err(|_| Error::unknown_timezone(&location))?;
    let mut entry = parse(&expression, Some(timezone), &name)
        .map_err(|e| Error::context(format!("failed to parse expression {expression:?}"), e))?;
    entry.meta = meta;
    Ok(entry)
}
