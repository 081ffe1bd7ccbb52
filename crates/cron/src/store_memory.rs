//! In-memory reference store. No persistence; honors the same lock contract
//! as the durable store so scheduler unit tests can exercise races.

use std::sync::{Arc, Mutex, PoisonError};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};

use crate::{
    Result,
    error::Error,
    store::Store,
    types::{Entry, Event},
};

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    events: Vec<Event>,
}

/// Volatile store backed by `Vec`s. `lock`/`unlock` hold an exclusive async
/// mutex between the two calls, so concurrent check cycles serialize exactly
/// as they would against a durable backend.
pub struct MemoryStore {
    state: Mutex<State>,
    gate: Arc<AsyncMutex<()>>,
    held: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            gate: Arc::new(AsyncMutex::new(())),
            held: Mutex::new(None),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = Some(guard);
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.take().is_none() {
            return Err(Error::message("store is not locked"));
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<Entry>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.entries.clone())
    }

    async fn add_entry(&self, entry: &Entry) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.push(entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, entry: &Entry) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .retain(|e| !(e.expression == entry.expression && e.name == entry.name));
        Ok(())
    }

    async fn add_event(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.events.push(event.clone());
        Ok(())
    }

    async fn events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .events
            .iter()
            .filter(|e| e.time >= from && e.time < to)
            .cloned()
            .collect())
    }

    async fn delete_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let total = state.events.len();
        state.events.retain(|e| e.time >= before);
        Ok((total - state.events.len()) as u64)
    }
}
