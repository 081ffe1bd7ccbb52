//! The minute-tick scheduling loop.
//!
//! One `check` cycle per wall-clock minute: lock the store, load entries and
//! the events already recorded for that minute, persist an event for each
//! newly matching entry, then dispatch its handler on an independent task.
//! The per-minute, per-name dedup key makes a cycle idempotent, so any number
//! of scheduler instances can race against one shared store as long as the
//! store's lock serializes the read-check-write sequence.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use {
    chrono::{DateTime, DurationRound, TimeDelta, Utc},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Result,
    error::Error,
    store::Store,
    types::Event,
};

/// Job handler, invoked with the fired entry's name. Dispatched
/// fire-and-forget; the scheduler neither waits for it nor observes its
/// outcome. A handler outliving the minute can overlap with its own next
/// firing; guarding against that is the handler's concern.
pub type HandlerFn = Arc<dyn Fn(String) + Send + Sync>;

/// Minute-granularity timestamp layout used in dedup keys.
const MINUTE_KEY_LAYOUT: &str = "%Y-%m-%d-%H-%M";

pub struct Scheduler {
    handler: HandlerFn,
    store: Arc<dyn Store>,
    errors_tx: mpsc::Sender<Error>,
    errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(handler: HandlerFn, store: Arc<dyn Store>) -> Self {
        // Capacity 1, try_send: an unread error is dropped, never queued, so
        // reporting can never block or leak the tick loop.
        let (errors_tx, errors_rx) = mpsc::channel(1);
        Self {
            handler,
            store,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Take the diagnostic receiver. Per-tick errors (lock failures, store
    /// I/O failures) land here; when nobody drains it they are dropped.
    /// Returns `None` after the first call.
    pub fn take_error_receiver(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn report(&self, error: Error) {
        warn!(error = %error, "scheduler error");
        let _ = self.errors_tx.try_send(error);
    }

    /// Run until `cancel` fires. Store initialization failure is fatal;
    /// everything after that is reported and survived.
    ///
    /// Ticks are aligned to wall-clock minute boundaries, including the
    /// first one. Cancellation returns `Ok(())` without aborting an
    /// in-flight check and without cancelling dispatched handlers.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.store
            .initialize()
            .await
            .map_err(|e| Error::context("failed to initialize store", e))?;

        info!("scheduler started");
        loop {
            let delay = until_next_minute(Utc::now());
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }

            let tick = floor_to_minute(Utc::now());
            if let Err(error) = self.check(tick).await {
                self.report(Error::context(format!("failed to do check on {tick}"), error));
            }
        }
    }

    /// One check cycle for the minute containing `at`. The store lock spans
    /// the whole cycle and is released on every exit path.
    pub(crate) async fn check(&self, at: DateTime<Utc>) -> Result<()> {
        let at = floor_to_minute(at);

        self.store
            .lock()
            .await
            .map_err(|e| Error::context("locking store failed", e))?;

        let outcome = self.check_locked(at).await;

        if let Err(error) = self.store.unlock().await {
            self.report(Error::context("unlocking store failed", error));
        }
        outcome
    }

    async fn check_locked(&self, at: DateTime<Utc>) -> Result<()> {
        let entries = self
            .store
            .entries()
            .await
            .map_err(|e| Error::context("failed to get entries", e))?;
        let events = self
            .store
            .events(at, at + TimeDelta::minutes(1))
            .await
            .map_err(|e| Error::context("failed to get events", e))?;

        let mut fired: HashSet<String> = HashSet::with_capacity(events.len());
        for event in &events {
            if event.entry.name.is_empty() {
                self.report(Error::message(format!(
                    "got empty name for an event entry {}",
                    event.entry
                )));
                continue;
            }
            fired.insert(minute_key(&event.entry.name, event.time));
        }

        for entry in entries {
            if entry.name.is_empty() {
                self.report(Error::message(format!(
                    "got empty name for an entry {entry}"
                )));
                continue;
            }
            if !entry.matches(at) {
                continue;
            }

            let key = minute_key(&entry.name, at);
            if fired.contains(&key) {
                continue;
            }

            let event = Event { entry, time: at };
            if let Err(error) = self.store.add_event(&event).await {
                self.report(Error::context("failed to store event", error));
                continue;
            }
            fired.insert(key);

            debug!(name = %event.entry.name, at = %at, "entry fired");
            let handler = Arc::clone(&self.handler);
            let name = event.entry.name;
            tokio::spawn(async move { handler(name) });
        }

        Ok(())
    }
}

/// Truncate to the containing minute.
pub(crate) fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::minutes(1)).unwrap_or(t)
}

/// Dedup key: entry name plus the minute-truncated timestamp, always
/// rendered from the UTC instant so the key is stable across entry
/// timezones.
fn minute_key(name: &str, at: DateTime<Utc>) -> String {
    format!("{name}|{}", at.format(MINUTE_KEY_LAYOUT))
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let next = floor_to_minute(now) + TimeDelta::minutes(1);
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {
        async_trait::async_trait,
        chrono::TimeZone,
        chrono_tz::Tz,
    };

    use {
        super::*,
        crate::{parse::parse, store_memory::MemoryStore, types::Entry},
    };

    fn make_entry(expression: &str, name: &str) -> Entry {
        parse(expression, Some(Tz::UTC), name).unwrap()
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> HandlerFn {
        Arc::new(move |_name| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recording_handler(names: Arc<Mutex<Vec<String>>>) -> HandlerFn {
        Arc::new(move |name| {
            names
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(name);
        })
    }

    async fn settle() {
        // Let spawned handler tasks run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn floor_to_minute_drops_seconds() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 10).unwrap();
        let want = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        assert_eq!(floor_to_minute(t), want);
    }

    #[test]
    fn until_next_minute_is_positive_and_bounded() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 10).unwrap();
        assert_eq!(until_next_minute(t), Duration::from_secs(50));

        let boundary = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        assert_eq!(until_next_minute(boundary), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn check_fires_each_matching_entry_once() {
        let store = Arc::new(MemoryStore::new());
        store.add_entry(&make_entry("* * * * *", "A")).await.unwrap();
        store.add_entry(&make_entry("* * * * *", "B")).await.unwrap();

        let names = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(recording_handler(Arc::clone(&names)), Arc::clone(&store) as _);

        let at = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        scheduler.check(at).await.unwrap();
        settle().await;

        let events = store.events(at, at + TimeDelta::minutes(1)).await.unwrap();
        assert_eq!(events.len(), 2);

        let mut fired = names.lock().unwrap().clone();
        fired.sort();
        assert_eq!(fired, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn check_is_idempotent_for_the_same_minute() {
        let store = Arc::new(MemoryStore::new());
        store.add_entry(&make_entry("* * * * *", "A")).await.unwrap();
        store.add_entry(&make_entry("* * * * *", "B")).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(counting_handler(Arc::clone(&counter)), Arc::clone(&store) as _);

        let at = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        scheduler.check(at).await.unwrap();
        scheduler.check(at).await.unwrap();
        settle().await;

        // The second invocation observes the recorded events and skips.
        let events = store.events(at, at + TimeDelta::minutes(1)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn racing_checks_never_double_fire() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 10).unwrap();

        let entry1 = make_entry("01 01 01 01 *", "ENTRY_1");
        let entry2 = make_entry("01 01 01 01 *", "ENTRY_2");
        let entry3 = make_entry("02 01 01 01 *", "ENTRY_2"); // does not match

        let store = Arc::new(MemoryStore::new());
        store.add_entry(&entry1).await.unwrap();
        store.add_entry(&entry2).await.unwrap();
        store.add_entry(&entry3).await.unwrap();
        // ENTRY_1 already fired this minute (with a seconds offset; the key
        // is minute-granular).
        store
            .add_event(&Event {
                entry: entry1,
                time: at,
            })
            .await
            .unwrap();

        let names1 = Arc::new(Mutex::new(Vec::new()));
        let names2 = Arc::new(Mutex::new(Vec::new()));
        let scheduler1 = Scheduler::new(recording_handler(Arc::clone(&names1)), Arc::clone(&store) as _);
        let scheduler2 = Scheduler::new(recording_handler(Arc::clone(&names2)), Arc::clone(&store) as _);

        let (r1, r2) = tokio::join!(scheduler1.check(at), scheduler2.check(at));
        r1.unwrap();
        r2.unwrap();
        settle().await;

        // The pre-recorded event plus exactly one new one for ENTRY_2.
        let floored = floor_to_minute(at);
        let events = store
            .events(floored, floored + TimeDelta::minutes(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        let mut fired = names1.lock().unwrap().clone();
        fired.extend(names2.lock().unwrap().iter().cloned());
        assert_eq!(fired, vec!["ENTRY_2".to_string()]);
    }

    #[tokio::test]
    async fn check_skips_and_reports_empty_names() {
        let store = Arc::new(MemoryStore::new());
        store.add_entry(&make_entry("* * * * *", "")).await.unwrap();
        store.add_entry(&make_entry("* * * * *", "NAMED")).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(counting_handler(Arc::clone(&counter)), Arc::clone(&store) as _);
        let mut errors = scheduler.take_error_receiver().unwrap();

        let at = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        scheduler.check(at).await.unwrap();
        settle().await;

        let events = store.events(at, at + TimeDelta::minutes(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry.name, "NAMED");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let reported = errors.try_recv().unwrap();
        assert!(reported.to_string().contains("got empty name"));
    }

    /// Store whose event writes always fail; everything else delegates.
    struct FailingEventStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for FailingEventStore {
        async fn initialize(&self) -> Result<()> {
            self.inner.initialize().await
        }
        async fn lock(&self) -> Result<()> {
            self.inner.lock().await
        }
        async fn unlock(&self) -> Result<()> {
            self.inner.unlock().await
        }
        async fn entries(&self) -> Result<Vec<Entry>> {
            self.inner.entries().await
        }
        async fn add_entry(&self, entry: &Entry) -> Result<()> {
            self.inner.add_entry(entry).await
        }
        async fn delete_entry(&self, entry: &Entry) -> Result<()> {
            self.inner.delete_entry(entry).await
        }
        async fn add_event(&self, _event: &Event) -> Result<()> {
            Err(Error::message("disk full"))
        }
        async fn events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
            self.inner.events(from, to).await
        }
        async fn delete_events(&self, before: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_events(before).await
        }
    }

    #[tokio::test]
    async fn failed_event_write_skips_dispatch_and_is_reported_once() {
        let store = Arc::new(FailingEventStore {
            inner: MemoryStore::new(),
        });
        store.add_entry(&make_entry("* * * * *", "A")).await.unwrap();
        store.add_entry(&make_entry("* * * * *", "B")).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(counting_handler(Arc::clone(&counter)), Arc::clone(&store) as _);
        let mut errors = scheduler.take_error_receiver().unwrap();

        let at = Utc.with_ymd_and_hms(2000, 1, 1, 1, 1, 0).unwrap();
        // The check itself succeeds; per-entry write failures are non-fatal.
        scheduler.check(at).await.unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Both writes failed but the channel holds at most one error.
        let reported = errors.try_recv().unwrap();
        assert!(reported.to_string().starts_with("failed to store event"));
        assert!(errors.try_recv().is_err());
    }

    /// Store that cannot initialize.
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn initialize(&self) -> Result<()> {
            Err(Error::message("no backing tables"))
        }
        async fn lock(&self) -> Result<()> {
            Ok(())
        }
        async fn unlock(&self) -> Result<()> {
            Ok(())
        }
        async fn entries(&self) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        async fn add_entry(&self, _entry: &Entry) -> Result<()> {
            Ok(())
        }
        async fn delete_entry(&self, _entry: &Entry) -> Result<()> {
            Ok(())
        }
        async fn add_event(&self, _event: &Event) -> Result<()> {
            Ok(())
        }
        async fn events(&self, _from: DateTime<Utc>, _to: DateTime<Utc>) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }
        async fn delete_events(&self, _before: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn run_fails_fast_when_initialization_fails() {
        let scheduler = Scheduler::new(Arc::new(|_| {}), Arc::new(BrokenStore));
        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to initialize store: no backing tables"
        );
    }

    #[tokio::test]
    async fn run_returns_cleanly_on_cancellation() {
        let scheduler = Scheduler::new(Arc::new(|_| {}), Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn error_receiver_can_only_be_taken_once() {
        let scheduler = Scheduler::new(Arc::new(|_| {}), Arc::new(MemoryStore::new()));
        assert!(scheduler.take_error_receiver().is_some());
        assert!(scheduler.take_error_receiver().is_none());
    }
}
