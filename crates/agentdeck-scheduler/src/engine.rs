//! Trigger evaluation: once per tick, turn every due cron trigger into a
//! work item.
//!
//! One in-flight evaluation per scheduler instance: a tick that lands while
//! the previous one is still running is dropped, not queued. Failures stay
//! inside their own scope (the whole tick for a fetch error, a single trigger
//! otherwise) and surface only through logs and the firing log.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentdeck_core::error::{DeckError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::cron;
use crate::store::TriggerStore;
use crate::template::render_template;
use crate::trigger::{FiringLogEntry, NewWorkItem, Trigger, WorkItemId};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a single call to [`TriggerScheduler::evaluate_triggers`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another evaluation was in flight; nothing was done.
    Busy,
    /// Triggers could not be listed; nothing was processed.
    FetchFailed,
    Completed(TickSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub candidates: usize,
    pub due: usize,
    pub fired: usize,
    pub failed: usize,
}

/// Releases the in-flight flag on drop, including during unwinding.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TriggerScheduler {
    store: Arc<dyn TriggerStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    in_flight: AtomicBool,
}

impl TriggerScheduler {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every individual store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Whether an evaluation is currently in flight.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(&self.in_flight))
    }

    /// Run one evaluation tick. Never fails and never panics out.
    pub async fn evaluate_triggers(&self) -> TickOutcome {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Trigger evaluation already in progress, skipping tick");
            return TickOutcome::Busy;
        };

        let fetched = AssertUnwindSafe(
            self.with_timeout("list_due_candidates", self.store.list_due_candidates()),
        )
        .catch_unwind()
        .await;

        let triggers = match fetched {
            Ok(Ok(triggers)) => triggers,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to fetch triggers, aborting tick");
                return TickOutcome::FetchFailed;
            }
            Err(panic) => {
                tracing::error!(
                    error = %panic_message(panic.as_ref()),
                    "Trigger fetch panicked, aborting tick"
                );
                return TickOutcome::FetchFailed;
            }
        };

        let mut summary = TickSummary {
            candidates: triggers.len(),
            ..Default::default()
        };

        for trigger in &triggers {
            let now = self.clock.now();
            let Some(expression) = trigger.cron_expression.as_deref() else {
                continue;
            };
            if !cron::is_trigger_due(expression, trigger.last_fired_at, &now) {
                continue;
            }
            summary.due += 1;

            let outcome = AssertUnwindSafe(self.fire(trigger, now))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(_)) => {
                    summary.fired += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
            };

            summary.failed += 1;
            tracing::warn!(trigger_id = %trigger.id, error = %error, "Trigger failed to fire");
            self.record_failure(trigger, &error).await;
        }

        if summary.due > 0 {
            tracing::info!(
                candidates = summary.candidates,
                fired = summary.fired,
                failed = summary.failed,
                "Trigger evaluation finished"
            );
        } else {
            tracing::debug!(candidates = summary.candidates, "No triggers due");
        }

        TickOutcome::Completed(summary)
    }

    /// Render, create the work item, then bookkeeping.
    ///
    /// Errors after the work item exists are logged but do not fail the
    /// trigger: the item stands and a later duplicate is rejected by its
    /// `fire_key`.
    async fn fire(&self, trigger: &Trigger, now: DateTime<FixedOffset>) -> Result<WorkItemId> {
        let render_now = self.clock.now();
        let title = render_template(&trigger.task_title_template, &render_now);
        let description = render_template(&trigger.task_description_template, &render_now);
        let item = NewWorkItem::from_trigger(trigger, title, description, &now);
        let fired_at = now.with_timezone(&Utc);

        let work_item_id = match self
            .with_timeout("insert_work_item", self.store.insert_work_item(&item))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if e.is_duplicate() {
                    // Already produced this minute; catch last_fired_at up.
                    self.mark_fired(trigger, fired_at).await;
                }
                return Err(e);
            }
        };

        self.mark_fired(trigger, fired_at).await;

        let entry = FiringLogEntry::fired(&trigger.id, &work_item_id);
        if let Err(e) = self
            .with_timeout("append_firing_log", self.store.append_firing_log(&entry))
            .await
        {
            tracing::error!(
                trigger_id = %trigger.id,
                work_item_id = %work_item_id,
                error = %e,
                "Work item created but firing log append failed"
            );
        }

        tracing::info!(
            trigger_id = %trigger.id,
            work_item_id = %work_item_id,
            workspace_id = %trigger.workspace_id,
            "Trigger fired"
        );
        Ok(work_item_id)
    }

    async fn mark_fired(&self, trigger: &Trigger, at: DateTime<Utc>) {
        if let Err(e) = self
            .with_timeout("update_last_fired", self.store.update_last_fired(&trigger.id, at))
            .await
        {
            tracing::warn!(
                trigger_id = %trigger.id,
                error = %e,
                "Failed to update last_fired_at; trigger may fire again this minute"
            );
        }
    }

    async fn record_failure(&self, trigger: &Trigger, error: &str) {
        let entry = FiringLogEntry::failed(&trigger.id, error);
        let appended = AssertUnwindSafe(
            self.with_timeout("append_firing_log", self.store.append_firing_log(&entry)),
        )
        .catch_unwind()
        .await;
        match appended {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(trigger_id = %trigger.id, error = %e, "Failed to record trigger failure");
            }
            Err(panic) => {
                tracing::error!(
                    trigger_id = %trigger.id,
                    error = %panic_message(panic.as_ref()),
                    "Recording trigger failure panicked"
                );
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeckError::Timeout {
                operation: operation.to_string(),
                secs: self.store_timeout.as_secs(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drive `evaluate_triggers` on a fixed interval until `shutdown` resolves.
///
/// Each tick runs on its own task so a slow evaluation cannot delay the
/// timer; overlapping ticks are dropped by the scheduler's in-flight guard.
/// Ticks still running at shutdown are awaited before returning.
pub async fn spawn_scheduler<F>(scheduler: Arc<TriggerScheduler>, every: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    tracing::info!("Trigger scheduler started (tick every {}s)", every.as_secs());

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);
    let mut ticks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Trigger scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                let scheduler = scheduler.clone();
                ticks.spawn(async move { scheduler.evaluate_triggers().await });
            }
            Some(done) = ticks.join_next(), if !ticks.is_empty() => {
                if let Err(e) = done {
                    tracing::error!(error = %e, "Trigger evaluation task failed");
                }
            }
        }
    }

    if !ticks.is_empty() {
        tracing::info!("Waiting for {} in-flight evaluation(s)", ticks.len());
    }
    while let Some(done) = ticks.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "Trigger evaluation task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use crate::trigger::{FiringStatus, TriggerType};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn monday_9am() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 10, 19, 9, 0, 0)
            .unwrap()
    }

    fn scheduler_with(
        store: Arc<dyn TriggerStore>,
        clock: Arc<FixedClock>,
    ) -> TriggerScheduler {
        TriggerScheduler::new(store).with_clock(clock)
    }

    /// Delegates to a MemoryStore but refuses to insert for one trigger.
    struct FailingInsertStore {
        inner: MemoryStore,
        fail_for: String,
        panic_instead: bool,
    }

    #[async_trait]
    impl TriggerStore for FailingInsertStore {
        async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
            self.inner.list_due_candidates().await
        }

        async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId> {
            if item.trigger_id == self.fail_for {
                if self.panic_instead {
                    panic!("insert exploded");
                }
                return Err(DeckError::Store("constraint violation".into()));
            }
            self.inner.insert_work_item(item).await
        }

        async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.update_last_fired(trigger_id, at).await
        }

        async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()> {
            self.inner.append_firing_log(entry).await
        }
    }

    /// Blocks in `list_due_candidates` until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        list_calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TriggerStore for GatedStore {
        async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.list_due_candidates().await
        }

        async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId> {
            self.inner.insert_work_item(item).await
        }

        async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.update_last_fired(trigger_id, at).await
        }

        async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()> {
            self.inner.append_firing_log(entry).await
        }
    }

    /// Fetch always fails.
    struct BrokenFetchStore;

    #[async_trait]
    impl TriggerStore for BrokenFetchStore {
        async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
            Err(DeckError::Store("connection refused".into()))
        }

        async fn insert_work_item(&self, _item: &NewWorkItem) -> Result<WorkItemId> {
            unreachable!("no triggers were fetched")
        }

        async fn update_last_fired(&self, _trigger_id: &str, _at: DateTime<Utc>) -> Result<()> {
            unreachable!("no triggers were fetched")
        }

        async fn append_firing_log(&self, _entry: &FiringLogEntry) -> Result<()> {
            unreachable!("no triggers were fetched")
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        UpdateFails,
        UpdateStalls,
        FiredLogFails,
        InsertStalls,
    }

    /// MemoryStore with one switchable fault and an optional slow insert.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fault: std::sync::Mutex<Option<Fault>>,
        insert_delay: Option<Duration>,
        insert_started: Notify,
    }

    impl FaultyStore {
        fn with_fault(fault: Fault) -> Self {
            Self {
                fault: std::sync::Mutex::new(Some(fault)),
                ..Default::default()
            }
        }

        fn fault(&self) -> Option<Fault> {
            *self.fault.lock().unwrap()
        }

        fn clear(&self) {
            *self.fault.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl TriggerStore for FaultyStore {
        async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
            self.inner.list_due_candidates().await
        }

        async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId> {
            self.insert_started.notify_one();
            if let Some(delay) = self.insert_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fault() == Some(Fault::InsertStalls) {
                std::future::pending::<()>().await;
            }
            self.inner.insert_work_item(item).await
        }

        async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
            match self.fault() {
                Some(Fault::UpdateFails) => Err(DeckError::Store("disk full".into())),
                Some(Fault::UpdateStalls) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => self.inner.update_last_fired(trigger_id, at).await,
            }
        }

        async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()> {
            if self.fault() == Some(Fault::FiredLogFails) && entry.status == FiringStatus::Fired {
                return Err(DeckError::Store("firing log locked".into()));
            }
            self.inner.append_firing_log(entry).await
        }
    }

    fn faulty_scheduler(store: Arc<FaultyStore>, clock: Arc<FixedClock>) -> TriggerScheduler {
        TriggerScheduler::new(store)
            .with_clock(clock)
            .with_store_timeout(Duration::from_millis(50))
    }

    fn every_minute(store: &FaultyStore) -> String {
        let trigger = Trigger::cron("a", "w", "* * * * *", "t", "d");
        let id = trigger.id.clone();
        store.inner.add_trigger(trigger).unwrap();
        id
    }

    #[tokio::test]
    async fn test_end_to_end_every_five_minutes() {
        let store = Arc::new(MemoryStore::new());
        let trigger = Trigger::cron(
            "agent-1",
            "ws-1",
            "*/5 * * * *",
            "Report for {{date}}",
            "Generated at {{time}}",
        );
        let id = trigger.id.clone();
        store.add_trigger(trigger).unwrap();

        let now = monday_9am() + chrono::Duration::minutes(5);
        let clock = Arc::new(FixedClock::new(now));
        let scheduler = scheduler_with(store.clone(), clock);

        let outcome = scheduler.evaluate_triggers().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickSummary {
                candidates: 1,
                due: 1,
                fired: 1,
                failed: 0
            })
        );

        let items = store.work_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Report for 2026-10-19");
        assert_eq!(items[0].description, "Generated at 09:05:00");
        assert_eq!(items[0].assignee_agent_id, "agent-1");
        assert_eq!(items[0].creator_agent_id, "agent-1");
        assert_eq!(items[0].workspace_id, "ws-1");

        assert_eq!(
            store.trigger(&id).unwrap().last_fired_at,
            Some(now.with_timezone(&Utc))
        );

        let firings = store.firings_for(&id);
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].status, FiringStatus::Fired);
        assert_eq!(firings[0].work_item_id.as_deref(), Some(items[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_second_tick_same_minute_does_not_refire() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_trigger(Trigger::cron("a", "w", "* * * * *", "t", "d"))
            .unwrap();
        let clock = Arc::new(FixedClock::new(monday_9am()));
        let scheduler = scheduler_with(store.clone(), clock.clone());

        scheduler.evaluate_triggers().await;
        clock.advance(chrono::Duration::seconds(30));
        let outcome = scheduler.evaluate_triggers().await;

        assert!(matches!(outcome, TickOutcome::Completed(TickSummary { due: 0, .. })));
        assert_eq!(store.work_items().len(), 1);
        assert_eq!(store.firings().len(), 1);

        clock.advance(chrono::Duration::seconds(30));
        scheduler.evaluate_triggers().await;
        assert_eq!(store.work_items().len(), 2);
    }

    #[tokio::test]
    async fn test_not_due_trigger_is_skipped_silently() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_trigger(Trigger::cron("a", "w", "30 9 * * *", "t", "d"))
            .unwrap();
        let scheduler = scheduler_with(store.clone(), Arc::new(FixedClock::new(monday_9am())));

        let outcome = scheduler.evaluate_triggers().await;
        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickSummary { candidates: 1, due: 0, .. })
        ));
        assert!(store.firings().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_trigger() {
        let inner = MemoryStore::new();
        let first = Trigger::cron("a1", "w", "* * * * *", "first", "");
        let second = Trigger::cron("a2", "w", "* * * * *", "second", "");
        let third = Trigger::cron("a3", "w", "* * * * *", "third", "");
        for t in [&first, &second, &third] {
            inner.add_trigger(t.clone()).unwrap();
        }
        let store = Arc::new(FailingInsertStore {
            inner,
            fail_for: second.id.clone(),
            panic_instead: false,
        });
        let scheduler = scheduler_with(store.clone(), Arc::new(FixedClock::new(monday_9am())));

        let outcome = scheduler.evaluate_triggers().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickSummary {
                candidates: 3,
                due: 3,
                fired: 2,
                failed: 1
            })
        );

        let titles: Vec<String> = store.inner.work_items().into_iter().map(|w| w.title).collect();
        assert_eq!(titles, vec!["first".to_string(), "third".to_string()]);

        let failed = store.inner.firings_for(&second.id);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, FiringStatus::Failed);
        assert!(failed[0].work_item_id.is_none());
        assert!(failed[0].error.as_deref().unwrap().contains("constraint violation"));
        assert!(store.inner.trigger(&second.id).unwrap().last_fired_at.is_none());

        for t in [&first, &third] {
            let log = store.inner.firings_for(&t.id);
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].status, FiringStatus::Fired);
            assert!(store.inner.trigger(&t.id).unwrap().last_fired_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_panic_in_one_trigger_is_contained() {
        let inner = MemoryStore::new();
        let bad = Trigger::cron("a1", "w", "* * * * *", "bad", "");
        let good = Trigger::cron("a2", "w", "* * * * *", "good", "");
        inner.add_trigger(bad.clone()).unwrap();
        inner.add_trigger(good.clone()).unwrap();
        let store = Arc::new(FailingInsertStore {
            inner,
            fail_for: bad.id.clone(),
            panic_instead: true,
        });
        let scheduler = scheduler_with(store.clone(), Arc::new(FixedClock::new(monday_9am())));

        let outcome = scheduler.evaluate_triggers().await;
        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickSummary { fired: 1, failed: 1, .. })
        ));
        assert!(!scheduler.is_running());

        let log = store.inner.firings_for(&bad.id);
        assert_eq!(log.len(), 1);
        assert!(log[0].error.as_deref().unwrap().contains("insert exploded"));
        assert_eq!(store.inner.firings_for(&good.id).len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts_tick_and_releases_guard() {
        let scheduler = TriggerScheduler::new(Arc::new(BrokenFetchStore));
        assert_eq!(scheduler.evaluate_triggers().await, TickOutcome::FetchFailed);
        assert!(!scheduler.is_running());
        // The next tick starts fresh.
        assert_eq!(scheduler.evaluate_triggers().await, TickOutcome::FetchFailed);
    }

    #[tokio::test]
    async fn test_fetch_timeout_aborts_tick() {
        let store = Arc::new(GatedStore::default());
        let scheduler =
            TriggerScheduler::new(store.clone()).with_store_timeout(Duration::from_millis(20));

        assert_eq!(scheduler.evaluate_triggers().await, TickOutcome::FetchFailed);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_overlapping_call_is_a_noop() {
        let store = Arc::new(GatedStore::default());
        let scheduler = Arc::new(TriggerScheduler::new(store.clone()));

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.evaluate_triggers().await })
        };
        store.entered.notified().await;
        assert!(scheduler.is_running());

        assert_eq!(scheduler.evaluate_triggers().await, TickOutcome::Busy);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);

        store.release.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(_)));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_instances_do_not_share_guard() {
        let gated = Arc::new(GatedStore::default());
        let busy = Arc::new(TriggerScheduler::new(gated.clone()));
        let handle = {
            let busy = busy.clone();
            tokio::spawn(async move { busy.evaluate_triggers().await })
        };
        gated.entered.notified().await;

        let other = TriggerScheduler::new(Arc::new(MemoryStore::new()));
        assert!(matches!(other.evaluate_triggers().await, TickOutcome::Completed(_)));

        gated.release.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_insert_recorded_and_last_fired_repaired() {
        let store = Arc::new(MemoryStore::new());
        let trigger = Trigger::cron("a", "w", "* * * * *", "t", "d");
        let id = trigger.id.clone();
        store.add_trigger(trigger.clone()).unwrap();

        // A previous run created the item but never updated last_fired_at.
        let now = monday_9am();
        let item = NewWorkItem::from_trigger(&trigger, "t".into(), "d".into(), &now);
        store.insert_work_item(&item).await.unwrap();

        let scheduler = scheduler_with(store.clone(), Arc::new(FixedClock::new(now)));
        let outcome = scheduler.evaluate_triggers().await;

        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickSummary { failed: 1, .. })
        ));
        assert_eq!(store.work_items().len(), 1);
        assert_eq!(store.firings_for(&id)[0].status, FiringStatus::Failed);
        assert_eq!(
            store.trigger(&id).unwrap().last_fired_at,
            Some(now.with_timezone(&Utc))
        );
    }

    #[tokio::test]
    async fn test_malformed_expression_never_fires() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_trigger(Trigger::cron("a", "w", "every monday", "t", "d"))
            .unwrap();
        let mut webhook = Trigger::cron("a", "w", "* * * * *", "t", "d");
        webhook.trigger_type = TriggerType::Webhook;
        store.add_trigger(webhook).unwrap();

        let scheduler = scheduler_with(store.clone(), Arc::new(FixedClock::new(monday_9am())));
        let outcome = scheduler.evaluate_triggers().await;
        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickSummary { candidates: 1, due: 0, .. })
        ));
        assert!(store.work_items().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_scheduler_ticks_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_trigger(Trigger::cron("a", "w", "* * * * *", "t", "d"))
            .unwrap();
        let scheduler = Arc::new(scheduler_with(
            store.clone(),
            Arc::new(FixedClock::new(monday_9am())),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let runner = tokio::spawn(spawn_scheduler(
            scheduler.clone(),
            Duration::from_millis(10),
            async move {
                rx.await.ok();
            },
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(()).ok();
        runner.await.unwrap();

        // Many ticks, one minute: exactly one firing.
        assert_eq!(store.work_items().len(), 1);
        assert_eq!(store.firings().len(), 1);
    }

    #[tokio::test]
    async fn test_last_fired_failure_after_insert_still_counts_as_fired() {
        for fault in [Fault::UpdateFails, Fault::UpdateStalls] {
            let store = Arc::new(FaultyStore::with_fault(fault));
            let id = every_minute(&store);
            let clock = Arc::new(FixedClock::new(monday_9am()));
            let scheduler = faulty_scheduler(store.clone(), clock.clone());

            let outcome = scheduler.evaluate_triggers().await;
            assert_eq!(
                outcome,
                TickOutcome::Completed(TickSummary {
                    candidates: 1,
                    due: 1,
                    fired: 1,
                    failed: 0
                }),
                "{fault:?}"
            );
            let log = store.inner.firings_for(&id);
            assert_eq!(log.len(), 1, "{fault:?}");
            assert_eq!(log[0].status, FiringStatus::Fired);
            assert!(store.inner.trigger(&id).unwrap().last_fired_at.is_none());

            // Same minute: the item exists, so the retry is rejected and
            // last_fired_at catches up.
            store.clear();
            let outcome = scheduler.evaluate_triggers().await;
            assert!(matches!(
                outcome,
                TickOutcome::Completed(TickSummary { fired: 0, failed: 1, .. })
            ));
            assert_eq!(store.inner.work_items().len(), 1);
            assert_eq!(
                store.inner.trigger(&id).unwrap().last_fired_at,
                Some(monday_9am().with_timezone(&Utc))
            );

            clock.advance(chrono::Duration::minutes(1));
            let outcome = scheduler.evaluate_triggers().await;
            assert!(matches!(
                outcome,
                TickOutcome::Completed(TickSummary { fired: 1, failed: 0, .. })
            ));
            assert_eq!(store.inner.work_items().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_fired_log_failure_keeps_work_item() {
        let store = Arc::new(FaultyStore::with_fault(Fault::FiredLogFails));
        let id = every_minute(&store);
        let clock = Arc::new(FixedClock::new(monday_9am()));
        let scheduler = faulty_scheduler(store.clone(), clock.clone());

        let outcome = scheduler.evaluate_triggers().await;
        assert!(matches!(
            outcome,
            TickOutcome::Completed(TickSummary { fired: 1, failed: 0, .. })
        ));
        assert_eq!(store.inner.work_items().len(), 1);
        assert!(store.inner.firings_for(&id).is_empty());
        assert_eq!(
            store.inner.trigger(&id).unwrap().last_fired_at,
            Some(monday_9am().with_timezone(&Utc))
        );

        // last_fired_at was written, so the rest of the minute is quiet.
        assert!(matches!(
            scheduler.evaluate_triggers().await,
            TickOutcome::Completed(TickSummary { due: 0, .. })
        ));

        store.clear();
        clock.advance(chrono::Duration::minutes(1));
        scheduler.evaluate_triggers().await;
        assert_eq!(store.inner.work_items().len(), 2);
        let log = store.inner.firings_for(&id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, FiringStatus::Fired);
    }

    #[tokio::test]
    async fn test_insert_timeout_fails_only_that_trigger() {
        let store = Arc::new(FaultyStore::with_fault(Fault::InsertStalls));
        let id = every_minute(&store);
        let scheduler = faulty_scheduler(store.clone(), Arc::new(FixedClock::new(monday_9am())));

        let outcome = scheduler.evaluate_triggers().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(TickSummary {
                candidates: 1,
                due: 1,
                fired: 0,
                failed: 1
            })
        );
        assert!(store.inner.work_items().is_empty());
        assert!(store.inner.trigger(&id).unwrap().last_fired_at.is_none());
        let log = store.inner.firings_for(&id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, FiringStatus::Failed);
        let error = log[0].error.as_deref().unwrap();
        assert!(error.contains("Timed out") && error.contains("insert_work_item"));

        // Still due within the same minute once the store recovers.
        store.clear();
        assert!(matches!(
            scheduler.evaluate_triggers().await,
            TickOutcome::Completed(TickSummary { fired: 1, .. })
        ));
        assert_eq!(store.inner.work_items().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_tick() {
        let store = Arc::new(FaultyStore {
            insert_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let id = every_minute(&store);
        let scheduler = Arc::new(
            TriggerScheduler::new(store.clone())
                .with_clock(Arc::new(FixedClock::new(monday_9am()))),
        );

        // Shut down as soon as the first tick is inside insert_work_item.
        let started = store.clone();
        spawn_scheduler(scheduler.clone(), Duration::from_secs(60), async move {
            started.insert_started.notified().await;
        })
        .await;

        assert!(!scheduler.is_running());
        assert_eq!(store.inner.work_items().len(), 1);
        assert!(store.inner.trigger(&id).unwrap().last_fired_at.is_some());
        let log = store.inner.firings_for(&id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, FiringStatus::Fired);
    }
}
