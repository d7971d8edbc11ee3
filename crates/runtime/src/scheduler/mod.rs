//! Trigger scheduling: one shared queue fed by timers, manual commands and
//! document changes, drained by a single worker so that at most one
//! reconciliation runs at any instant.

mod queue;
mod timers;

pub use queue::{PendingTrigger, TriggerQueue, TriggerSource};
pub use timers::TimerRegistry;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use goalsync_core::Goal;
use goalsync_documents::{DocumentError, DocumentStore};
use goalsync_remote::ErrorClass;

use crate::commands::GoalStatus;
use crate::events::{LastOutcome, SyncEvent};
use crate::reconcile::{ReconcileError, Reconciler};

/// Broadcast channel capacity. Old events are dropped when subscribers lag.
const EVENT_CAP: usize = 256;

/// Goals in effect for a stretch of time.  Replaced wholesale on reconfigure,
/// never edited in place.
#[derive(Debug, Default)]
pub struct GoalSnapshot {
    goals: Vec<Goal>,
}

impl GoalSnapshot {
    pub fn new(goals: Vec<Goal>) -> Self {
        Self { goals }
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn get(&self, slug: &str) -> Option<&Goal> {
        self.goals.iter().find(|g| g.slug == slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("no goal #{index}: {count} goal(s) configured")]
    NoSuchGoal { index: usize, count: usize },
}

struct Inner {
    goals: RwLock<Arc<GoalSnapshot>>,
    queue: Arc<TriggerQueue>,
    timers: TimerRegistry,
    in_flight: AtomicBool,
    disabled: Mutex<HashSet<String>>,
    outcomes: Mutex<HashMap<String, LastOutcome>>,
    reconciler: Reconciler,
    documents: Arc<dyn DocumentStore>,
    events: broadcast::Sender<SyncEvent>,
    drain_tick: Duration,
    stop: watch::Sender<bool>,
}

/// Releases the in-flight flag when the reconciliation finishes.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cheap to clone; every clone drives the same queue and worker state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// A scheduler with no goals.  Install them with [`Scheduler::reconfigure`].
    pub fn new(reconciler: Reconciler, documents: Arc<dyn DocumentStore>, drain_tick: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAP);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                goals: RwLock::new(Arc::new(GoalSnapshot::default())),
                queue: Arc::new(TriggerQueue::new()),
                timers: TimerRegistry::new(),
                in_flight: AtomicBool::new(false),
                disabled: Mutex::new(HashSet::new()),
                outcomes: Mutex::new(HashMap::new()),
                reconciler,
                documents,
                events,
                drain_tick: drain_tick.max(Duration::from_millis(1)),
                stop,
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<GoalSnapshot> {
        self.inner
            .goals
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.inner.timers
    }

    /// Swap in a new goal set, forget disabled goals and rearm every timer.
    /// Returns the number of armed timers.
    ///
    /// A reconciliation already in flight finishes with the goal it started
    /// with.
    pub fn reconfigure(&self, goals: Vec<Goal>) -> usize {
        let snapshot = Arc::new(GoalSnapshot::new(goals));
        *self
            .inner
            .goals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();

        lock(&self.inner.disabled).clear();
        lock(&self.inner.outcomes).retain(|slug, _| snapshot.get(slug).is_some());
        let timers = self.inner.timers.rearm(snapshot.goals(), &self.inner.queue);

        info!(goals = snapshot.goals().len(), timers, "goal configuration applied");
        let _ = self.inner.events.send(SyncEvent::Reconfigured {
            goals: snapshot.goals().len(),
            timers,
        });
        timers
    }

    /// Queue a trigger for `slug`.  Returns immediately; unknown slugs are
    /// ignored.
    pub fn enqueue(&self, slug: &str, source: TriggerSource) -> bool {
        if self.snapshot().get(slug).is_none() {
            warn!(slug, %source, "trigger for unknown goal ignored");
            return false;
        }
        self.inner.queue.push(PendingTrigger::new(slug, source));
        debug!(slug, %source, depth = self.inner.queue.len(), "trigger queued");
        let _ = self.inner.events.send(SyncEvent::Enqueued {
            slug: slug.to_string(),
            source,
        });
        true
    }

    /// Queue the goal at 1-based `index` in the current goal list.
    pub fn submit_goal(&self, index: usize) -> Result<String, SubmitError> {
        let snapshot = self.snapshot();
        let goal = index
            .checked_sub(1)
            .and_then(|i| snapshot.goals().get(i))
            .ok_or(SubmitError::NoSuchGoal {
                index,
                count: snapshot.goals().len(),
            })?;
        self.enqueue(&goal.slug, TriggerSource::Manual);
        Ok(goal.slug.clone())
    }

    /// Queue every configured goal in order.  Returns the queued slugs.
    pub fn submit_all(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        snapshot
            .goals()
            .iter()
            .filter(|goal| self.enqueue(&goal.slug, TriggerSource::Manual))
            .map(|goal| goal.slug.clone())
            .collect()
    }

    /// Queue every goal whose document, as resolved at `now`, is `path`.
    pub fn enqueue_for_path(&self, path: &Path, now: DateTime<Utc>) -> Vec<String> {
        let snapshot = self.snapshot();
        let matching: Vec<String> = snapshot
            .goals()
            .iter()
            .filter(|goal| {
                let day = goal.day.stamp(now);
                self.inner.documents.resolve(&goal.document, &day).as_deref() == Some(path)
            })
            .map(|goal| goal.slug.clone())
            .collect();
        for slug in &matching {
            self.enqueue(slug, TriggerSource::ContentChange);
        }
        matching
    }

    /// Process the next trigger if no reconciliation is in flight.
    ///
    /// Returns the finished trigger's event, or `None` when the worker was
    /// busy or the queue empty.
    pub async fn drain_once(&self, now: DateTime<Utc>) -> Option<SyncEvent> {
        let _claim = self.try_claim()?;
        let trigger = self.inner.queue.pop()?;
        Some(self.process(trigger, now).await)
    }

    /// Drain loop.  Ticks every `drain_tick` until [`Scheduler::shutdown`].
    pub async fn run(&self) {
        let mut stop = self.inner.stop.subscribe();
        if *stop.borrow() {
            return;
        }
        let mut tick = tokio::time::interval(self.inner.drain_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.inner.drain_tick.as_millis() as u64, "scheduler drain loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.drain_once(Utc::now()).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!(pending = self.inner.queue.len(), "scheduler drain loop stopped");
    }

    /// Disarm every timer and stop the drain loop.  Queued triggers are
    /// dropped with the scheduler.
    pub fn shutdown(&self) {
        self.inner.timers.disarm_all();
        self.inner.stop.send_replace(true);
    }

    pub fn goal_statuses(&self) -> Vec<GoalStatus> {
        let snapshot = self.snapshot();
        let disabled = lock(&self.inner.disabled);
        let outcomes = lock(&self.inner.outcomes);
        snapshot
            .goals()
            .iter()
            .enumerate()
            .map(|(i, goal)| GoalStatus {
                index: i + 1,
                slug: goal.slug.clone(),
                metric: goal.metric.to_string(),
                document: goal.document.to_string(),
                auto_submit: goal.auto_submit,
                interval: goal.interval.to_string(),
                timer_armed: self.inner.timers.is_armed(&goal.slug),
                disabled: disabled.contains(&goal.slug),
                last_outcome: outcomes.get(&goal.slug).cloned(),
            })
            .collect()
    }

    fn try_claim(&self) -> Option<InFlightGuard<'_>> {
        self.inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(InFlightGuard(&self.inner.in_flight))
    }

    async fn process(&self, trigger: PendingTrigger, now: DateTime<Utc>) -> SyncEvent {
        let waited_ms = (Utc::now() - trigger.enqueued_at).num_milliseconds().max(0);
        debug!(slug = %trigger.slug, source = %trigger.source, waited_ms, "trigger dequeued");
        let snapshot = self.snapshot();
        let event = match snapshot.get(&trigger.slug) {
            None => SyncEvent::Skipped {
                slug: trigger.slug.clone(),
                reason: "goal is no longer configured".to_string(),
            },
            Some(goal) if lock(&self.inner.disabled).contains(&goal.slug) => SyncEvent::Skipped {
                slug: goal.slug.clone(),
                reason: "disabled until the configuration is reloaded".to_string(),
            },
            Some(goal) => self.reconcile_goal(goal, trigger.source, now).await,
        };
        self.record(&event, now);
        event
    }

    async fn reconcile_goal(&self, goal: &Goal, source: TriggerSource, now: DateTime<Utc>) -> SyncEvent {
        let day = goal.day.stamp(now);
        let Some(path) = self.inner.documents.resolve(&goal.document, &day) else {
            return SyncEvent::Skipped {
                slug: goal.slug.clone(),
                reason: format!("no document resolves for {day}"),
            };
        };

        let text = match self.inner.documents.read(&path).await {
            Ok(text) => text,
            Err(DocumentError::NotFound(missing)) => {
                info!(slug = %goal.slug, path = %missing.display(), "document missing; nothing to submit");
                return SyncEvent::Skipped {
                    slug: goal.slug.clone(),
                    reason: format!("{} does not exist", missing.display()),
                };
            }
            Err(err) => return self.failure(goal, err.into()),
        };

        let label = path.display().to_string();
        match self.inner.reconciler.reconcile(goal, &label, &text, now).await {
            Ok(action) => {
                info!(
                    slug = %goal.slug,
                    %source,
                    action = action.label(),
                    value = action.datapoint().value,
                    daystamp = %day,
                    "goal reconciled"
                );
                SyncEvent::Reconciled {
                    slug: goal.slug.clone(),
                    source,
                    action,
                }
            }
            Err(err) => self.failure(goal, err),
        }
    }

    fn failure(&self, goal: &Goal, err: ReconcileError) -> SyncEvent {
        let slug = goal.slug.clone();
        let message = err.to_string();
        match err.class() {
            ErrorClass::Auth => {
                error!(slug = %slug, %err, "remote rejected the credentials; check remote.auth_token");
                SyncEvent::AuthFailed { slug, message }
            }
            ErrorClass::NotFound => {
                warn!(slug = %slug, "remote goal not found; disabled until the configuration is reloaded");
                lock(&self.inner.disabled).insert(slug.clone());
                SyncEvent::Failed {
                    slug,
                    class: ErrorClass::NotFound,
                    message,
                }
            }
            ErrorClass::Transient => {
                warn!(slug = %slug, %err, "reconciliation failed; the next trigger retries");
                SyncEvent::Failed {
                    slug,
                    class: ErrorClass::Transient,
                    message,
                }
            }
        }
    }

    fn record(&self, event: &SyncEvent, now: DateTime<Utc>) {
        if let Some(slug) = event.slug() {
            lock(&self.inner.outcomes).insert(slug.to_string(), LastOutcome::from_event(event, now));
        }
        let _ = self.inner.events.send(event.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use goalsync_config::UpdatePolicy;
    use goalsync_core::{DayCutoff, DayRule, DayStamp, DocumentRef, MetricKind};
    use goalsync_documents::FsDocumentStore;
    use goalsync_remote::{
        GoalService, InMemoryGoalService, RemoteCall, RemoteDatapoint, RemoteError,
    };

    use crate::reconcile::Action;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        service: Arc<InMemoryGoalService>,
        scheduler: Scheduler,
    }

    fn fixture_with(service: InMemoryGoalService, goals: Vec<Goal>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("Daily")).unwrap();
        let service = Arc::new(service);
        let documents = Arc::new(FsDocumentStore::new(&root).with_daily_notes("Daily", "%Y-%m-%d"));
        let reconciler = Reconciler::new(service.clone(), UpdatePolicy::AlwaysOverwrite);
        let scheduler = Scheduler::new(reconciler, documents, Duration::from_millis(5));
        scheduler.reconfigure(goals);
        Fixture {
            _dir: dir,
            root,
            service,
            scheduler,
        }
    }

    fn fixture(goals: Vec<Goal>) -> Fixture {
        fixture_with(InMemoryGoalService::new(), goals)
    }

    fn note_goal(slug: &str, note: &str) -> Goal {
        Goal::new(slug, MetricKind::WordCount, DocumentRef::Path(note.into())).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn write(root: &Path, rel: &str, text: &str) {
        fs::write(root.join(rel), text).unwrap();
    }

    #[tokio::test]
    async fn submit_goal_is_one_based_and_range_checked() {
        let f = fixture(vec![note_goal("a", "a.md"), note_goal("b", "b.md")]);

        assert_eq!(
            f.scheduler.submit_goal(0),
            Err(SubmitError::NoSuchGoal { index: 0, count: 2 })
        );
        assert_eq!(
            f.scheduler.submit_goal(3),
            Err(SubmitError::NoSuchGoal { index: 3, count: 2 })
        );
        assert_eq!(f.scheduler.submit_goal(2).unwrap(), "b");
        assert_eq!(f.scheduler.submit_all(), vec!["a", "b"]);
        assert_eq!(f.scheduler.inner.queue.pending(), vec!["b", "a", "b"]);
    }

    #[tokio::test]
    async fn unknown_slugs_are_not_queued() {
        let f = fixture(vec![note_goal("a", "a.md")]);
        assert!(!f.scheduler.enqueue("ghost", TriggerSource::Manual));
        assert_eq!(f.scheduler.queue_depth(), 0);
    }

    #[tokio::test]
    async fn drain_processes_one_trigger_per_call() {
        let f = fixture(vec![note_goal("words", "note.md")]);
        write(&f.root, "note.md", "one two three");
        f.scheduler.enqueue("words", TriggerSource::Manual);
        f.scheduler.enqueue("words", TriggerSource::Manual);
        let now = utc(2024, 3, 1, 12);

        let first = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(
            first,
            SyncEvent::Reconciled { action: Action::Created(ref dp), .. } if dp.value == 3.0
        ));
        assert_eq!(f.scheduler.queue_depth(), 1);

        let second = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(second, SyncEvent::Reconciled { action: Action::Updated(_), .. }));
        assert!(f.scheduler.drain_once(now).await.is_none());
        assert!(!f.scheduler.is_in_flight());
    }

    #[tokio::test]
    async fn missing_document_is_skipped_without_remote_calls() {
        let f = fixture(vec![note_goal("words", "absent.md")]);
        f.scheduler.enqueue("words", TriggerSource::Timer);

        let event = f.scheduler.drain_once(utc(2024, 3, 1, 12)).await.unwrap();
        assert!(matches!(event, SyncEvent::Skipped { .. }));
        assert!(f.service.calls().is_empty());

        let status = &f.scheduler.goal_statuses()[0];
        assert!(status.last_outcome.as_ref().unwrap().ok);
    }

    #[tokio::test]
    async fn failures_are_contained_per_goal() {
        let service = InMemoryGoalService::new();
        service.fail_with("broken", RemoteError::Network("connection reset".into()));
        let f = fixture_with(
            service,
            vec![note_goal("broken", "note.md"), note_goal("fine", "note.md")],
        );
        write(&f.root, "note.md", "alpha beta");
        f.scheduler.submit_all();
        let now = utc(2024, 3, 1, 12);

        let first = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(
            first,
            SyncEvent::Failed { class: ErrorClass::Transient, .. }
        ));
        let second = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(second, SyncEvent::Reconciled { .. }));
        assert_eq!(f.service.datapoints("fine").len(), 1);

        let statuses = f.scheduler.goal_statuses();
        assert!(!statuses[0].last_outcome.as_ref().unwrap().ok);
        assert!(statuses[1].last_outcome.as_ref().unwrap().ok);
        assert!(!statuses[0].disabled);
    }

    #[tokio::test]
    async fn missing_remote_goal_is_disabled_until_reconfigure() {
        let service = InMemoryGoalService::new();
        service.fail_with("typo", RemoteError::NotFound("typo".into()));
        let goals = vec![note_goal("typo", "note.md")];
        let f = fixture_with(service, goals.clone());
        write(&f.root, "note.md", "words");
        let now = utc(2024, 3, 1, 12);

        f.scheduler.enqueue("typo", TriggerSource::Manual);
        let event = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(event, SyncEvent::Failed { class: ErrorClass::NotFound, .. }));
        assert!(f.scheduler.goal_statuses()[0].disabled);

        f.scheduler.enqueue("typo", TriggerSource::Manual);
        let skipped = f.scheduler.drain_once(now).await.unwrap();
        assert!(matches!(skipped, SyncEvent::Skipped { .. }));
        assert_eq!(f.service.calls().len(), 1);

        f.scheduler.reconfigure(goals);
        assert!(!f.scheduler.goal_statuses()[0].disabled);
        f.scheduler.enqueue("typo", TriggerSource::Manual);
        f.scheduler.drain_once(now).await.unwrap();
        assert_eq!(f.service.calls().len(), 2);
    }

    /// Deletes the datapoint it just returned, as an edit on the service
    /// between the read and the write would.
    struct DeletedAfterRead(Arc<InMemoryGoalService>);

    #[async_trait::async_trait]
    impl GoalService for DeletedAfterRead {
        async fn fetch_last(&self, slug: &str) -> Result<RemoteDatapoint, RemoteError> {
            let last = self.0.fetch_last(slug).await?;
            self.0.remove(slug, &last.id);
            Ok(last)
        }

        async fn create(
            &self,
            slug: &str,
            value: f64,
            daystamp: &DayStamp,
            comment: &str,
        ) -> Result<RemoteDatapoint, RemoteError> {
            self.0.create(slug, value, daystamp, comment).await
        }

        async fn update(
            &self,
            slug: &str,
            id: &str,
            value: f64,
            comment: &str,
        ) -> Result<RemoteDatapoint, RemoteError> {
            self.0.update(slug, id, value, comment).await
        }
    }

    #[tokio::test]
    async fn datapoint_deleted_remotely_is_recreated_on_the_next_trigger() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "note.md", "one two three");
        let goal = note_goal("writing", "note.md");
        let now = utc(2024, 3, 1, 12);

        let remote = Arc::new(InMemoryGoalService::new());
        remote.seed(
            "writing",
            RemoteDatapoint {
                id: "gone".to_string(),
                value: 1.0,
                daystamp: Some(goal.day.stamp(now)),
                comment: String::new(),
            },
        );
        let reconciler = Reconciler::new(
            Arc::new(DeletedAfterRead(remote.clone())),
            UpdatePolicy::AlwaysOverwrite,
        );
        let scheduler = Scheduler::new(
            reconciler,
            Arc::new(FsDocumentStore::new(dir.path())),
            Duration::from_millis(5),
        );
        scheduler.reconfigure(vec![goal]);

        scheduler.enqueue("writing", TriggerSource::Manual);
        let first = scheduler.drain_once(now).await.unwrap();
        assert!(matches!(
            first,
            SyncEvent::Failed { class: ErrorClass::Transient, .. }
        ));
        assert!(!scheduler.goal_statuses()[0].disabled);

        scheduler.enqueue("writing", TriggerSource::Manual);
        let second = scheduler.drain_once(now).await.unwrap();
        assert!(matches!(
            second,
            SyncEvent::Reconciled { action: Action::Created(_), .. }
        ));
        let points = remote.datapoints("writing");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 3.0);
    }

    #[tokio::test]
    async fn auth_failures_are_broadcast() {
        let service = InMemoryGoalService::new();
        service.fail_with("g", RemoteError::Auth("401 Unauthorized".into()));
        let f = fixture_with(service, vec![note_goal("g", "note.md")]);
        write(&f.root, "note.md", "words");
        let mut events = f.scheduler.subscribe();

        f.scheduler.enqueue("g", TriggerSource::Manual);
        f.scheduler.drain_once(utc(2024, 3, 1, 12)).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Enqueued { .. }));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn second_drain_waits_while_one_is_in_flight() {
        let f = fixture_with(
            InMemoryGoalService::new().with_latency(Duration::from_millis(200)),
            vec![note_goal("words", "note.md")],
        );
        write(&f.root, "note.md", "a b c");
        for _ in 0..3 {
            f.scheduler.enqueue("words", TriggerSource::ContentChange);
        }
        let now = utc(2024, 3, 1, 12);

        let busy = f.scheduler.clone();
        let first = tokio::spawn(async move { busy.drain_once(now).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(f.scheduler.is_in_flight());
        assert!(f.scheduler.drain_once(now).await.is_none());
        assert_eq!(f.scheduler.queue_depth(), 2);

        assert!(first.await.unwrap().is_some());
        assert!(!f.scheduler.is_in_flight());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_of_triggers_never_overlaps_remote_calls() {
        let f = fixture_with(
            InMemoryGoalService::new().with_latency(Duration::from_millis(5)),
            vec![note_goal("words", "note.md")],
        );
        write(&f.root, "note.md", "a b c d");
        for _ in 0..6 {
            f.scheduler.enqueue("words", TriggerSource::ContentChange);
        }

        let mut workers = Vec::new();
        for _ in 0..4 {
            let s = f.scheduler.clone();
            workers.push(tokio::spawn(async move { s.run().await }));
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while (f.scheduler.queue_depth() > 0 || f.scheduler.is_in_flight())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.scheduler.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(f.scheduler.queue_depth(), 0);
        assert_eq!(f.service.max_in_flight(), 1);
        let fetches = f
            .service
            .calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::FetchLast { .. }))
            .count();
        assert_eq!(fetches, 6);
        assert_eq!(f.service.datapoints("words").len(), 1);
    }

    #[tokio::test]
    async fn day_boundary_selects_the_daily_note_and_datapoint() {
        let goal = Goal::new("tasks", MetricKind::CompletedTasks, DocumentRef::DailyNote)
            .unwrap()
            .with_day_rule(DayRule::new(chrono_tz::UTC, "06:00".parse::<DayCutoff>().unwrap()));
        let f = fixture(vec![goal]);
        write(&f.root, "Daily/2024-02-29.md", "- [x] a\n- [x] b\n");
        write(&f.root, "Daily/2024-03-01.md", "- [x] a\n- [ ] b\n");

        f.scheduler.enqueue("tasks", TriggerSource::Manual);
        let late = f.scheduler.drain_once(utc(2024, 3, 1, 2)).await.unwrap();
        let SyncEvent::Reconciled { action, .. } = late else {
            panic!("expected reconciliation, got {late:?}");
        };
        assert_eq!(action.datapoint().daystamp, Some("2024-02-29".parse().unwrap()));
        assert_eq!(action.datapoint().value, 2.0);

        f.scheduler.enqueue("tasks", TriggerSource::Manual);
        let morning = f.scheduler.drain_once(utc(2024, 3, 1, 7)).await.unwrap();
        let SyncEvent::Reconciled { action, .. } = morning else {
            panic!("expected reconciliation, got {morning:?}");
        };
        assert_eq!(action.label(), "created");
        assert_eq!(action.datapoint().daystamp, Some("2024-03-01".parse().unwrap()));
        assert_eq!(action.datapoint().value, 1.0);
    }

    #[tokio::test]
    async fn changed_paths_map_to_their_goals() {
        let f = fixture(vec![
            note_goal("a", "shared.md"),
            note_goal("b", "shared.md"),
            note_goal("c", "other.md"),
        ]);
        let now = utc(2024, 3, 1, 12);
        let queued = f.scheduler.enqueue_for_path(&f.root.join("shared.md"), now);
        assert_eq!(queued, vec!["a", "b"]);
        assert!(f.scheduler.enqueue_for_path(&f.root.join("nope.md"), now).is_empty());
        assert_eq!(f.scheduler.queue_depth(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_the_drain_loop_and_timers() {
        let goal = note_goal("timed", "note.md")
            .with_schedule(true, goalsync_core::PollInterval::new(1, 0, 0));
        let f = fixture(vec![goal]);
        assert_eq!(f.scheduler.timers().armed(), vec!["timed"]);

        let runner = f.scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        f.scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(f.scheduler.timers().armed().is_empty());
    }
}
