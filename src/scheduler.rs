//! Named periodic tasks driven by a single clock.
//!
//! Every task carries a [`Trigger`] (anchor time of day, interval, auto-start
//! flag). The clock scans all tasks at a fixed resolution and launches the
//! action of every due, enabled task on its own tokio task. A task never runs
//! twice at once: a fire that comes due while the previous run is still
//! active is dropped. Triggers can be swapped at runtime with
//! [`Scheduler::reload`], which keeps the last execution and run state.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, Timelike, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;

use crate::error::SchedulerError;
use crate::persistence::PersistenceGateway;

/// Resolution of the scheduling clock.
pub const TICK: Duration = Duration::from_secs(1);

/// Unit of work run by a task.
pub type Action = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure into an [`Action`].
pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Time of day a task's fire times are aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub hour: u32,
    pub minute: u32,
}

impl Anchor {
    /// Minutes past 59 carry into the hour, hours wrap around the day.
    pub fn new(hour: u32, minute: u32) -> Self {
        let total = hour * 60 + minute;
        Anchor {
            hour: (total / 60) % 24,
            minute: total % 60,
        }
    }

    /// The time of day `offset` after `now`.
    pub fn after(now: DateTime<Local>, offset: Duration) -> Self {
        let at = now + seconds(offset);
        Anchor::new(at.hour(), at.minute())
    }

    /// First fire time that is the anchor (today) plus a whole number of
    /// intervals and not before `now`.
    pub fn first_fire(&self, now: DateTime<Local>, interval: Duration) -> DateTime<Local> {
        let anchor = NaiveTime::from_hms_opt(self.hour, self.minute, 0)
            .and_then(|time| {
                now.date_naive()
                    .and_time(time)
                    .and_local_timezone(Local)
                    .earliest()
            })
            .unwrap_or(now);

        if anchor >= now {
            return anchor;
        }

        let step = seconds(interval).num_seconds().max(1);
        let behind = (now - anchor).num_seconds();
        anchor + chrono::Duration::seconds((behind / step + 1) * step)
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

fn seconds(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs().min(u64::from(u32::MAX)) as i64)
}

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub anchor: Anchor,
    pub interval: Duration,
    pub auto_start: bool,
}

impl Trigger {
    pub fn new(anchor: Anchor, interval: Duration, auto_start: bool) -> Self {
        Trigger {
            anchor,
            interval,
            auto_start,
        }
    }
}

/// Read-only view of a registered task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub name: String,
    pub trigger: Trigger,
    pub next_fire: DateTime<Local>,
    pub last_execution: Option<DateTime<Utc>>,
    pub running: bool,
}

struct Task {
    trigger: Trigger,
    next_fire: DateTime<Local>,
    last_execution: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
    action: Action,
}

impl Task {
    fn info(&self, name: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            trigger: self.trigger,
            next_fire: self.next_fire,
            last_execution: self.last_execution,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Moves `next_fire` one interval forward. A task that fell behind by
    /// more than that is resynced to `now + interval`; missed fires are not
    /// replayed.
    fn advance(&mut self, now: DateTime<Local>) {
        let interval = seconds(self.trigger.interval);
        let next = self.next_fire + interval;
        self.next_fire = if next <= now { now + interval } else { next };
    }
}

/// Clears the running flag when a run ends, panicking or not.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    tasks: Mutex<HashMap<String, Task>>,
    gateway: Arc<dyn PersistenceGateway>,
    tracker: TaskTracker,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(self: &Arc<Self>, now: DateTime<Local>) -> Vec<JoinHandle<()>> {
        let mut tasks = self.tasks();
        let mut launched = Vec::new();

        for (name, task) in tasks.iter_mut() {
            if task.next_fire > now {
                continue;
            }
            task.advance(now);

            if !task.trigger.auto_start {
                continue;
            }
            if task.running.swap(true, Ordering::SeqCst) {
                log::warn!("Task `{name}` is still running, skipping this run");
                continue;
            }
            launched.push(self.launch(name, task));
        }

        launched
    }

    /// Spawns the action. The caller must have set the running flag.
    fn launch(self: &Arc<Self>, name: &str, task: &Task) -> JoinHandle<()> {
        let guard = RunGuard(task.running.clone());
        let action = task.action.clone();
        let shared = self.clone();
        let name = name.to_string();

        self.tracker.spawn(async move {
            let _guard = guard;
            let started = Utc::now();

            log::info!("Running task `{name}`");
            if let Err(err) = action().await {
                log::error!("Task `{name}` failed: {err:#}");
            }

            shared.record_execution(&name, started);
        })
    }

    fn record_execution(&self, name: &str, at: DateTime<Utc>) {
        if let Some(task) = self.tasks().get_mut(name) {
            task.last_execution = Some(at);
        }
        if let Err(err) = self.gateway.set_last_execution(name, at) {
            log::error!("Unable to save last execution of task `{name}`: {err}");
        }
    }
}

struct Clock {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    clock: Mutex<Option<Clock>>,
    resolution: Duration,
}

impl Scheduler {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                gateway,
                tracker: TaskTracker::new(),
            }),
            clock: Mutex::new(None),
            resolution: TICK,
        }
    }

    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    /// Registers a task. Its last execution is restored from the gateway.
    pub fn create_task(
        &self,
        name: &str,
        trigger: Trigger,
        action: Action,
    ) -> Result<(), SchedulerError> {
        self.create_task_at(name, trigger, action, Local::now())
    }

    fn create_task_at(
        &self,
        name: &str,
        trigger: Trigger,
        action: Action,
        now: DateTime<Local>,
    ) -> Result<(), SchedulerError> {
        check_interval(name, &trigger)?;

        let mut tasks = self.shared.tasks();
        if tasks.contains_key(name) {
            return Err(SchedulerError::DuplicateTask {
                name: name.to_string(),
            });
        }

        let last_execution = self
            .shared
            .gateway
            .last_execution(name)
            .unwrap_or_else(|err| {
                log::error!("Unable to read last execution of task `{name}`: {err}");
                None
            });

        let next_fire = trigger.anchor.first_fire(now, trigger.interval);
        log::debug!("Created task `{name}`, first run at {next_fire}");

        tasks.insert(
            name.to_string(),
            Task {
                trigger,
                next_fire,
                last_execution,
                running: Arc::new(AtomicBool::new(false)),
                action,
            },
        );
        Ok(())
    }

    /// Replaces the trigger of an existing task. The last execution, the
    /// action and a run in progress are left alone.
    pub fn reload(&self, name: &str, trigger: Trigger) -> Result<(), SchedulerError> {
        self.reload_at(name, trigger, Local::now())
    }

    fn reload_at(
        &self,
        name: &str,
        trigger: Trigger,
        now: DateTime<Local>,
    ) -> Result<(), SchedulerError> {
        check_interval(name, &trigger)?;

        let mut tasks = self.shared.tasks();
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })?;

        task.trigger = trigger;
        task.next_fire = trigger.anchor.first_fire(now, trigger.interval);

        log::info!(
            "Reloaded task `{name}`: every {}s from {}, next run at {}, {}",
            trigger.interval.as_secs(),
            trigger.anchor,
            task.next_fire,
            if trigger.auto_start { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<TaskInfo> {
        self.shared.tasks().get(name).map(|task| task.info(name))
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .shared
            .tasks()
            .iter()
            .map(|(name, task)| task.info(name))
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Runs a task right away, enabled or not. Returns `None` when the task
    /// is already running.
    pub fn run_now(&self, name: &str) -> Result<Option<JoinHandle<()>>, SchedulerError> {
        let tasks = self.shared.tasks();
        let task = tasks.get(name).ok_or_else(|| SchedulerError::UnknownTask {
            name: name.to_string(),
        })?;

        if task.running.swap(true, Ordering::SeqCst) {
            log::info!("Task `{name}` is already running");
            return Ok(None);
        }
        Ok(Some(self.shared.launch(name, task)))
    }

    /// Fires every task due at `now`.
    pub fn tick(&self, now: DateTime<Local>) -> Vec<JoinHandle<()>> {
        self.shared.tick(now)
    }

    /// Starts the clock. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        if clock.is_some() {
            log::warn!("Scheduler already started");
            return;
        }

        self.shared.tracker.reopen();
        let (shutdown, mut stopped) = watch::channel(false);
        let shared = self.shared.clone();
        let resolution = self.resolution;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        shared.tick(Local::now());
                    }
                }
            }
        });

        log::info!("Scheduler started with {} tasks", self.shared.tasks().len());
        *clock = Some(Clock { shutdown, handle });
    }

    /// Stops the clock right away, then waits for runs already in flight.
    /// Actions are never interrupted.
    pub async fn stop(&self) {
        let clock = self
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(clock) = clock {
            let _ = clock.shutdown.send(true);
            if let Err(err) = clock.handle.await {
                log::error!("Scheduler clock ended abnormally: {err}");
            }
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        log::info!("Scheduler stopped");
    }
}

fn check_interval(name: &str, trigger: &Trigger) -> Result<(), SchedulerError> {
    if trigger.interval.as_secs() == 0 {
        return Err(SchedulerError::InvalidInterval {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;
    use tokio::sync::Notify;

    use crate::testing::MemoryGateway;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Action {
        let counter = counter.clone();
        action(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn scheduler() -> (Scheduler, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::default());
        (Scheduler::new(gateway.clone()), gateway)
    }

    async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn anchor_normalizes_overflowing_minutes() {
        assert_eq!(Anchor::new(10, 125), Anchor::new(12, 5));
        assert_eq!(Anchor::new(23, 60), Anchor::new(0, 0));
    }

    #[test]
    fn first_fire_is_never_in_the_past() {
        let anchor = Anchor::new(9, 0);
        assert_eq!(anchor.first_fire(at(8, 0), HOUR), at(9, 0));
        assert_eq!(anchor.first_fire(at(9, 0), HOUR), at(9, 0));
        assert_eq!(anchor.first_fire(at(11, 30), HOUR), at(12, 0));
        assert_eq!(
            Anchor::new(3, 0).first_fire(at(4, 0), 24 * HOUR),
            at(3, 0) + chrono::Duration::days(1)
        );
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(0, 0), HOUR, true);

        scheduler
            .create_task("Movie Search", trigger, counting(&counter))
            .unwrap();
        let err = scheduler
            .create_task("Movie Search", trigger, counting(&counter))
            .unwrap_err();

        assert!(matches!(err, SchedulerError::DuplicateTask { .. }));
    }

    #[tokio::test]
    async fn reloading_an_unknown_task_fails() {
        let (scheduler, _) = scheduler();
        let trigger = Trigger::new(Anchor::new(0, 0), HOUR, true);

        assert!(matches!(
            scheduler.reload("Trakt Sync", trigger),
            Err(SchedulerError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(0, 0), Duration::ZERO, true);

        assert!(matches!(
            scheduler.create_task("IMDB Sync", trigger, counting(&counter)),
            Err(SchedulerError::InvalidInterval { .. })
        ));
    }

    #[tokio::test]
    async fn due_task_fires_once_and_advances() {
        let (scheduler, gateway) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(12, 0), HOUR, true);
        scheduler
            .create_task_at("Movie Search", trigger, counting(&counter), at(11, 0))
            .unwrap();

        assert!(scheduler.tick(at(11, 59)).is_empty());

        join(scheduler.tick(at(12, 0))).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let task = scheduler.task("Movie Search").unwrap();
        assert_eq!(task.next_fire, at(13, 0));
        assert!(task.last_execution.is_some());
        assert_eq!(
            gateway.last_execution("Movie Search").unwrap(),
            task.last_execution
        );

        assert!(scheduler.tick(at(12, 30)).is_empty());
    }

    #[tokio::test]
    async fn overdue_task_fires_once_and_resyncs() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(1, 0), HOUR, true);
        scheduler
            .create_task_at("Metadata Update", trigger, counting(&counter), at(0, 30))
            .unwrap();

        let now = at(6, 10);
        join(scheduler.tick(now)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.task("Metadata Update").unwrap().next_fire,
            now + chrono::Duration::hours(1)
        );
    }

    #[tokio::test]
    async fn disabled_task_does_not_fire() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(12, 0), HOUR, false);
        scheduler
            .create_task_at("IMDB Sync", trigger, counting(&counter), at(11, 0))
            .unwrap();

        assert!(scheduler.tick(at(12, 0)).is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduler.task("IMDB Sync").unwrap().next_fire > at(12, 0));
    }

    #[tokio::test]
    async fn running_task_is_not_fired_again() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let blocking = {
            let counter = counter.clone();
            let release = release.clone();
            action(move || {
                let counter = counter.clone();
                let release = release.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            })
        };
        let trigger = Trigger::new(Anchor::new(12, 0), HOUR, true);
        scheduler
            .create_task_at("Torrents Status Check", trigger, blocking, at(11, 0))
            .unwrap();

        let first = scheduler.tick(at(12, 0));
        assert_eq!(first.len(), 1);
        tokio::task::yield_now().await;

        assert!(scheduler.tick(at(13, 0)).is_empty());
        assert!(scheduler.run_now("Torrents Status Check").unwrap().is_none());
        assert!(scheduler.task("Torrents Status Check").unwrap().running);

        release.notify_one();
        join(first).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.task("Torrents Status Check").unwrap().running);
    }

    #[tokio::test]
    async fn failing_action_keeps_the_task_scheduled() {
        let (scheduler, gateway) = scheduler();
        let failing = action(|| async { Err(anyhow::anyhow!("indexer offline")) });
        let trigger = Trigger::new(Anchor::new(12, 0), HOUR, true);
        scheduler
            .create_task_at("Movie Search", trigger, failing, at(11, 0))
            .unwrap();

        join(scheduler.tick(at(12, 0))).await;
        assert!(gateway.last_execution("Movie Search").unwrap().is_some());

        assert_eq!(scheduler.tick(at(13, 0)).len(), 1);
    }

    #[tokio::test]
    async fn reload_preserves_last_execution() {
        let (scheduler, _) = scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(12, 0), HOUR, true);
        scheduler
            .create_task_at("Trakt Sync", trigger, counting(&counter), at(11, 0))
            .unwrap();
        join(scheduler.tick(at(12, 0))).await;
        let before = scheduler.task("Trakt Sync").unwrap();

        let new_trigger = Trigger::new(Anchor::new(12, 45), 2 * HOUR, false);
        scheduler
            .reload_at("Trakt Sync", new_trigger, at(12, 15))
            .unwrap();

        let after = scheduler.task("Trakt Sync").unwrap();
        assert_eq!(after.last_execution, before.last_execution);
        assert_eq!(after.trigger, new_trigger);
        assert_eq!(after.next_fire, at(12, 45));
    }

    #[tokio::test]
    async fn last_execution_is_restored_on_create() {
        let (scheduler, gateway) = scheduler();
        let previous = Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap();
        gateway.set_last_execution("Missing Files Scan", previous).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::new(Anchor::new(2, 0), 24 * HOUR, true);
        scheduler
            .create_task("Missing Files Scan", trigger, counting(&counter))
            .unwrap();

        assert_eq!(
            scheduler.task("Missing Files Scan").unwrap().last_execution,
            Some(previous)
        );
    }

    #[tokio::test]
    async fn stop_waits_for_runs_in_flight() {
        let (scheduler, _) = scheduler();
        let done = Arc::new(AtomicBool::new(false));
        let slow = {
            let done = done.clone();
            action(move || {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let trigger = Trigger::new(Anchor::new(0, 0), 24 * HOUR, false);
        scheduler.create_task("Metadata Update", trigger, slow).unwrap();

        scheduler.start();
        assert!(scheduler.run_now("Metadata Update").unwrap().is_some());
        scheduler.stop().await;

        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clock_fires_until_stopped() {
        let gateway = Arc::new(MemoryGateway::default());
        let scheduler = Scheduler::new(gateway).with_resolution(Duration::from_millis(20));
        let counter = Arc::new(AtomicUsize::new(0));
        let anchor = Anchor::after(Local::now(), Duration::ZERO);
        let trigger = Trigger::new(anchor, Duration::from_secs(1), true);
        scheduler
            .create_task("Postprocessed Paths Scan", trigger, counting(&counter))
            .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await;

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }
}
