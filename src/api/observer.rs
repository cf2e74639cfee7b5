//! Purpose: Periodically check watched tasks and record when their condition is met.
//! Exports: `Observer`, `ObserverConfig`, `CheckReport`, `check_task`.
//! Role: Scheduler behind `sentinel serve`; one timer per incomplete task.
//! Invariants: A task is scheduled at most once; completed or removed tasks are never rescheduled.
//! Invariants: The first check runs immediately, then every `interval` (missed ticks skipped).
//! Invariants: At most `max_concurrent_checks` matcher calls run at once, on the blocking pool.
//! Invariants: Check failures are logged and retried on the next tick.
//! Notes: Must be used from within a tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::TaskClient;
use super::matcher::{MatchOutcome, MatchRequest, Matcher};
use crate::core::error::{Error, ErrorKind};
use crate::core::task::Task;
use crate::core::task_log::{RegisterMode, Registered};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 4;

#[derive(Clone, Copy, Debug)]
pub struct ObserverConfig {
    pub interval: Duration,
    pub max_concurrent_checks: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckReport {
    pub task: Task,
    pub outcome: MatchOutcome,
}

#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    client: TaskClient,
    matcher: Arc<dyn Matcher>,
    interval: Duration,
    permits: Arc<Semaphore>,
    schedules: Mutex<HashMap<String, Schedule>>,
    generations: AtomicU64,
}

/// A running schedule; `generation` tells a finishing loop whether the entry is still its own.
struct Schedule {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Observer {
    pub fn new(
        client: TaskClient,
        matcher: Arc<dyn Matcher>,
        config: ObserverConfig,
    ) -> Result<Self, Error> {
        if config.interval.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("check interval must be greater than zero")
                .with_hint("Use a positive value like 30 seconds."));
        }
        if config.max_concurrent_checks == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("max concurrent checks must be greater than zero")
                .with_hint("Use a positive value like 4."));
        }
        Ok(Self {
            inner: Arc::new(ObserverInner {
                client,
                matcher,
                interval: config.interval,
                permits: Arc::new(Semaphore::new(config.max_concurrent_checks)),
                schedules: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        })
    }

    pub fn client(&self) -> &TaskClient {
        &self.inner.client
    }

    pub fn matcher(&self) -> Arc<dyn Matcher> {
        Arc::clone(&self.inner.matcher)
    }

    /// Creates the task log if needed and schedules every incomplete task in it.
    pub fn start(&self) -> Result<usize, Error> {
        self.inner.client.ensure_log()?;
        let tasks = self.inner.client.list()?;
        let total = tasks.len();
        let scheduled = tasks
            .into_iter()
            .filter(|task| self.inner.schedule(task.clone()))
            .count();
        info!(
            log = %self.inner.client.log_path().display(),
            total,
            scheduled,
            "loaded task log"
        );
        Ok(scheduled)
    }

    pub fn register(
        &self,
        target: impl Into<String>,
        query: impl Into<String>,
        mode: RegisterMode,
    ) -> Result<Registered, Error> {
        let registered = self.inner.client.register(target, query, mode)?;
        if self.inner.schedule(registered.task().clone()) {
            info!(task_id = %registered.task().id, query = %registered.task().query, "scheduled task");
        }
        Ok(registered)
    }

    pub fn remove(&self, id: &str) -> Result<Task, Error> {
        self.inner.cancel(id);
        self.inner.client.remove(id)
    }

    pub fn set_complete(&self, id: &str, complete: bool) -> Result<Task, Error> {
        let task = self.inner.client.set_complete(id, complete)?;
        self.inner.cancel(id);
        if !complete {
            self.inner.schedule(task.clone());
        }
        Ok(task)
    }

    /// Runs one check right away, persisting completion on a match.
    pub async fn check_now(&self, id: &str) -> Result<CheckReport, Error> {
        let task = self.inner.refresh(id).await?;
        let report = self.inner.check(task).await?;
        if report.outcome.matched {
            self.inner.cancel(id);
        }
        Ok(report)
    }

    pub fn scheduled(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_schedules().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.inner.lock_schedules().contains_key(id)
    }

    pub fn shutdown(&self) {
        let drained: Vec<(String, Schedule)> = self.inner.lock_schedules().drain().collect();
        for (_, schedule) in &drained {
            schedule.handle.abort();
        }
        debug!(cancelled = drained.len(), "observer shut down");
    }
}

impl ObserverInner {
    fn lock_schedules(&self) -> MutexGuard<'_, HashMap<String, Schedule>> {
        self.schedules
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn schedule(self: &Arc<Self>, task: Task) -> bool {
        if task.complete {
            return false;
        }
        let mut schedules = self.lock_schedules();
        if schedules.contains_key(&task.id) {
            return false;
        }
        let id = task.id.clone();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_schedule(task, generation).await });
        schedules.insert(id, Schedule { generation, handle });
        true
    }

    fn cancel(&self, id: &str) {
        if let Some(schedule) = self.lock_schedules().remove(id) {
            schedule.handle.abort();
            debug!(task_id = id, "cancelled task schedule");
        }
    }

    async fn run_schedule(self: Arc<Self>, task: Task, generation: u64) {
        let id = task.id.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let current = match self.refresh(&id).await {
                Ok(current) => current,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    info!(task_id = %id, "task left the log; stopping checks");
                    break;
                }
                Err(err) => {
                    warn!(task_id = %id, error = %err, "failed to read task; will retry");
                    continue;
                }
            };
            if current.complete {
                info!(task_id = %id, "task already complete; stopping checks");
                break;
            }

            debug!(task_id = %id, target = %current.target, "checking task");
            match self.check(current).await {
                Ok(report) if report.outcome.matched => {
                    info!(
                        task_id = %id,
                        query = %report.task.query,
                        score = ?report.outcome.score,
                        "task complete"
                    );
                    break;
                }
                Ok(report) => {
                    debug!(task_id = %id, score = ?report.outcome.score, "no match yet");
                }
                Err(err) => {
                    warn!(task_id = %id, error = %err, "task check failed");
                }
            }
        }
        let mut schedules = self.lock_schedules();
        if schedules
            .get(&id)
            .is_some_and(|schedule| schedule.generation == generation)
        {
            schedules.remove(&id);
        }
    }

    async fn refresh(&self, id: &str) -> Result<Task, Error> {
        let client = self.client.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || client.get(&id))
            .await
            .map_err(join_error)?
    }

    async fn check(&self, task: Task) -> Result<CheckReport, Error> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("observer check permits closed")
                    .with_source(err)
            })?;
        let matcher = Arc::clone(&self.matcher);
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || check_task(&client, matcher.as_ref(), task))
            .await
            .map_err(join_error)?
    }
}

/// Evaluates `task` once and persists completion on a match. Blocking.
pub fn check_task(
    client: &TaskClient,
    matcher: &dyn Matcher,
    task: Task,
) -> Result<CheckReport, Error> {
    let request = MatchRequest::new(&task.target, &task.query).with_task_id(&task.id);
    let outcome = matcher
        .evaluate(&request)
        .map_err(|err| err.with_task_id(task.id.clone()))?;
    let task = if outcome.matched {
        client.set_complete(&task.id, true)?
    } else {
        task
    };
    Ok(CheckReport { task, outcome })
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("background check failed")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Observer, ObserverConfig};
    use crate::api::client::TaskClient;
    use crate::api::matcher::{MatchOutcome, MatchRequest, Matcher};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::task_log::RegisterMode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Matches once it has been called `match_on_call` times; `0` never matches.
    struct ScriptedMatcher {
        calls: AtomicUsize,
        match_on_call: usize,
        fail: bool,
    }

    impl ScriptedMatcher {
        fn matching_on(call: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                match_on_call: call,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                match_on_call: 0,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Matcher for ScriptedMatcher {
        fn evaluate(&self, _request: &MatchRequest<'_>) -> Result<MatchOutcome, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(Error::new(ErrorKind::Network).with_message("offline"));
            }
            Ok(MatchOutcome {
                matched: self.match_on_call != 0 && call >= self.match_on_call,
                score: Some(0.5),
            })
        }
    }

    fn fast_config() -> ObserverConfig {
        ObserverConfig {
            interval: Duration::from_millis(20),
            max_concurrent_checks: 2,
        }
    }

    fn temp_client() -> (tempfile::TempDir, TaskClient) {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = TaskClient::new().with_log_path(dir.path().join(".task_log.json"));
        (dir, client)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_schedules_pending_tasks_and_completes_on_match() {
        let (_dir, client) = temp_client();
        let pending = client
            .register("https://example.com/a", "A", RegisterMode::Force)
            .expect("a")
            .into_task();
        let done = client
            .register("https://example.com/b", "B", RegisterMode::Force)
            .expect("b")
            .into_task();
        client.set_complete(&done.id, true).expect("complete");

        let matcher = ScriptedMatcher::matching_on(2);
        let observer =
            Observer::new(client.clone(), matcher.clone(), fast_config()).expect("observer");
        assert_eq!(observer.start().expect("start"), 1);
        assert!(observer.is_scheduled(&pending.id));
        assert!(!observer.is_scheduled(&done.id));

        assert!(eventually(|| client.get(&pending.id).expect("get").complete).await);
        assert!(eventually(|| !observer.is_scheduled(&pending.id)).await);
        assert_eq!(matcher.calls(), 2);
    }

    #[tokio::test]
    async fn start_creates_missing_log() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client.clone(), ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        assert_eq!(observer.start().expect("start"), 0);
        assert!(client.log_path().is_file());
    }

    #[tokio::test]
    async fn failing_checks_keep_retrying() {
        let (_dir, client) = temp_client();
        let matcher = ScriptedMatcher::failing();
        let observer = Observer::new(client.clone(), matcher.clone(), fast_config()).expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();

        assert!(eventually(|| matcher.calls() >= 3).await);
        assert!(observer.is_scheduled(&task.id));
        assert!(!client.get(&task.id).expect("get").complete);
        observer.shutdown();
        assert!(observer.scheduled().is_empty());
    }

    #[tokio::test]
    async fn register_skips_duplicate_schedules() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client, ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        let first = observer
            .register("https://example.com", "q", RegisterMode::SkipDuplicates)
            .expect("first");
        let second = observer
            .register("https://example.com", "q", RegisterMode::SkipDuplicates)
            .expect("second");
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(observer.scheduled(), vec![first.task().id.clone()]);
        observer.shutdown();
    }

    #[tokio::test]
    async fn remove_cancels_schedule() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client.clone(), ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();
        assert!(observer.is_scheduled(&task.id));

        observer.remove(&task.id).expect("remove");
        assert!(!observer.is_scheduled(&task.id));
        assert!(client.list().expect("list").is_empty());
    }

    #[tokio::test]
    async fn externally_removed_task_stops_checks() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client.clone(), ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();
        client.remove(&task.id).expect("remove");
        assert!(eventually(|| !observer.is_scheduled(&task.id)).await);
    }

    #[tokio::test]
    async fn reopening_a_task_reschedules_it() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client, ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();
        observer.set_complete(&task.id, true).expect("complete");
        assert!(!observer.is_scheduled(&task.id));
        observer.set_complete(&task.id, false).expect("reopen");
        assert!(observer.is_scheduled(&task.id));
        observer.shutdown();
    }

    #[tokio::test]
    async fn reopen_right_after_a_match_runs_a_fresh_schedule() {
        let (_dir, client) = temp_client();
        let matcher = ScriptedMatcher::matching_on(1);
        let observer =
            Observer::new(client.clone(), matcher.clone(), fast_config()).expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();

        // Reopen as soon as the match lands, while the first schedule may still hold its entry.
        assert!(eventually(|| client.get(&task.id).expect("get").complete).await);
        observer.set_complete(&task.id, false).expect("reopen");
        assert!(observer.is_scheduled(&task.id));

        assert!(eventually(|| matcher.calls() >= 2).await);
        assert!(eventually(|| client.get(&task.id).expect("get").complete).await);
        assert!(eventually(|| !observer.is_scheduled(&task.id)).await);
    }

    #[tokio::test]
    async fn finished_schedule_leaves_a_newer_entry_alone() {
        let (_dir, client) = temp_client();
        let observer = Observer::new(client.clone(), ScriptedMatcher::matching_on(0), fast_config())
            .expect("observer");
        let task = observer
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();

        // The first schedule stops on its own once the task is complete; the reopen replaced it.
        client.set_complete(&task.id, true).expect("complete");
        observer.set_complete(&task.id, false).expect("reopen");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observer.is_scheduled(&task.id));
        observer.shutdown();
    }

    #[tokio::test]
    async fn check_now_persists_match() {
        let (_dir, client) = temp_client();
        let task = client
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();
        let observer = Observer::new(client.clone(), ScriptedMatcher::matching_on(1), fast_config())
            .expect("observer");

        let report = observer.check_now(&task.id).await.expect("check");
        assert!(report.outcome.matched);
        assert!(report.task.complete);
        assert!(client.get(&task.id).expect("get").complete);

        let err = observer.check_now("missing").await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn check_errors_carry_task_id() {
        let (_dir, client) = temp_client();
        let task = client
            .register("https://example.com", "q", RegisterMode::Force)
            .expect("register")
            .into_task();
        let observer =
            Observer::new(client, ScriptedMatcher::failing(), fast_config()).expect("observer");
        let err = observer.check_now(&task.id).await.expect_err("offline");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.task_id(), Some(task.id.as_str()));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let (_dir, client) = temp_client();
        let config = ObserverConfig {
            interval: Duration::ZERO,
            ..ObserverConfig::default()
        };
        let err = Observer::new(client.clone(), ScriptedMatcher::matching_on(0), config)
            .err()
            .expect("interval");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let config = ObserverConfig {
            max_concurrent_checks: 0,
            ..ObserverConfig::default()
        };
        let err = Observer::new(client, ScriptedMatcher::matching_on(0), config)
            .err()
            .expect("concurrency");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
