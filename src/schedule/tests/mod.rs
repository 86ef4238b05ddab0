use super::*;
use crate::storage::task::SqliteTaskStorage;
use crate::utils::time;
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::sleep;

// 测试用执行器：记录参数、并发数，可配置耗时与失败
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<TaskArgs>>,
    delay: Duration,
    fail: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    fn calls(&self) -> Vec<TaskArgs> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, args: TaskArgs) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().unwrap().push(args);

        sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("executor failure");
        }
        Ok(())
    }
}

struct Harness {
    scheduler: TaskScheduler,
    manager: Arc<TaskManager>,
    executor: Arc<RecordingExecutor>,
    events: broadcast::Receiver<TaskEvent>,
    _dir: TempDir,
}

async fn setup_with(executor: RecordingExecutor, config: SchedulerConfig, dir: TempDir) -> Harness {
    let storage = SqliteTaskStorage::new(dir.path().join("tasks.db")).await.unwrap();
    let executor = Arc::new(executor);
    let dyn_executor: Arc<dyn TaskExecutor> = executor.clone();

    let manager = Arc::new(TaskManager::new(Arc::new(storage), dyn_executor).with_config(config));
    let events = manager.subscribe();
    let scheduler = TaskScheduler::new(manager.clone());

    Harness { scheduler, manager, executor, events, _dir: dir }
}

async fn setup(executor: RecordingExecutor) -> Harness {
    setup_with(executor, SchedulerConfig::default(), TempDir::new().unwrap()).await
}

// 包装存储：统计并可延迟 next_candidate 调用
struct ObservedStorage {
    inner: SqliteTaskStorage,
    candidate_delay: Duration,
    candidate_calls: AtomicUsize,
}

impl ObservedStorage {
    async fn open(dir: &TempDir, candidate_delay: Duration) -> Arc<Self> {
        let inner = SqliteTaskStorage::new(dir.path().join("tasks.db")).await.unwrap();
        Arc::new(Self {
            inner,
            candidate_delay,
            candidate_calls: AtomicUsize::new(0),
        })
    }

    fn candidate_calls(&self) -> usize {
        self.candidate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStorage for ObservedStorage {
    async fn create(&self, task: &NewTask) -> anyhow::Result<TaskId> {
        self.inner.create(task).await
    }

    async fn get(&self, task_id: TaskId) -> anyhow::Result<Option<Task>> {
        self.inner.get(task_id).await
    }

    async fn list(&self) -> anyhow::Result<Vec<Task>> {
        self.inner.list().await
    }

    async fn delete(&self, task_id: TaskId) -> anyhow::Result<bool> {
        self.inner.delete(task_id).await
    }

    async fn set_active(&self, task_id: TaskId, active: bool) -> anyhow::Result<bool> {
        self.inner.set_active(task_id, active).await
    }

    async fn next_candidate(&self) -> anyhow::Result<Option<Task>> {
        self.candidate_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.candidate_delay).await;
        self.inner.next_candidate().await
    }

    async fn claim(&self, task_id: TaskId, now: NaiveDateTime) -> anyhow::Result<bool> {
        self.inner.claim(task_id, now).await
    }

    async fn finish_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        next_run_time: Option<NaiveDateTime>,
    ) -> anyhow::Result<bool> {
        self.inner.finish_run(task_id, status, next_run_time).await
    }

    async fn update_next_run_time(&self, task_id: TaskId, next_run_time: NaiveDateTime) -> anyhow::Result<bool> {
        self.inner.update_next_run_time(task_id, next_run_time).await
    }

    async fn mark_overdue(&self, task_id: TaskId) -> anyhow::Result<bool> {
        self.inner.mark_overdue(task_id).await
    }

    async fn get_by_status(&self, status: TaskStatus) -> anyhow::Result<Vec<Task>> {
        self.inner.get_by_status(status).await
    }

    async fn cleanup_old(&self, before: NaiveDateTime) -> anyhow::Result<u64> {
        self.inner.cleanup_old(before).await
    }
}

fn manager_over(
    storage: Arc<ObservedStorage>,
    executor: Arc<RecordingExecutor>,
    config: SchedulerConfig,
) -> Arc<TaskManager> {
    let storage: Arc<dyn TaskStorage> = storage;
    let executor: Arc<dyn TaskExecutor> = executor;
    Arc::new(TaskManager::new(storage, executor).with_config(config))
}

fn in_secs(secs: i64) -> NaiveDateTime {
    time::now() + TimeDelta::seconds(secs)
}

fn args(value: serde_json::Value) -> TaskArgs {
    value.as_object().cloned().unwrap()
}

async fn wait_finished(
    events: &mut broadcast::Receiver<TaskEvent>,
    task_id: TaskId,
    within: Duration,
) -> (TaskStatus, Option<NaiveDateTime>) {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(TaskEvent::Finished { task_id: id, status, next_run_time }) if id == task_id => {
                    return (status, next_run_time);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for the task to finish")
}

async fn wait_dispatched(events: &mut broadcast::Receiver<TaskEvent>, task_id: TaskId, within: Duration) {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(TaskEvent::Dispatched { task_id: id, .. }) if id == task_id => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for the task to be dispatched")
}

#[tokio::test]
async fn test_one_shot_task_runs_exactly_once() {
    let mut h = setup(RecordingExecutor::default()).await;
    let id = h
        .manager
        .add_task(NewTask::new("t1", in_secs(2)).with_args(args(json!({"x": 1}))))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let (status, next_run_time) = wait_finished(&mut h.events, id, Duration::from_secs(5)).await;
    assert_eq!(status, TaskStatus::Completed);
    assert!(next_run_time.is_none());

    let task = h.manager.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.last_run_time.is_some());

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.executor.calls(), vec![args(json!({"x": 1}))]);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_recurring_task_keeps_its_cadence() {
    let mut h = setup(RecordingExecutor::default()).await;
    let interval: Interval = "0 00:00:05".parse().unwrap();
    let id = h
        .manager
        .add_task(NewTask::new("t2", time::now()).with_interval(interval))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let mut next_times = Vec::new();
    for _ in 0..3 {
        let (status, next) = wait_finished(&mut h.events, id, Duration::from_secs(8)).await;
        assert_eq!(status, TaskStatus::Waiting);
        next_times.push(next.unwrap());
    }
    for pair in next_times.windows(2) {
        assert_eq!(pair[1] - pair[0], TimeDelta::seconds(5));
    }

    sleep(Duration::from_secs(5)).await;
    assert!(h.executor.calls().len() >= 3);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_overdue_one_shot_is_never_dispatched() {
    let mut h = setup(RecordingExecutor::default()).await;
    let id = h.manager.add_task(NewTask::new("missed", in_secs(-100))).await.unwrap();
    h.scheduler.start().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, TaskEvent::Overdue { task_id: id });

    sleep(Duration::from_millis(1500)).await;
    assert!(h.executor.calls().is_empty());
    let task = h.manager.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Overdue);
    assert!(task.last_run_time.is_none());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_same_task_never_runs_concurrently() {
    let mut h = setup(RecordingExecutor::with_delay(Duration::from_secs(2))).await;
    let id = h
        .manager
        .add_task(NewTask::new("slow", time::now()).with_interval(Interval::from_seconds(1)))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    wait_dispatched(&mut h.events, id, Duration::from_secs(2)).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.manager.get_task(id).await.unwrap().unwrap().status, TaskStatus::Running);
    assert!(h.manager.next_candidate().await.unwrap().is_none());
    assert_eq!(h.manager.in_flight().await, 1);

    wait_finished(&mut h.events, id, Duration::from_secs(4)).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(h.executor.max_active.load(Ordering::SeqCst), 1);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_reload_wakes_loop_for_earlier_task() {
    // a long ceiling leaves the reload signal as the only way to wake early
    let config = SchedulerConfig {
        max_wait: Duration::from_secs(30),
        ..Default::default()
    };
    let mut h = setup_with(RecordingExecutor::default(), config, TempDir::new().unwrap()).await;
    h.manager.add_task(NewTask::new("later", in_secs(3600))).await.unwrap();
    h.scheduler.start().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let id = h.manager.add_task(NewTask::new("sooner", time::now())).await.unwrap();
    wait_finished(&mut h.events, id, Duration::from_secs(2)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_deleted_candidate_is_not_run() {
    let h = setup(RecordingExecutor::default()).await;
    let id = h.manager.add_task(NewTask::new("doomed", in_secs(2))).await.unwrap();
    h.scheduler.start().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert!(h.manager.delete_task(id).await.unwrap());
    sleep(Duration::from_secs(3)).await;
    assert!(h.executor.calls().is_empty());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_delete_missing_task_does_not_wake_loop() {
    let dir = TempDir::new().unwrap();
    let storage = ObservedStorage::open(&dir, Duration::ZERO).await;
    let config = SchedulerConfig {
        max_wait: Duration::from_secs(30),
        ..Default::default()
    };
    let manager = manager_over(storage.clone(), Arc::new(RecordingExecutor::default()), config);
    let scheduler = TaskScheduler::new(manager.clone());

    manager.add_task(NewTask::new("later", in_secs(3600))).await.unwrap();
    scheduler.start().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    let settled = storage.candidate_calls();

    assert!(!manager.delete_task(12345).await.unwrap());
    sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.candidate_calls(), settled);

    // a real mutation does wake it
    manager.add_task(NewTask::new("also-later", in_secs(3600))).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(storage.candidate_calls() > settled);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_stop_during_selection_starts_nothing() {
    let dir = TempDir::new().unwrap();
    let storage = ObservedStorage::open(&dir, Duration::from_millis(800)).await;
    let executor = Arc::new(RecordingExecutor::default());
    let manager = manager_over(storage.clone(), executor.clone(), SchedulerConfig::default());
    let scheduler = TaskScheduler::new(manager.clone());

    let id = manager
        .add_task(NewTask::new("tick", time::now()).with_interval(Interval::from_seconds(1)))
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    // the loop is now inside the slow candidate query
    sleep(Duration::from_millis(100)).await;
    assert_eq!(storage.candidate_calls(), 1);

    let started = Instant::now();
    scheduler.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!scheduler.is_running().await);

    sleep(Duration::from_millis(500)).await;
    assert!(executor.calls().is_empty());
    let task = manager.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert!(task.last_run_time.is_none());
}

#[tokio::test]
async fn test_far_future_recurring_task_does_not_starve_others() {
    let dir = TempDir::new().unwrap();
    let storage = ObservedStorage::open(&dir, Duration::ZERO).await;
    let executor = Arc::new(RecordingExecutor::default());
    let manager = manager_over(storage.clone(), executor.clone(), SchedulerConfig::default());
    let scheduler = TaskScheduler::new(manager.clone());
    let mut events = manager.subscribe();

    // written straight to the store, add_task refuses such an interval
    let huge = storage
        .create(&NewTask::new("huge", time::now()).with_interval(Interval::new(3_650_000, 0, 0, 0)))
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    let (status, next) = wait_finished(&mut events, huge, Duration::from_secs(3)).await;
    assert_eq!(status, TaskStatus::Waiting);
    assert_eq!(next, Some(time::latest()));

    let soon = manager.add_task(NewTask::new("soon", in_secs(1))).await.unwrap();
    let (status, _) = wait_finished(&mut events, soon, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(executor.calls().len(), 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_failed_one_shot_is_terminal() {
    let mut h = setup(RecordingExecutor::failing()).await;
    let id = h.manager.add_task(NewTask::new("broken", in_secs(1))).await.unwrap();
    h.scheduler.start().await.unwrap();

    let (status, _) = wait_finished(&mut h.events, id, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Failed);

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.executor.calls().len(), 1);
    assert!(!h.manager.activate_task(id, true).await.unwrap());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_failed_recurring_task_keeps_advancing() {
    let mut h = setup(RecordingExecutor::failing()).await;
    let id = h
        .manager
        .add_task(NewTask::new("flaky", time::now()).with_interval(Interval::from_seconds(1)))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let (status, first) = wait_finished(&mut h.events, id, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Failed);
    let (status, second) = wait_finished(&mut h.events, id, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Failed);
    assert!(second.unwrap() > first.unwrap());
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_panicking_executor_marks_task_failed() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteTaskStorage::new(dir.path().join("tasks.db")).await.unwrap();
    let scheduler = create_scheduler(
        storage,
        FnExecutor::new(|_| -> anyhow::Result<()> { panic!("device driver crashed") }),
        SchedulerConfig::default(),
    );
    let manager = scheduler.task_manager().clone();
    let mut events = manager.subscribe();

    let id = manager.add_task(NewTask::new("crash", in_secs(1))).await.unwrap();
    scheduler.start().await.unwrap();

    let (status, _) = wait_finished(&mut events, id, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(manager.get_task(id).await.unwrap().unwrap().status, TaskStatus::Failed);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_paused_task_is_skipped_and_expires() {
    let h = setup(RecordingExecutor::default()).await;
    let id = h.manager.add_task(NewTask::new("paused", in_secs(1))).await.unwrap();
    assert!(h.manager.activate_task(id, false).await.unwrap());
    h.scheduler.start().await.unwrap();

    sleep(Duration::from_millis(2500)).await;
    assert!(h.executor.calls().is_empty());

    // resuming after the due time classifies it as overdue instead
    assert!(!h.manager.activate_task(id, true).await.unwrap());
    let task = h.manager.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Overdue);
    assert!(!task.is_active);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_resumed_recurring_task_is_renewed_first() {
    let h = setup(RecordingExecutor::default()).await;
    let id = h
        .manager
        .add_task(NewTask::new("daily", in_secs(-3600 - 60)).with_interval(Interval::from_seconds(3600)))
        .await
        .unwrap();
    assert!(h.manager.activate_task(id, false).await.unwrap());

    let task = h.manager.get_task(id).await.unwrap().unwrap();
    assert!(task.next_run_time > time::now());
    assert!(h.manager.activate_task(id, true).await.unwrap());
    assert!(!h.manager.activate_task(999, true).await.unwrap());
}

#[tokio::test]
async fn test_zero_interval_is_rejected() {
    let h = setup(RecordingExecutor::default()).await;
    let err = h
        .manager
        .add_task(NewTask::new("spin", time::now()).with_interval(Interval::from_seconds(0)))
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<ScheduleError>(), Some(ScheduleError::ZeroInterval)));
    assert!(h.manager.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unstorable_times_are_rejected() {
    let h = setup(RecordingExecutor::default()).await;

    let beyond = time::latest() + TimeDelta::seconds(1);
    let err = h.manager.add_task(NewTask::new("beyond", beyond)).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ScheduleError>(),
        Some(ScheduleError::TimestampOutOfRange(_))
    ));

    let err = h
        .manager
        .add_task(NewTask::new("huge", time::now()).with_interval(Interval::new(3_650_000, 0, 0, 0)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ScheduleError>(),
        Some(ScheduleError::IntervalTooLarge(_))
    ));

    // the last storable instant itself is fine
    h.manager.add_task(NewTask::new("edge", time::latest())).await.unwrap();
    assert_eq!(h.manager.list_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let h = setup(RecordingExecutor::default()).await;
    h.scheduler.stop().await;

    h.scheduler.start().await.unwrap();
    h.scheduler.start().await.unwrap();
    assert!(h.scheduler.is_running().await);

    let started = Instant::now();
    h.scheduler.stop().await;
    h.scheduler.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.scheduler.is_running().await);

    h.scheduler.start().await.unwrap();
    assert!(h.scheduler.is_running().await);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_stop_lets_running_task_finish() {
    let mut h = setup(RecordingExecutor::with_delay(Duration::from_secs(1))).await;
    let id = h.manager.add_task(NewTask::new("slow", in_secs(1))).await.unwrap();
    h.scheduler.start().await.unwrap();
    wait_dispatched(&mut h.events, id, Duration::from_secs(3)).await;

    h.scheduler.stop().await;
    let later = h.manager.add_task(NewTask::new("after-stop", time::now())).await.unwrap();

    let (status, _) = wait_finished(&mut h.events, id, Duration::from_secs(4)).await;
    assert_eq!(status, TaskStatus::Completed);

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.executor.calls().len(), 1);
    assert_eq!(h.manager.get_task(later).await.unwrap().unwrap().status, TaskStatus::Waiting);
}

#[tokio::test]
async fn test_restart_recovers_interrupted_task() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");
    let first_due = in_secs(-12);

    // a previous process claimed the task and died mid-run
    let id = {
        let storage = SqliteTaskStorage::new(&path).await.unwrap();
        let id = storage
            .create(&NewTask::new("tick", first_due).with_interval(Interval::from_seconds(5)))
            .await
            .unwrap();
        assert!(storage.claim(id, first_due).await.unwrap());
        storage.close().await;
        id
    };

    let mut h = setup_with(RecordingExecutor::default(), SchedulerConfig::default(), dir).await;
    h.scheduler.start().await.unwrap();

    let recovered = h.manager.get_task(id).await.unwrap().unwrap();
    assert_ne!(recovered.status, TaskStatus::Running);
    assert_eq!((recovered.next_run_time - first_due).num_seconds() % 5, 0);
    assert!(recovered.next_run_time >= time::now() - TimeDelta::seconds(1));

    let (status, next) = wait_finished(&mut h.events, id, Duration::from_secs(7)).await;
    assert_eq!(status, TaskStatus::Waiting);
    assert_eq!((next.unwrap() - first_due).num_seconds() % 5, 0);
    assert_eq!(h.executor.calls().len(), 1);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn test_task_stats_and_cleanup() {
    let mut h = setup(RecordingExecutor::default()).await;
    let done = h.manager.add_task(NewTask::new("done", in_secs(1))).await.unwrap();
    h.manager.add_task(NewTask::new("missed", in_secs(-60))).await.unwrap();
    let paused = h.manager.add_task(NewTask::new("paused", in_secs(3600))).await.unwrap();
    h.manager.activate_task(paused, false).await.unwrap();

    h.scheduler.start().await.unwrap();
    wait_finished(&mut h.events, done, Duration::from_secs(4)).await;
    h.scheduler.stop().await;

    let stats = h.manager.task_stats().await.unwrap();
    assert_eq!(
        stats,
        TaskStats { waiting: 1, completed: 1, overdue: 1, inactive: 1, ..Default::default() }
    );

    // nothing is old enough for a one day retention
    assert_eq!(h.manager.cleanup_tasks(1).await.unwrap(), 0);
    assert_eq!(h.manager.cleanup_tasks(-1).await.unwrap(), 2);
    assert_eq!(h.manager.list_tasks().await.unwrap().len(), 1);
}
