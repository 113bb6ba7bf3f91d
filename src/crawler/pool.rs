use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cli::config::PoolSettings;
use crate::crawler::executor::{ExecutionContext, TaskExecutor};
use crate::crawler::results::ResultStore;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::scheduler::{RejectReason, TaskScheduler};
use crate::crawler::task::{BatchResult, PageOutcome, Task, TaskResult, TaskStatus};
use crate::error::{ErrorKind, ExecutionError};
use crate::events::{Event, EventBus, EventKind};
use crate::storage::OutputWriter;
use crate::utils::MetricsCollector;

/// What one worker is doing
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSlot {
    pub worker_id: usize,
    pub busy: bool,
    pub current_task: Option<String>,
    pub tasks_processed: u64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub running: bool,
    pub max_workers: usize,
    pub active_workers: usize,
    pub total_tasks_processed: u64,
    pub total_tasks_succeeded: u64,
    pub total_tasks_failed: u64,
    pub total_tasks_cancelled: u64,
    pub total_retries: u64,
    pub pending_retries: usize,
    pub average_duration_ms: f64,
    pub workers: Vec<WorkerSlot>,
}

struct PendingRetry {
    task: Task,
    timer: JoinHandle<()>,
}

/// Bounded set of workers pulling tasks from the scheduler.
///
/// Each worker runs one task at a time under the task's timeout and its
/// cancellation signal. Failed attempts are re-enqueued after the retry
/// policy's delay by a timer tracked here, so a waiting retry can still be
/// cancelled.
pub struct WorkerPool {
    settings: PoolSettings,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn TaskExecutor>,
    results: Arc<ResultStore>,
    retry: RetryPolicy,
    bus: Option<EventBus>,
    output: Option<Arc<dyn OutputWriter>>,
    metrics: MetricsCollector,

    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    slots: Mutex<Vec<WorkerSlot>>,
    in_flight: Mutex<HashMap<String, watch::Sender<bool>>>,
    pending_retries: Mutex<HashMap<String, PendingRetry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl WorkerPool {
    pub fn new(
        settings: PoolSettings,
        scheduler: Arc<TaskScheduler>,
        executor: Arc<dyn TaskExecutor>,
        results: Arc<ResultStore>,
        retry: RetryPolicy,
        bus: Option<EventBus>,
    ) -> Self {
        let slots = (0..settings.max_workers)
            .map(|worker_id| WorkerSlot {
                worker_id,
                busy: false,
                current_task: None,
                tasks_processed: 0,
                last_active: None,
            })
            .collect();

        Self {
            settings,
            scheduler,
            executor,
            results,
            retry,
            bus,
            output: None,
            metrics: MetricsCollector::new(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            slots: Mutex::new(slots),
            in_flight: Mutex::new(HashMap::new()),
            pending_retries: Mutex::new(HashMap::new()),
        }
    }

    /// Write every terminal result through `output`
    pub fn with_output(mut self, output: Arc<dyn OutputWriter>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Spawn the workers. Calling it on a running pool does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = watch::channel(false);
        *lock(&self.shutdown) = Some(tx);

        let mut workers = lock(&self.workers);
        for worker_id in 0..self.settings.max_workers {
            let pool = Arc::clone(self);
            let shutdown = rx.clone();
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }
        info!("Worker pool started with {} workers", self.settings.max_workers);
    }

    /// Stop the workers. Running tasks get `shutdown_timeout` to finish and
    /// are cancelled after that; retries still waiting become cancelled.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker pool");

        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let joined = futures::future::join_all(handles);
        tokio::pin!(joined);

        let grace = Duration::from_secs(self.settings.shutdown_timeout_secs);
        if tokio::time::timeout(grace, &mut joined).await.is_err() {
            warn!("Workers still busy after {:?}, cancelling running tasks", grace);
            for cancel in lock(&self.in_flight).values() {
                let _ = cancel.send(true);
            }
            joined.await;
        }

        let pending: Vec<PendingRetry> = lock(&self.pending_retries)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in pending {
            pending.timer.abort();
            self.cancel_waiting(pending.task, "Pool stopped before retry").await;
        }

        info!("Worker pool stopped");
    }

    /// Whether a task is running or waiting for its retry delay.
    pub fn is_active(&self, task_id: &str) -> bool {
        let running = lock(&self.in_flight).contains_key(task_id);
        running || lock(&self.pending_retries).contains_key(task_id)
    }

    /// Cancel a task that is running or waiting for its retry delay.
    pub async fn cancel(&self, task_id: &str) -> bool {
        if let Some(cancel) = lock(&self.in_flight).get(task_id) {
            debug!("Cancelling running task {}", task_id);
            return cancel.send(true).is_ok();
        }

        let pending = lock(&self.pending_retries).remove(task_id);
        match pending {
            Some(pending) => {
                pending.timer.abort();
                self.cancel_waiting(pending.task, "Task was cancelled").await;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let counters = self.results.counters();
        let workers = lock(&self.slots).clone();
        PoolStats {
            running: self.is_running(),
            max_workers: self.settings.max_workers,
            active_workers: workers.iter().filter(|w| w.busy).count(),
            total_tasks_processed: counters.processed,
            total_tasks_succeeded: counters.succeeded,
            total_tasks_failed: counters.failed,
            total_tasks_cancelled: counters.cancelled,
            total_retries: counters.retries,
            pending_retries: lock(&self.pending_retries).len(),
            average_duration_ms: counters.average_duration_ms(),
            workers,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {} started", worker_id);
        self.emit(Event::new(EventKind::WorkerStarted, "worker_pool").with("worker_id", worker_id))
            .await;

        let poll = Duration::from_millis(self.settings.dequeue_timeout_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                task = self.scheduler.dequeue(Some(poll)) => task,
                _ = shutdown.changed() => break,
            };

            if let Some(task) = next {
                self.process(worker_id, task).await;
            }
        }

        debug!("Worker {} stopped", worker_id);
        self.emit(Event::new(EventKind::WorkerStopped, "worker_pool").with("worker_id", worker_id))
            .await;
    }

    async fn process(self: &Arc<Self>, worker_id: usize, mut task: Task) {
        if let Err(e) = task.start_attempt(worker_id) {
            error!("Dequeued task cannot start: {}", e);
            return;
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        lock(&self.in_flight).insert(task.id.clone(), cancel_tx);
        self.set_slot(worker_id, Some(&task.id));

        self.emit(
            self.task_event(EventKind::TaskStarted, &task)
                .with("worker_id", worker_id),
        )
        .await;

        let started_at = Utc::now();
        let ctx = ExecutionContext {
            worker_id,
            attempt: task.attempt,
        };
        let timeout = task.config.timeout;
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.executor.execute(&task, &ctx)) => {
                result.unwrap_or_else(|_| Err(ExecutionError::timeout(timeout)))
            }
            _ = cancel_rx.changed() => Err(ExecutionError::cancelled()),
        };

        lock(&self.in_flight).remove(&task.id);
        self.set_slot(worker_id, None);

        self.finish(task, outcome, started_at).await;
    }

    async fn finish(
        self: &Arc<Self>,
        mut task: Task,
        outcome: Result<PageOutcome, ExecutionError>,
        started_at: DateTime<Utc>,
    ) {
        let err = match outcome {
            Ok(page) => {
                self.transition(&mut task, TaskStatus::Completed);
                let result = TaskResult::succeeded(&task, page, started_at);
                debug!("Task {} completed in {}ms", task.id, result.duration_ms);
                self.metrics.record_attempt(task.task_type, &result).await;
                self.emit(
                    self.task_event(EventKind::TaskCompleted, &task)
                        .with("duration_ms", result.duration_ms)
                        .with("status_code", result.status_code),
                )
                .await;
                self.record_terminal(result).await;
                return;
            }
            Err(err) => err,
        };

        if err.kind == ErrorKind::Cancelled {
            self.transition(&mut task, TaskStatus::Cancelled);
            let result = TaskResult::failed(&task, &err, TaskStatus::Cancelled, started_at);
            self.metrics.record_attempt(task.task_type, &result).await;
            self.emit(self.task_event(EventKind::TaskCancelled, &task)).await;
            self.record_terminal(result).await;
            return;
        }

        if err.retryable && task.can_retry() && self.is_running() {
            self.transition(&mut task, TaskStatus::Retrying);
            let result = TaskResult::failed(&task, &err, TaskStatus::Retrying, started_at);
            self.metrics.record_attempt(task.task_type, &result).await;
            self.results.record_retry(result);

            let delay = self.retry.delay_with_floor(task.attempt, err.retry_after);
            warn!(
                "Task {} attempt {} failed ({}), retrying in {:?}",
                task.id, task.attempt, err, delay
            );
            self.emit(
                self.task_event(EventKind::TaskRetrying, &task)
                    .with("error", err.message.clone())
                    .with("error_kind", err.kind.as_str())
                    .with("delay_ms", delay.as_millis() as u64),
            )
            .await;
            self.schedule_retry(task, delay);
            return;
        }

        let status = if err.retryable && task.can_retry() {
            // Would have retried, but the pool is shutting down
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        self.transition(&mut task, status);
        let result = TaskResult::failed(&task, &err, status, started_at);
        self.metrics.record_attempt(task.task_type, &result).await;

        if status == TaskStatus::Failed {
            warn!("Task {} failed after {} attempts: {}", task.id, task.attempt, err);
            self.emit(
                self.task_event(EventKind::TaskFailed, &task)
                    .with("error", err.message.clone())
                    .with("error_kind", err.kind.as_str()),
            )
            .await;
        } else {
            self.emit(self.task_event(EventKind::TaskCancelled, &task)).await;
        }
        self.record_terminal(result).await;
    }

    fn schedule_retry(self: &Arc<Self>, task: Task, delay: Duration) {
        let task_id = task.id.clone();
        let mut pending = lock(&self.pending_retries);
        let pool = Arc::clone(self);
        let id = task_id.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            let due = lock(&pool.pending_retries).remove(&id);
            if let Some(due) = due {
                pool.requeue(due.task).await;
            }
        });
        pending.insert(task_id, PendingRetry { task, timer });
    }

    async fn requeue(&self, task: Task) {
        debug!("Re-enqueueing task {} for attempt {}", task.id, task.attempt + 1);
        if let Err((mut task, reason)) = self.scheduler.try_enqueue(task) {
            let err = ExecutionError::fatal(
                ErrorKind::Internal,
                match reason {
                    RejectReason::QueueFull => "Queue full when re-enqueueing retry",
                    RejectReason::Duplicate => "Task already queued when re-enqueueing retry",
                    RejectReason::InvalidState => "Task in unexpected state for retry",
                },
            );
            warn!("Retry of task {} dropped: {}", task.id, err.message);
            self.transition(&mut task, TaskStatus::Failed);
            self.emit(
                self.task_event(EventKind::TaskFailed, &task)
                    .with("error", err.message.clone())
                    .with("error_kind", err.kind.as_str()),
            )
            .await;
            self.record_terminal(TaskResult::not_run(&task, TaskStatus::Failed, &err))
                .await;
        }
    }

    /// Cancel a task that is not running (waiting for a retry).
    async fn cancel_waiting(&self, mut task: Task, reason: &str) {
        self.transition(&mut task, TaskStatus::Cancelled);
        let err = ExecutionError::new(ErrorKind::Cancelled, reason);
        self.emit(self.task_event(EventKind::TaskCancelled, &task)).await;
        self.record_terminal(TaskResult::not_run(&task, TaskStatus::Cancelled, &err))
            .await;
    }

    /// Store a terminal result, write it out and announce a finished batch.
    pub async fn record_terminal(&self, result: TaskResult) {
        if let Some(output) = &self.output {
            if let Err(e) = output.write(&result).await {
                warn!("Failed to write result for task {}: {:#}", result.task_id, e);
            }
        }

        if let Some(batch) = self.results.record(result) {
            self.announce_batch(&batch).await;
        }
    }

    pub async fn announce_batch(&self, batch: &BatchResult) {
        info!(
            "Batch {} finished: {} completed, {} failed, {} cancelled",
            batch.batch_id, batch.completed, batch.failed, batch.cancelled
        );
        self.emit(
            Event::new(EventKind::BatchCompleted, "worker_pool")
                .with("batch_id", batch.batch_id.clone())
                .with("total", batch.total)
                .with("completed", batch.completed)
                .with("failed", batch.failed)
                .with("cancelled", batch.cancelled)
                .correlated(batch.batch_id.clone()),
        )
        .await;
    }

    fn transition(&self, task: &mut Task, next: TaskStatus) {
        if let Err(e) = task.transition(next) {
            error!("{}", e);
        }
    }

    fn set_slot(&self, worker_id: usize, task_id: Option<&str>) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(worker_id) {
            slot.busy = task_id.is_some();
            if task_id.is_none() && slot.current_task.is_some() {
                slot.tasks_processed += 1;
            }
            slot.current_task = task_id.map(String::from);
            slot.last_active = Some(Utc::now());
        }
    }

    fn task_event(&self, kind: EventKind, task: &Task) -> Event {
        let event = Event::new(kind, "worker_pool")
            .with("task_id", task.id.clone())
            .with("url", task.url.clone())
            .with("attempt", task.attempt);
        match &task.batch_id {
            Some(batch_id) => event.correlated(batch_id.clone()),
            None => event.correlated(task.id.clone()),
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::SchedulerSettings;
    use crate::crawler::retry::BackoffStrategy;
    use crate::crawler::task::TaskType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Executor replaying scripted outcomes, then succeeding
    struct ScriptedExecutor {
        outcomes: Mutex<VecDeque<Result<PageOutcome, ExecutionError>>>,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<Result<PageOutcome, ExecutionError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                delay,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<PageOutcome, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            lock(&self.outcomes)
                .pop_front()
                .unwrap_or_else(|| Ok(PageOutcome::default()))
        }
    }

    fn pool_with(executor: Arc<ScriptedExecutor>, max_workers: usize) -> Arc<WorkerPool> {
        let scheduler = Arc::new(TaskScheduler::new(SchedulerSettings::default(), None));
        Arc::new(WorkerPool::new(
            PoolSettings {
                max_workers,
                dequeue_timeout_ms: 20,
                shutdown_timeout_secs: 1,
                ..PoolSettings::default()
            },
            scheduler,
            executor,
            Arc::new(ResultStore::new()),
            RetryPolicy {
                strategy: BackoffStrategy::Fixed,
                base: Duration::from_millis(10),
                max: Duration::from_millis(10),
                factor: 1.0,
                jitter: false,
            },
            None,
        ))
    }

    fn task(max_retries: u32) -> Task {
        let mut task = Task::new("https://example.com/", TaskType::Visit).unwrap();
        task.config.max_retries = max_retries;
        task
    }

    async fn run(pool: &Arc<WorkerPool>, task: Task) -> TaskResult {
        let id = task.id.clone();
        assert!(pool.scheduler.enqueue(task));
        pool.results
            .wait_for(&id, Some(Duration::from_secs(10)))
            .await
            .expect("task did not finish")
    }

    #[tokio::test]
    async fn test_success_path() {
        let exec = ScriptedExecutor::new(vec![], Duration::ZERO);
        let pool = pool_with(exec, 2);
        pool.start();

        let result = run(&pool, task(3)).await;
        assert!(result.success);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.attempt, 1);

        pool.stop().await;
        let stats = pool.stats();
        assert_eq!(stats.total_tasks_succeeded, 1);
        assert_eq!(stats.total_tasks_processed, 1);
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let exec = ScriptedExecutor::new(
            vec![Err(ExecutionError::new(ErrorKind::Network, "reset"))],
            Duration::ZERO,
        );
        let pool = pool_with(exec.clone(), 1);
        pool.start();

        let t = task(3);
        let id = t.id.clone();
        let result = run(&pool, t).await;
        assert!(result.success);
        assert_eq!(result.attempt, 2);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);

        let attempts = pool.results.attempts(&id);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, TaskStatus::Retrying);
        assert_eq!(pool.stats().total_retries, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_task() {
        let failures = (0..5)
            .map(|_| Err(ExecutionError::new(ErrorKind::Network, "down")))
            .collect();
        let exec = ScriptedExecutor::new(failures, Duration::ZERO);
        let pool = pool_with(exec.clone(), 1);
        pool.start();

        let result = run(&pool, task(2)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempt, 3);
        assert_eq!(result.error_kind, Some(ErrorKind::Network));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_immediately() {
        let exec = ScriptedExecutor::new(
            vec![Err(ExecutionError::fatal(ErrorKind::Extraction, "bad selector"))],
            Duration::ZERO,
        );
        let pool = pool_with(exec.clone(), 1);
        pool.start();

        let result = run(&pool, task(3)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let exec = ScriptedExecutor::new(vec![], Duration::from_secs(30));
        let pool = pool_with(exec, 1);
        pool.start();

        let mut t = task(0);
        t.config.timeout = Duration::from_millis(100);
        let result = run(&pool, t).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_workers() {
        let exec = ScriptedExecutor::new(vec![], Duration::from_millis(20));
        let pool = pool_with(exec.clone(), 2);
        pool.start();

        let tasks: Vec<Task> = (0..6).map(|_| task(0)).collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(pool.scheduler.enqueue_many(tasks), 6);
        for id in ids {
            assert!(pool.results.wait_for(&id, Some(Duration::from_secs(10))).await.is_some());
        }

        assert!(exec.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().total_tasks_succeeded, 6);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let exec = ScriptedExecutor::new(vec![], Duration::from_secs(60));
        let pool = pool_with(exec, 1);
        pool.start();

        let t = task(3);
        let id = t.id.clone();
        assert!(pool.scheduler.enqueue(t));
        while pool.stats().active_workers == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        assert!(pool.cancel(&id).await);
        let result = pool.results.wait_for(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(pool.stats().total_tasks_cancelled, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_waiting_retry() {
        let exec = ScriptedExecutor::new(
            vec![Err(ExecutionError::new(ErrorKind::CircuitOpen, "open")
                .with_retry_after(Duration::from_secs(600)))],
            Duration::ZERO,
        );
        let pool = pool_with(exec, 1);
        pool.start();

        let t = task(3);
        let id = t.id.clone();
        assert!(pool.scheduler.enqueue(t));
        while pool.stats().pending_retries == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        assert!(pool.cancel(&id).await);
        let result = pool.results.get(&id).unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(pool.stats().pending_retries, 0);
        assert!(!pool.cancel(&id).await);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_retries() {
        let exec = ScriptedExecutor::new(
            vec![Err(ExecutionError::new(ErrorKind::Network, "reset")
                .with_retry_after(Duration::from_secs(600)))],
            Duration::ZERO,
        );
        let pool = pool_with(exec, 1);
        pool.start();

        let t = task(3);
        let id = t.id.clone();
        assert!(pool.scheduler.enqueue(t));
        while pool.stats().pending_retries == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        pool.stop().await;
        let result = pool.results.get(&id).unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(pool.stats().pending_retries, 0);
    }
}
