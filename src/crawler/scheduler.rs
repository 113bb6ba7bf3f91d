use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::cli::config::SchedulerSettings;
use crate::crawler::task::{Task, TaskStatus};
use crate::events::{Event, EventBus, EventKind};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Why `try_enqueue` handed a task back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    Duplicate,
    InvalidState,
}

/// Heap entry: higher priority first, then oldest task, then enqueue order
#[derive(Debug)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    ids: HashSet<String>,
    next_seq: u64,

    /// Recent dequeue instants for the sliding rate window
    dequeue_times: VecDeque<Instant>,

    paused_until: Option<Instant>,

    tasks_enqueued: u64,
    tasks_dequeued: u64,
    tasks_rejected: u64,
    tasks_cancelled: u64,
    rate_limit_waits: u64,
}

impl QueueState {
    /// How long until the rate window has room, if it is full.
    fn rate_wait(&mut self, limit: Option<u32>, now: Instant) -> Option<Duration> {
        let limit = limit? as usize;
        while let Some(oldest) = self.dequeue_times.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                self.dequeue_times.pop_front();
            } else {
                break;
            }
        }
        if self.dequeue_times.len() < limit {
            return None;
        }
        self.dequeue_times
            .front()
            .map(|oldest| (*oldest + RATE_WINDOW).saturating_duration_since(now))
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub tasks_enqueued: u64,
    pub tasks_dequeued: u64,
    pub tasks_rejected: u64,
    pub tasks_cancelled: u64,
    pub rate_limit_waits: u64,
    pub requests_per_minute: Option<u32>,
    pub paused: bool,
}

enum Next {
    Ready(Task),
    Empty,
    Wait(Instant),
}

/// Priority queue of pending tasks, the sole authority on what runs next.
///
/// The heap and id set sit behind one mutex that is never held across an
/// `.await`. Every successful enqueue signals `not_empty`, which is the only
/// thing an idle worker waits on.
pub struct TaskScheduler {
    settings: SchedulerSettings,
    state: Mutex<QueueState>,
    not_empty: Notify,
    bus: Option<EventBus>,
}

impl TaskScheduler {
    pub fn new(settings: SchedulerSettings, bus: Option<EventBus>) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a task. Returns false when the queue is full or the id is queued.
    pub fn enqueue(&self, task: Task) -> bool {
        self.try_enqueue(task).is_ok()
    }

    /// Add a task, handing it back with the reason on rejection.
    pub fn try_enqueue(&self, mut task: Task) -> Result<(), (Task, RejectReason)> {
        {
            let mut state = self.lock();

            if state.ids.contains(&task.id) {
                state.tasks_rejected += 1;
                debug!("Rejecting duplicate task {}", task.id);
                return Err((task, RejectReason::Duplicate));
            }

            if state.heap.len() >= self.settings.max_queue_size {
                state.tasks_rejected += 1;
                warn!("Queue full ({}), rejecting task {}", self.settings.max_queue_size, task.id);
                return Err((task, RejectReason::QueueFull));
            }

            if let Err(e) = task.transition(TaskStatus::Queued) {
                state.tasks_rejected += 1;
                error!("Refusing to enqueue: {}", e);
                return Err((task, RejectReason::InvalidState));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.ids.insert(task.id.clone());
            state.tasks_enqueued += 1;

            if let Some(bus) = &self.bus {
                bus.publish_sync(
                    Event::new(EventKind::TaskQueued, "scheduler")
                        .with("task_id", task.id.clone())
                        .with("priority", task.priority)
                        .with("attempt", task.attempt)
                        .correlated(task.batch_id.clone().unwrap_or_else(|| task.id.clone())),
                );
            }

            state.heap.push(QueueEntry {
                priority: task.priority,
                created_at: task.created_at,
                seq,
                task,
            });
        }

        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue several tasks, returning how many were accepted.
    pub fn enqueue_many(&self, tasks: Vec<Task>) -> usize {
        tasks.into_iter().map(|task| self.enqueue(task)).filter(|&ok| ok).count()
    }

    /// Take the next task, waiting up to `timeout` for one to arrive.
    /// `None` waits indefinitely.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Task> {
        let deadline = timeout.map(|t| Instant::now() + t);

        // The rate-limit wait happens before looking at the queue, even when
        // it turns out to be empty.
        let initial_wait = self.lock().rate_wait(self.settings.requests_per_minute, Instant::now());
        if let Some(wait) = initial_wait {
            self.lock().rate_limit_waits += 1;
            debug!("Rate limit reached, waiting {:?}", wait);
            sleep_until(Instant::now() + wait).await;
        }

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_next() {
                Next::Ready(task) => return Some(task),
                Next::Wait(until) => {
                    if let Some(deadline) = deadline {
                        if until >= deadline {
                            sleep_until(deadline).await;
                            return None;
                        }
                    }
                    sleep_until(until).await;
                }
                Next::Empty => match deadline {
                    Some(deadline) => {
                        if timeout_at(deadline, notified).await.is_err() {
                            return None;
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    fn poll_next(&self) -> Next {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(until) = state.paused_until {
            if until > now {
                return Next::Wait(until);
            }
            state.paused_until = None;
        }

        if state.heap.is_empty() {
            return Next::Empty;
        }

        if let Some(wait) = state.rate_wait(self.settings.requests_per_minute, now) {
            state.rate_limit_waits += 1;
            return Next::Wait(now + wait);
        }

        let Some(entry) = state.heap.pop() else {
            return Next::Empty;
        };
        state.ids.remove(&entry.task.id);
        state.tasks_dequeued += 1;
        if self.settings.requests_per_minute.is_some() {
            state.dequeue_times.push_back(now);
        }
        Next::Ready(entry.task)
    }

    /// Remove a queued task. Has no effect on tasks already dequeued.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.cancel_task(task_id).is_some()
    }

    /// Remove a queued task and return it, marked cancelled.
    pub fn cancel_task(&self, task_id: &str) -> Option<Task> {
        let mut task = {
            let mut state = self.lock();
            if !state.ids.remove(task_id) {
                return None;
            }

            let entries = std::mem::take(&mut state.heap).into_vec();
            let mut removed = None;
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                if removed.is_none() && entry.task.id == task_id {
                    removed = Some(entry.task);
                } else {
                    kept.push(entry);
                }
            }
            state.heap = BinaryHeap::from(kept);
            state.tasks_cancelled += 1;
            removed?
        };

        if let Err(e) = task.transition(TaskStatus::Cancelled) {
            error!("Cancelled task left in unexpected state: {}", e);
        }
        debug!("Cancelled queued task {}", task_id);
        Some(task)
    }

    /// Clone of the task that would be dequeued next.
    pub fn peek(&self) -> Option<Task> {
        self.lock().heap.peek().map(|entry| entry.task.clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().ids.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued task, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    /// Remove and return every queued task in dequeue order.
    pub fn drain(&self) -> Vec<Task> {
        let mut state = self.lock();
        state.ids.clear();
        let mut entries = std::mem::take(&mut state.heap).into_sorted_vec();
        entries.reverse();
        entries.into_iter().map(|entry| entry.task).collect()
    }

    /// Hold back dequeues for `duration`.
    pub fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.lock();
        state.paused_until = Some(state.paused_until.map_or(until, |current| current.max(until)));
        warn!("Scheduler paused for {:?}", duration);
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        SchedulerStats {
            queue_size: state.heap.len(),
            max_queue_size: self.settings.max_queue_size,
            tasks_enqueued: state.tasks_enqueued,
            tasks_dequeued: state.tasks_dequeued,
            tasks_rejected: state.tasks_rejected,
            tasks_cancelled: state.tasks_cancelled,
            rate_limit_waits: state.rate_limit_waits,
            requests_per_minute: self.settings.requests_per_minute,
            paused: state.paused_until.map_or(false, |until| until > Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{Priority, TaskType};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    fn scheduler(max_queue_size: usize, requests_per_minute: Option<u32>) -> TaskScheduler {
        TaskScheduler::new(
            SchedulerSettings {
                max_queue_size,
                requests_per_minute,
            },
            None,
        )
    }

    fn task(priority: Priority) -> Task {
        Task::new("https://example.com/", TaskType::Visit)
            .unwrap()
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let s = scheduler(100, None);
        let low = task(Priority::Low);
        let high = task(Priority::High);
        let normal_a = task(Priority::Normal);
        let normal_b = task(Priority::Normal);
        let ids = [high.id.clone(), normal_a.id.clone(), normal_b.id.clone(), low.id.clone()];

        assert_eq!(s.enqueue_many(vec![low, high, normal_a, normal_b]), 4);
        assert_eq!(s.peek().unwrap().id, ids[0]);

        for expected in ids {
            let next = s.dequeue(Some(Duration::from_millis(10))).await.unwrap();
            assert_eq!(next.id, expected);
            assert_eq!(next.status, TaskStatus::Queued);
        }
    }

    #[tokio::test]
    async fn test_duplicate_and_capacity_rejection() {
        let s = scheduler(2, None);
        let t = task(Priority::Normal);
        assert!(s.enqueue(t.clone()));
        assert!(!s.enqueue(t.clone()));
        assert_eq!(s.len(), 1);

        assert!(s.enqueue(task(Priority::Normal)));
        let (_, reason) = s.try_enqueue(task(Priority::High)).unwrap_err();
        assert_eq!(reason, RejectReason::QueueFull);
        assert_eq!(s.stats().tasks_rejected, 2);
    }

    #[tokio::test]
    async fn test_enqueue_many_counts_only_accepted() {
        let s = scheduler(3, None);
        let t = task(Priority::Normal);
        let batch = vec![t.clone(), t, task(Priority::Low), task(Priority::High), task(Priority::High)];
        assert_eq!(s.enqueue_many(batch), 3);
        assert_eq!(s.len(), 3);
        assert_eq!(s.stats().tasks_rejected, 2);
    }

    #[tokio::test]
    async fn test_rejects_tasks_in_terminal_state() {
        let s = scheduler(10, None);
        let mut t = task(Priority::Normal);
        t.transition(TaskStatus::Cancelled).unwrap();
        let (_, reason) = s.try_enqueue(t).unwrap_err();
        assert_eq!(reason, RejectReason::InvalidState);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_on_empty_queue() {
        let s = scheduler(10, None);
        let start = Instant::now();
        assert!(s.dequeue(Some(Duration::from_secs(2))).await.is_none());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_blocked_dequeue_is_woken_by_enqueue() {
        let s = scheduler(10, None);
        let mut pending = tokio_test::task::spawn(s.dequeue(None));
        assert_pending!(pending.poll());

        let t = task(Priority::Normal);
        let id = t.id.clone();
        assert!(s.enqueue(t));
        assert!(pending.is_woken());
        let got = assert_ready!(pending.poll());
        assert_eq!(got.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_waiting_workers_each_get_a_task() {
        let s = Arc::new(scheduler(10, None));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let s = s.clone();
                tokio::spawn(async move { s.dequeue(Some(Duration::from_secs(5))).await })
            })
            .collect();
        tokio::task::yield_now().await;

        for _ in 0..3 {
            assert!(s.enqueue(task(Priority::Normal)));
        }
        for worker in workers {
            assert!(worker.await.unwrap().is_some());
        }
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_out_dequeues() {
        let s = scheduler(10, Some(2));
        s.enqueue_many(vec![task(Priority::Normal), task(Priority::Normal), task(Priority::Normal)]);

        let start = Instant::now();
        assert!(s.dequeue(None).await.is_some());
        assert!(s.dequeue(None).await.is_some());
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(s.dequeue(None).await.is_some());
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(s.stats().rate_limit_waits >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_applies_even_when_empty() {
        let s = scheduler(10, Some(1));
        assert!(s.enqueue(task(Priority::Normal)));
        assert!(s.dequeue(None).await.is_some());

        let start = Instant::now();
        assert!(s.dequeue(Some(Duration::from_secs(1))).await.is_none());
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let s = scheduler(10, None);
        let keep = task(Priority::Low);
        let drop_me = task(Priority::High);
        let drop_id = drop_me.id.clone();
        s.enqueue(keep.clone());
        s.enqueue(drop_me);

        let before = s.stats().tasks_cancelled;
        let cancelled = s.cancel_task(&drop_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(!s.contains(&drop_id));
        assert_eq!(s.stats().tasks_cancelled, before + 1);
        assert!(!s.cancel(&drop_id));

        assert_eq!(s.dequeue(Some(Duration::from_millis(10))).await.unwrap().id, keep.id);
    }

    #[tokio::test]
    async fn test_clear_and_drain() {
        let s = scheduler(10, None);
        s.enqueue(task(Priority::Low));
        let high = task(Priority::High);
        s.enqueue(high.clone());

        let drained = s.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, high.id);
        assert!(!s.contains(&high.id));

        s.enqueue(task(Priority::Normal));
        assert_eq!(s.clear(), 1);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_back_dequeue() {
        let s = scheduler(10, None);
        s.enqueue(task(Priority::Normal));
        s.pause_for(Duration::from_secs(30));
        assert!(s.stats().paused);

        assert!(s.dequeue(Some(Duration::from_secs(5))).await.is_none());
        let start = Instant::now();
        assert!(s.dequeue(None).await.is_some());
        assert!(start.elapsed() >= Duration::from_secs(24));
    }
}
