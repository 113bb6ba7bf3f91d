use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::crawler::task::{BatchResult, TaskResult, TaskStatus};

/// Outcome counters kept alongside the stored results
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResultCounters {
    /// Terminal results recorded
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Failed attempts that were scheduled for another try
    pub retries: u64,
    pub total_duration_ms: u64,
    /// Attempts that actually ran, for the duration average
    pub timed_attempts: u64,
}

impl ResultCounters {
    pub fn average_duration_ms(&self) -> f64 {
        if self.timed_attempts == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.timed_attempts as f64
        }
    }
}

/// Attempts kept for [`ResultStore::recent_attempts`]
pub const RECENT_ATTEMPTS: usize = 1024;

const DEFAULT_RETAINED: usize = 10_000;

#[derive(Debug, Default)]
struct StoreState {
    results: HashMap<String, TaskResult>,
    /// Ids in `results`, oldest first
    finished: VecDeque<String>,
    /// Attempt history of tasks that are live or still retained
    attempts: HashMap<String, Vec<TaskResult>>,
    recent: VecDeque<TaskResult>,
    batches: HashMap<String, BatchResult>,
    finished_batches: VecDeque<String>,
    /// Members of batches that have not completed yet
    task_batch: HashMap<String, String>,
    counters: ResultCounters,
}

impl StoreState {
    fn push_recent(&mut self, attempt: TaskResult) {
        if self.recent.len() == RECENT_ATTEMPTS {
            self.recent.pop_front();
        }
        self.recent.push_back(attempt);
    }

    /// Stop routing results to a completed batch and evict the oldest
    /// completed batches past `retained`.
    fn finish_batch(&mut self, batch: &BatchResult, retained: usize) {
        for task_id in &batch.task_ids {
            if self.task_batch.get(task_id) == Some(&batch.batch_id) {
                self.task_batch.remove(task_id);
            }
        }
        self.finished_batches.push_back(batch.batch_id.clone());
        while self.finished_batches.len() > retained {
            if let Some(old) = self.finished_batches.pop_front() {
                self.batches.remove(&old);
            }
        }
    }
}

/// Terminal results and per-attempt history, with waiters notified on every
/// insertion. Counters are updated under the same lock as the maps so a
/// stats snapshot always agrees with the recorded results.
///
/// Finished results and completed batches are retained up to a fixed count,
/// oldest evicted first. Counters cover everything ever recorded.
#[derive(Debug)]
pub struct ResultStore {
    state: Mutex<StoreState>,
    changed: Notify,
    retained: usize,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RETAINED)
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retained` finished results and as many completed batches.
    pub fn with_capacity(retained: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            changed: Notify::new(),
            retained: retained.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Track a batch so member results are folded into it. Ids repeated in
    /// the batch or already claimed by an unfinished batch are left out, and
    /// returned.
    pub fn register_batch(&self, mut batch: BatchResult) -> Vec<String> {
        let refused = {
            let mut state = self.lock();
            let mut seen = HashSet::new();
            let mut refused = Vec::new();
            batch.task_ids.retain(|id| {
                let free = !state.task_batch.contains_key(id) && seen.insert(id.clone());
                if !free {
                    refused.push(id.clone());
                }
                free
            });
            batch.total = batch.task_ids.len();

            for task_id in &batch.task_ids {
                state.task_batch.insert(task_id.clone(), batch.batch_id.clone());
            }
            if batch.is_complete() {
                batch.finished_at = Some(chrono::Utc::now());
                state.finish_batch(&batch, self.retained);
            }
            state.batches.insert(batch.batch_id.clone(), batch);
            refused
        };
        self.changed.notify_waiters();
        refused
    }

    /// Whether a task belongs to a batch that has not completed.
    pub fn in_open_batch(&self, task_id: &str) -> bool {
        self.lock().task_batch.contains_key(task_id)
    }

    /// Take a member out of a batch before it ran. Returns the batch if that
    /// left it complete.
    pub fn remove_batch_member(&self, batch_id: &str, task_id: &str) -> Option<BatchResult> {
        let completed = {
            let mut state = self.lock();
            let batch = state.batches.get_mut(batch_id)?;
            if !batch.remove_member(task_id) {
                return None;
            }
            let completed = batch.is_complete().then(|| batch.clone());
            if state.task_batch.get(task_id).map(String::as_str) == Some(batch_id) {
                state.task_batch.remove(task_id);
            }
            if let Some(batch) = &completed {
                state.finish_batch(batch, self.retained);
            }
            completed
        };
        self.changed.notify_waiters();
        completed
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retry(&self, result: TaskResult) {
        {
            let mut state = self.lock();
            state.counters.retries += 1;
            state.counters.total_duration_ms += result.duration_ms;
            state.counters.timed_attempts += 1;
            state.push_recent(result.clone());
            state
                .attempts
                .entry(result.task_id.clone())
                .or_default()
                .push(result);
        }
        self.changed.notify_waiters();
    }

    /// Record a terminal result. Returns the batch it completed, if any.
    pub fn record(&self, result: TaskResult) -> Option<BatchResult> {
        let completed_batch = {
            let mut state = self.lock();
            let counters = &mut state.counters;
            counters.processed += 1;
            match result.status {
                TaskStatus::Completed => counters.succeeded += 1,
                TaskStatus::Cancelled => counters.cancelled += 1,
                _ => counters.failed += 1,
            }
            if result.duration_ms > 0 || result.success {
                counters.total_duration_ms += result.duration_ms;
                counters.timed_attempts += 1;
            }

            state.push_recent(result.clone());
            state
                .attempts
                .entry(result.task_id.clone())
                .or_default()
                .push(result.clone());

            let completed = match state.task_batch.get(&result.task_id).cloned() {
                Some(batch_id) => state.batches.get_mut(&batch_id).and_then(|batch| {
                    batch.record(result.clone());
                    batch.is_complete().then(|| batch.clone())
                }),
                None => None,
            };
            if let Some(batch) = &completed {
                state.finish_batch(batch, self.retained);
            }

            let task_id = result.task_id.clone();
            if state.results.insert(task_id.clone(), result).is_none() {
                state.finished.push_back(task_id);
            }
            while state.finished.len() > self.retained {
                if let Some(old) = state.finished.pop_front() {
                    state.results.remove(&old);
                    state.attempts.remove(&old);
                }
            }
            completed
        };

        self.changed.notify_waiters();
        completed_batch
    }

    /// Terminal result of a task, if it has finished and is still retained.
    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.lock().results.get(task_id).cloned()
    }

    /// Every recorded attempt of a task, oldest first.
    pub fn attempts(&self, task_id: &str) -> Vec<TaskResult> {
        self.lock().attempts.get(task_id).cloned().unwrap_or_default()
    }

    pub fn batch(&self, batch_id: &str) -> Option<BatchResult> {
        self.lock().batches.get(batch_id).cloned()
    }

    pub fn counters(&self) -> ResultCounters {
        self.lock().counters
    }

    /// The most recent terminal results, newest first.
    pub fn recent(&self, limit: usize) -> Vec<TaskResult> {
        let state = self.lock();
        state
            .finished
            .iter()
            .rev()
            .filter_map(|id| state.results.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The most recent attempts of any task, retried ones included, newest first.
    pub fn recent_attempts(&self, limit: usize) -> Vec<TaskResult> {
        self.lock().recent.iter().rev().take(limit).cloned().collect()
    }

    /// Wait for a task's terminal result.
    pub async fn wait_for(&self, task_id: &str, timeout: Option<Duration>) -> Option<TaskResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.get(task_id) {
                return Some(result);
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wait until every member of a batch has a terminal result. On timeout
    /// the partial aggregate is returned.
    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Option<Duration>) -> Option<BatchResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.batch(batch_id)?;
            if batch.is_complete() {
                return Some(batch);
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return self.batch(batch_id);
                    }
                }
                None => notified.await,
            }
        }
    }
}
