use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crawler::task::{TaskResult, TaskType};

/// Throughput metrics collector shared by the workers
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Execution attempts finished
    pub total_attempts: usize,

    pub successful_attempts: usize,
    pub failed_attempts: usize,

    /// Attempt durations in milliseconds, keyed by task type
    pub durations: HashMap<String, Vec<u64>>,

    /// Attempts finished per minute bucket
    pub attempt_rate: Vec<(DateTime<Utc>, usize)>,

    pub bytes_received: u64,

    /// Current attempts per second
    pub current_rate: f64,

    /// Peak attempts per second
    pub peak_rate: f64,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,

    /// Failure counts keyed by error kind
    pub error_kinds: HashMap<String, usize>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            durations: HashMap::new(),
            attempt_rate: Vec::new(),
            bytes_received: 0,
            current_rate: 0.0,
            peak_rate: 0.0,
            status_codes: HashMap::new(),
            error_kinds: HashMap::new(),
        }
    }
}

impl Metrics {
    /// Mean attempt duration across all task types
    pub fn average_duration_ms(&self) -> f64 {
        let (sum, count) = self
            .durations
            .values()
            .flatten()
            .fold((0u64, 0usize), |(sum, count), d| (sum + d, count + 1));
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record one finished attempt
    pub async fn record_attempt(&self, task_type: TaskType, result: &TaskResult) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_attempts += 1;
        if result.success {
            metrics.successful_attempts += 1;
        } else {
            metrics.failed_attempts += 1;
            if let Some(kind) = result.error_kind {
                *metrics.error_kinds.entry(kind.to_string()).or_default() += 1;
            }
        }

        metrics.bytes_received += result.resources.bytes_received;

        metrics
            .durations
            .entry(task_type.as_str().to_string())
            .or_default()
            .push(result.duration_ms);

        if let Some(code) = result.status_code {
            *metrics.status_codes.entry(code).or_default() += 1;
        }

        let now = Utc::now();
        match metrics.attempt_rate.last_mut() {
            Some((bucket_start, count)) if (now - *bucket_start).num_seconds() < 60 => *count += 1,
            _ => metrics.attempt_rate.push((now, 1)),
        }

        if let Some((first, _)) = metrics.attempt_rate.first().copied() {
            let elapsed = (now - first).num_seconds().max(1) as f64;
            metrics.current_rate = metrics.total_attempts as f64 / elapsed;
            metrics.peak_rate = metrics.peak_rate.max(metrics.current_rate);
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.lock().await = Metrics::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{PageOutcome, Task, TaskStatus};
    use crate::error::{ErrorKind, ExecutionError};

    #[tokio::test]
    async fn test_records_successes_and_failures() {
        let metrics = MetricsCollector::new();
        let task = Task::new("https://example.com/", TaskType::Scrape).unwrap();

        let ok = TaskResult::succeeded(
            &task,
            PageOutcome {
                status_code: Some(200),
                ..Default::default()
            },
            Utc::now(),
        );
        let err = ExecutionError::new(ErrorKind::Timeout, "slow");
        let failed = TaskResult::failed(&task, &err, TaskStatus::Failed, Utc::now());

        metrics.record_attempt(TaskType::Scrape, &ok).await;
        metrics.record_attempt(TaskType::Scrape, &failed).await;

        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.total_attempts, 2);
        assert_eq!(snapshot.successful_attempts, 1);
        assert_eq!(snapshot.status_codes.get(&200), Some(&1));
        assert_eq!(snapshot.error_kinds.get("timeout"), Some(&1));
        assert_eq!(snapshot.durations.get("scrape").map(Vec::len), Some(2));
        assert!(snapshot.peak_rate > 0.0);

        metrics.reset().await;
        assert_eq!(metrics.get_metrics().await.total_attempts, 0);
    }
}
