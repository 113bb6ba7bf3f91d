use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

use crate::error::{ConfigError, ErrorKind, ExecutionError, InvalidTransition};

/// Named priority levels. Tasks carry a plain integer so callers may use
/// values in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    Normal = 5,
    High = 10,
    Critical = 20,
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// What a task does once the page is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Visit,
    Scrape,
    Click,
    Screenshot,
    Custom,
    RecordedFlow,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Visit => "visit",
            TaskType::Scrape => "scrape",
            TaskType::Click => "click",
            TaskType::Screenshot => "screenshot",
            TaskType::Custom => "custom",
            TaskType::RecordedFlow => "recorded_flow",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "visit" => Ok(TaskType::Visit),
            "scrape" => Ok(TaskType::Scrape),
            "click" => Ok(TaskType::Click),
            "screenshot" => Ok(TaskType::Screenshot),
            "custom" => Ok(TaskType::Custom),
            "recorded_flow" | "flow" => Ok(TaskType::RecordedFlow),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed edges of the lifecycle state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Retrying)
                | (Retrying, Queued)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a recorded flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowStep {
    Navigate { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Scroll { distance: i32 },
    Wait { millis: u64 },
    Screenshot,
    Extract { name: String, selector: String },
    Evaluate { script: String },
}

/// Per-task execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Wall-clock budget for one attempt
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Retries allowed after the first attempt
    pub max_retries: u32,

    pub use_proxy: bool,
    pub simulate_behavior: bool,
    pub solve_captcha: bool,
    pub take_screenshot: bool,

    /// Named CSS selectors extracted by scrape tasks
    pub selectors: HashMap<String, String>,

    /// Target element for click tasks
    pub click_selector: Option<String>,

    /// Script evaluated by custom tasks
    pub script: Option<String>,

    /// Steps replayed by recorded-flow tasks
    pub flow: Vec<FlowStep>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            use_proxy: true,
            simulate_behavior: false,
            solve_captcha: true,
            take_screenshot: false,
            selectors: HashMap::new(),
            click_selector: None,
            script: None,
            flow: Vec::new(),
        }
    }
}

/// Unit of work: visit a URL and act on the page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Higher values dequeue first
    pub priority: i32,

    pub config: TaskConfig,

    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of executions started so far
    pub attempt: u32,

    pub worker_id: Option<usize>,
    pub proxy_id: Option<String>,
    pub fingerprint_id: Option<String>,

    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,

    /// Task that spawned this one, for sub-tasks
    pub parent_id: Option<String>,

    /// Batch this task was submitted with
    pub batch_id: Option<String>,
}

impl Task {
    /// Create a pending task, validating the target URL.
    pub fn new(url: &str, task_type: TaskType) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            url: parsed.to_string(),
            task_type,
            status: TaskStatus::Pending,
            priority: Priority::Normal.into(),
            config: TaskConfig::default(),
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            attempt: 0,
            worker_id: None,
            proxy_id: None,
            fingerprint_id: None,
            tags: Vec::new(),
            metadata: Map::new(),
            parent_id: None,
            batch_id: None,
        })
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            TaskStatus::Queued => self.queued_at = Some(now),
            TaskStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Mark as running on `worker_id`, starting a new attempt.
    pub fn start_attempt(&mut self, worker_id: usize) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)?;
        self.worker_id = Some(worker_id);
        self.attempt += 1;
        Ok(())
    }

    /// Whether another attempt is allowed after the current one failed.
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.config.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Resource usage counters for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub bytes_received: u64,
    pub requests: u32,
}

/// What a successful execution produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageOutcome {
    pub final_url: Option<String>,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    pub data: Value,
    pub screenshot_path: Option<String>,
    pub resources: ResourceUsage,
    pub captcha_detected: bool,
    pub bot_detected: bool,
    pub proxy_id: Option<String>,
    pub fingerprint_id: Option<String>,
}

/// Immutable record of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub attempt: u32,
    pub success: bool,
    pub status: TaskStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    pub final_url: Option<String>,
    pub status_code: Option<u16>,
    pub title: Option<String>,

    /// Structured data extracted from the page
    pub data: Value,
    pub screenshot_path: Option<String>,

    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,

    pub resources: ResourceUsage,
    pub captcha_detected: bool,
    pub bot_detected: bool,

    pub worker_id: Option<usize>,
    pub proxy_id: Option<String>,
}

impl TaskResult {
    pub fn succeeded(
        task: &Task,
        outcome: PageOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            task_id: task.id.clone(),
            attempt: task.attempt,
            success: true,
            status: TaskStatus::Completed,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
            final_url: outcome.final_url,
            status_code: outcome.status_code,
            title: outcome.title,
            data: outcome.data,
            screenshot_path: outcome.screenshot_path,
            error: None,
            error_kind: None,
            resources: outcome.resources,
            captcha_detected: outcome.captcha_detected,
            bot_detected: outcome.bot_detected,
            worker_id: task.worker_id,
            proxy_id: outcome.proxy_id,
        }
    }

    /// Record a failed attempt. `status` is the status the task moved to
    /// afterwards (retrying, failed or cancelled).
    pub fn failed(
        task: &Task,
        error: &ExecutionError,
        status: TaskStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            task_id: task.id.clone(),
            attempt: task.attempt,
            success: false,
            status,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(started_at, finished_at),
            final_url: None,
            status_code: None,
            title: None,
            data: Value::Null,
            screenshot_path: None,
            error: Some(error.message.clone()),
            error_kind: Some(error.kind),
            resources: ResourceUsage::default(),
            captcha_detected: error.kind == ErrorKind::Captcha,
            bot_detected: error.kind == ErrorKind::BotDetected,
            worker_id: task.worker_id,
            proxy_id: task.proxy_id.clone(),
        }
    }

    /// Terminal record for a task that never ran (cancelled while queued,
    /// rejected on submission).
    pub fn not_run(task: &Task, status: TaskStatus, error: &ExecutionError) -> Self {
        let now = Utc::now();
        Self {
            duration_ms: 0,
            ..Self::failed(task, error, status, now)
        }
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Aggregate over tasks submitted together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub task_ids: Vec<String>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub results: Vec<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchResult {
    pub fn new(batch_id: String, task_ids: Vec<String>) -> Self {
        Self {
            batch_id,
            total: task_ids.len(),
            task_ids,
            completed: 0,
            failed: 0,
            cancelled: 0,
            results: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Fold in the terminal result of one member task.
    pub fn record(&mut self, result: TaskResult) {
        match result.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => return,
        }
        self.results.push(result);
        if self.is_complete() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Drop a member that never ran. Returns false if it is not a member.
    pub fn remove_member(&mut self, task_id: &str) -> bool {
        let Some(pos) = self.task_ids.iter().position(|id| id == task_id) else {
            return false;
        };
        self.task_ids.remove(pos);
        self.total = self.total.saturating_sub(1);
        if self.is_complete() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.failed + self.cancelled == self.total
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.cancelled;
        if finished == 0 {
            return 0.0;
        }
        self.completed as f64 / finished as f64
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("https://example.com/page", TaskType::Visit).unwrap()
    }

    #[test]
    fn test_rejects_malformed_urls() {
        assert!(Task::new("not a url", TaskType::Visit).is_err());
        assert!(Task::new("ftp://example.com/file", TaskType::Visit).is_err());
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut t = task();
        t.transition(TaskStatus::Queued).unwrap();
        t.start_attempt(3).unwrap();
        assert_eq!(t.attempt, 1);
        assert_eq!(t.worker_id, Some(3));
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_retry_cycle_and_terminal_states() {
        let mut t = task();
        t.transition(TaskStatus::Queued).unwrap();
        t.start_attempt(0).unwrap();
        t.transition(TaskStatus::Retrying).unwrap();
        t.transition(TaskStatus::Queued).unwrap();
        t.start_attempt(1).unwrap();
        assert_eq!(t.attempt, 2);
        t.transition(TaskStatus::Failed).unwrap();

        for next in [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed] {
            let err = t.clone().transition(next).unwrap_err();
            assert_eq!(err.from, TaskStatus::Failed);
        }
    }

    #[test]
    fn test_cannot_skip_queue() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Running).is_err());
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn test_retry_budget() {
        let mut t = task();
        t.config.max_retries = 2;
        t.attempt = 2;
        assert!(t.can_retry());
        t.attempt = 3;
        assert!(!t.can_retry());
    }

    #[test]
    fn test_batch_completion_and_success_rate() {
        let tasks: Vec<Task> = (0..3).map(|_| task()).collect();
        let mut batch = BatchResult::new(
            "b1".to_string(),
            tasks.iter().map(|t| t.id.clone()).collect(),
        );
        let now = Utc::now();

        batch.record(TaskResult::succeeded(&tasks[0], PageOutcome::default(), now));
        batch.record(TaskResult::failed(
            &tasks[1],
            &ExecutionError::new(ErrorKind::Network, "reset"),
            TaskStatus::Failed,
            now,
        ));
        assert!(!batch.is_complete());

        batch.record(TaskResult::not_run(
            &tasks[2],
            TaskStatus::Cancelled,
            &ExecutionError::cancelled(),
        ));
        assert!(batch.is_complete());
        assert!((batch.success_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
        assert!(batch.finished_at.is_some());
    }

    #[test]
    fn test_flow_steps_parse_from_yaml() {
        let yaml = r##"
- action: navigate
  url: https://example.com/login
- action: type
  selector: "#user"
  text: alice
- action: wait
  millis: 250
"##;
        let steps: Vec<FlowStep> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2], FlowStep::Wait { millis: 250 });
    }
}
