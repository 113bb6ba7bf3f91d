use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

/// Kinds of lifecycle events, rendered with dotted namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.submitted")]
    TaskSubmitted,
    #[serde(rename = "task.queued")]
    TaskQueued,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.retrying")]
    TaskRetrying,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "batch.submitted")]
    BatchSubmitted,
    #[serde(rename = "batch.completed")]
    BatchCompleted,
    #[serde(rename = "worker.started")]
    WorkerStarted,
    #[serde(rename = "worker.stopped")]
    WorkerStopped,
    #[serde(rename = "circuit.opened")]
    CircuitOpened,
    #[serde(rename = "circuit.half_opened")]
    CircuitHalfOpened,
    #[serde(rename = "circuit.closed")]
    CircuitClosed,
    #[serde(rename = "watchdog.health_changed")]
    HealthChanged,
    #[serde(rename = "watchdog.failure_detected")]
    FailureDetected,
    #[serde(rename = "watchdog.recovery_started")]
    RecoveryStarted,
    #[serde(rename = "watchdog.recovery_succeeded")]
    RecoverySucceeded,
    #[serde(rename = "watchdog.recovery_failed")]
    RecoveryFailed,
    #[serde(rename = "watchdog.alert")]
    WatchdogAlert,
    #[serde(rename = "system.started")]
    SystemStarted,
    #[serde(rename = "system.stopping")]
    SystemStopping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskSubmitted => "task.submitted",
            EventKind::TaskQueued => "task.queued",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskRetrying => "task.retrying",
            EventKind::TaskCancelled => "task.cancelled",
            EventKind::BatchSubmitted => "batch.submitted",
            EventKind::BatchCompleted => "batch.completed",
            EventKind::WorkerStarted => "worker.started",
            EventKind::WorkerStopped => "worker.stopped",
            EventKind::CircuitOpened => "circuit.opened",
            EventKind::CircuitHalfOpened => "circuit.half_opened",
            EventKind::CircuitClosed => "circuit.closed",
            EventKind::HealthChanged => "watchdog.health_changed",
            EventKind::FailureDetected => "watchdog.failure_detected",
            EventKind::RecoveryStarted => "watchdog.recovery_started",
            EventKind::RecoverySucceeded => "watchdog.recovery_succeeded",
            EventKind::RecoveryFailed => "watchdog.recovery_failed",
            EventKind::WatchdogAlert => "watchdog.alert",
            EventKind::SystemStarted => "system.started",
            EventKind::SystemStopping => "system.stopping",
        }
    }

    /// Leading segment of the dotted name (`task`, `circuit`, ...).
    pub fn namespace(&self) -> &'static str {
        let name = self.as_str();
        match name.find('.') {
            Some(idx) => &name[..idx],
            None => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable notification published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub data: Map<String, Value>,
    pub source: String,
    pub timestamp: DateTime<Utc>,

    /// Monotonic creation instant, process-local
    #[serde(skip, default = "Instant::now")]
    pub at: Instant,

    pub correlation_id: Option<String>,
    pub parent_id: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data: Map::new(),
            source: source.into(),
            timestamp: Utc::now(),
            at: Instant::now(),
            correlation_id: None,
            parent_id: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data.extend(data);
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Mark this event as caused by `parent`, inheriting its correlation id.
    pub fn caused_by(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id.clone());
        self.correlation_id = parent
            .correlation_id
            .clone()
            .or_else(|| Some(parent.id.clone()));
        self
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Kind(EventKind),
    /// Every kind under a namespace, e.g. `task`
    Namespace(String),
    All,
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Kind(k) => *k == kind,
            EventFilter::Namespace(ns) => kind.namespace() == ns,
            EventFilter::All => true,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip_through_serde() {
        let json = serde_json::to_string(&EventKind::CircuitHalfOpened).unwrap();
        assert_eq!(json, "\"circuit.half_opened\"");
        assert_eq!(EventKind::TaskRetrying.namespace(), "task");
        assert_eq!(EventKind::WatchdogAlert.namespace(), "watchdog");
    }

    #[test]
    fn test_filters() {
        assert!(EventFilter::All.matches(EventKind::SystemStarted));
        assert!(EventFilter::Namespace("task".into()).matches(EventKind::TaskFailed));
        assert!(!EventFilter::Namespace("task".into()).matches(EventKind::BatchCompleted));
        assert!(EventFilter::from(EventKind::TaskFailed).matches(EventKind::TaskFailed));
        assert!(!EventFilter::from(EventKind::TaskFailed).matches(EventKind::TaskCompleted));
    }

    #[test]
    fn test_causal_chain() {
        let root = Event::new(EventKind::BatchSubmitted, "orchestrator");
        let child = Event::new(EventKind::TaskSubmitted, "orchestrator").caused_by(&root);
        let grandchild = Event::new(EventKind::TaskQueued, "scheduler").caused_by(&child);
        assert_eq!(child.correlation_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(grandchild.correlation_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(grandchild.parent_id.as_deref(), Some(child.id.as_str()));
    }
}
