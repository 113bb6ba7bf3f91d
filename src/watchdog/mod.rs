//! Out-of-band health monitoring and recovery.
//!
//! A [`Watchdog`] inspects one part of the system and reports a
//! [`HealthCheck`]. The [`WatchdogManager`] runs the watchdogs on their
//! intervals, tracks consecutive failures and asks a [`RecoveryExecutor`] for
//! corrective actions, bounded by attempt count and cooldown.

pub mod checks;
pub mod manager;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

// Re-export common types
pub use checks::{BrowserWatchdog, NetworkWatchdog, PageWatchdog};
pub use manager::{HealthReport, WatchdogManager, WatchdogStats};

/// Health of a component, ordered from best to worst. `Unknown` (not checked
/// yet) ranks above `Healthy` and below every observed problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unknown,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corrective action a watchdog can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartBrowser,
    RetryPage,
    RotateProxy,
    DismissPopup,
    ClearCache,
    Backoff,
    SkipTask,
    None,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::RestartBrowser => "restart_browser",
            RecoveryAction::RetryPage => "retry_page",
            RecoveryAction::RotateProxy => "rotate_proxy",
            RecoveryAction::DismissPopup => "dismiss_popup",
            RecoveryAction::ClearCache => "clear_cache",
            RecoveryAction::Backoff => "backoff",
            RecoveryAction::SkipTask => "skip_task",
            RecoveryAction::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What went wrong in a failing check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
    pub severity: Severity,
    pub recoverable: bool,
    pub action: RecoveryAction,
}

impl FailureInfo {
    pub fn new(kind: &str, message: impl Into<String>, severity: Severity, action: RecoveryAction) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            severity,
            recoverable: action != RecoveryAction::None,
            action,
        }
    }
}

/// Result of one watchdog check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub failure: Option<FailureInfo>,
    pub checked_at: DateTime<Utc>,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HealthCheck {
    pub fn healthy() -> Self {
        Self::with_status(HealthStatus::Healthy)
    }

    pub fn with_status(status: HealthStatus) -> Self {
        Self {
            status,
            failure: None,
            checked_at: Utc::now(),
            details: serde_json::Map::new(),
        }
    }

    pub fn failing(status: HealthStatus, failure: FailureInfo) -> Self {
        Self {
            failure: Some(failure),
            ..Self::with_status(status)
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_failing(&self) -> bool {
        self.failure.is_some()
    }
}

/// Bookkeeping for one watchdog, read elsewhere as a snapshot clone
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogState {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub last_status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub checks_run: u64,
    pub failures_detected: u64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
    pub alerts_raised: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<FailureInfo>,

    /// Recoveries tried since the watchdog last reported healthy
    #[serde(skip)]
    pub(crate) episode_attempts: u32,
    #[serde(skip)]
    pub(crate) alerted: bool,
    #[serde(skip)]
    pub(crate) last_recovery: Option<Instant>,
}

impl WatchdogState {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
            running: false,
            last_status: HealthStatus::Unknown,
            last_check: None,
            checks_run: 0,
            failures_detected: 0,
            recovery_attempts: 0,
            recovery_successes: 0,
            alerts_raised: 0,
            consecutive_failures: 0,
            last_failure: None,
            episode_attempts: 0,
            alerted: false,
            last_recovery: None,
        }
    }
}

/// A periodic health check
#[async_trait]
pub trait Watchdog: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn check(&self) -> HealthCheck;
}

/// Performs the corrective actions watchdogs ask for
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn recover(&self, action: RecoveryAction, failure: &FailureInfo) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering_puts_critical_last() {
        let worst = [HealthStatus::Degraded, HealthStatus::Critical, HealthStatus::Healthy]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, HealthStatus::Critical);
        assert!(HealthStatus::Healthy < HealthStatus::Unhealthy);
    }

    #[test]
    fn test_unknown_ranks_between_healthy_and_degraded() {
        assert!(HealthStatus::Healthy < HealthStatus::Unknown);
        assert!(HealthStatus::Unknown < HealthStatus::Degraded);
        assert_eq!(WatchdogState::new("page", true).last_status, HealthStatus::Unknown);
        assert_eq!(HealthStatus::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_failure_without_action_is_not_recoverable() {
        let failure = FailureInfo::new("x", "broken", Severity::High, RecoveryAction::None);
        assert!(!failure.recoverable);
        let failure = FailureInfo::new("x", "broken", Severity::High, RecoveryAction::Backoff);
        assert!(failure.recoverable);
    }
}
