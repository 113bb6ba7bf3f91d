use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{FailureInfo, HealthCheck, HealthStatus, RecoveryAction, Severity, Watchdog};
use crate::breaker::{CircuitBreakerManager, CircuitState, BROWSER_LAUNCH};
use crate::browser::BrowserEngine;
use crate::crawler::results::ResultStore;
use crate::proxy::ProxyProvider;

/// Pings the browser engine and watches the launch breaker
pub struct BrowserWatchdog {
    engine: Arc<dyn BrowserEngine>,
    breakers: Arc<CircuitBreakerManager>,
    interval: Duration,
}

impl BrowserWatchdog {
    pub fn new(engine: Arc<dyn BrowserEngine>, breakers: Arc<CircuitBreakerManager>, interval: Duration) -> Self {
        Self {
            engine,
            breakers,
            interval,
        }
    }
}

#[async_trait]
impl Watchdog for BrowserWatchdog {
    fn name(&self) -> &str {
        "browser"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn check(&self) -> HealthCheck {
        if let Some(breaker) = self.breakers.get_existing(BROWSER_LAUNCH) {
            if breaker.state() == CircuitState::Open {
                return HealthCheck::failing(
                    HealthStatus::Unhealthy,
                    FailureInfo::new(
                        "circuit_open",
                        "Browser launches are being rejected by the circuit breaker",
                        Severity::High,
                        RecoveryAction::Backoff,
                    ),
                )
                .detail("circuit", breaker.state().to_string());
            }
        }

        // Launched lazily by the first task
        if !self.engine.is_running().await {
            return HealthCheck::healthy().detail("launched", false);
        }

        match self.engine.health_check().await {
            Ok(()) => HealthCheck::healthy().detail("launched", true),
            Err(e) => HealthCheck::failing(
                HealthStatus::Unhealthy,
                FailureInfo::new(
                    "browser_unresponsive",
                    format!("{:#}", e),
                    Severity::High,
                    RecoveryAction::RestartBrowser,
                ),
            ),
        }
    }
}

/// Watches failure, CAPTCHA and bot-wall rates over the latest attempts
pub struct PageWatchdog {
    results: Arc<ResultStore>,
    window: usize,
    threshold: f64,
    interval: Duration,
}

impl PageWatchdog {
    pub fn new(results: Arc<ResultStore>, window: usize, threshold: f64, interval: Duration) -> Self {
        Self {
            results,
            window,
            threshold,
            interval,
        }
    }
}

#[async_trait]
impl Watchdog for PageWatchdog {
    fn name(&self) -> &str {
        "page"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn check(&self) -> HealthCheck {
        let attempts = self.results.recent_attempts(self.window);
        if attempts.is_empty() {
            return HealthCheck::healthy().detail("samples", 0);
        }

        let total = attempts.len() as f64;
        let rate = |count: usize| count as f64 / total;
        let failure_rate = rate(attempts.iter().filter(|r| !r.success).count());
        let blocked_rate = rate(
            attempts
                .iter()
                .filter(|r| r.captcha_detected || r.bot_detected)
                .count(),
        );

        let check = if blocked_rate >= self.threshold {
            HealthCheck::failing(
                HealthStatus::Unhealthy,
                FailureInfo::new(
                    "bot_detection",
                    format!("{:.0}% of recent attempts hit a CAPTCHA or bot wall", blocked_rate * 100.0),
                    Severity::High,
                    RecoveryAction::RotateProxy,
                ),
            )
        } else if failure_rate >= self.threshold {
            HealthCheck::failing(
                HealthStatus::Unhealthy,
                FailureInfo::new(
                    "page_failures",
                    format!("{:.0}% of recent attempts failed", failure_rate * 100.0),
                    Severity::Medium,
                    RecoveryAction::Backoff,
                ),
            )
        } else if failure_rate >= self.threshold / 2.0 {
            HealthCheck::with_status(HealthStatus::Degraded)
        } else {
            HealthCheck::healthy()
        };

        check
            .detail("samples", attempts.len())
            .detail("failure_rate", failure_rate)
            .detail("blocked_rate", blocked_rate)
    }
}

/// Probes the proxy provider
pub struct NetworkWatchdog {
    proxies: Arc<dyn ProxyProvider>,
    interval: Duration,
}

impl NetworkWatchdog {
    pub fn new(proxies: Arc<dyn ProxyProvider>, interval: Duration) -> Self {
        Self { proxies, interval }
    }
}

#[async_trait]
impl Watchdog for NetworkWatchdog {
    fn name(&self) -> &str {
        "network"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn check(&self) -> HealthCheck {
        let health = match self.proxies.health_check().await {
            Ok(health) => health,
            Err(e) => {
                return HealthCheck::failing(
                    HealthStatus::Unhealthy,
                    FailureInfo::new(
                        "proxy_check_failed",
                        format!("{:#}", e),
                        Severity::Medium,
                        RecoveryAction::RotateProxy,
                    ),
                )
            }
        };

        let ratio = health.healthy_ratio();
        let check = if health.total > 0 && health.healthy == 0 {
            HealthCheck::failing(
                HealthStatus::Critical,
                FailureInfo::new(
                    "no_healthy_proxies",
                    format!("All {} proxies failed their health check", health.total),
                    Severity::Critical,
                    RecoveryAction::Backoff,
                ),
            )
        } else if ratio < 0.5 {
            HealthCheck::failing(
                HealthStatus::Unhealthy,
                FailureInfo::new(
                    "proxies_unhealthy",
                    format!("Unhealthy proxies: {}", health.unhealthy.join(", ")),
                    Severity::Medium,
                    RecoveryAction::RotateProxy,
                ),
            )
        } else if ratio < 1.0 {
            HealthCheck::with_status(HealthStatus::Degraded)
        } else {
            HealthCheck::healthy()
        };

        check
            .detail("total", health.total)
            .detail("healthy", health.healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBrowserEngine;
    use crate::cli::config::CircuitBreakerSettings;
    use crate::crawler::task::{PageOutcome, Task, TaskResult, TaskStatus, TaskType};
    use crate::error::{ErrorKind, ExecutionError};
    use crate::proxy::{MockProxyProvider, ProxyHealth};
    use chrono::Utc;

    fn breakers() -> Arc<CircuitBreakerManager> {
        Arc::new(CircuitBreakerManager::new(CircuitBreakerSettings::default(), None))
    }

    #[tokio::test]
    async fn test_browser_not_launched_is_healthy() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_is_running().return_const(false);
        engine.expect_health_check().never();

        let dog = BrowserWatchdog::new(Arc::new(engine), breakers(), Duration::from_secs(30));
        assert_eq!(dog.check().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_browser_failed_ping_asks_for_restart() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_is_running().return_const(true);
        engine
            .expect_health_check()
            .returning(|| Err(anyhow::anyhow!("connection refused")));

        let dog = BrowserWatchdog::new(Arc::new(engine), breakers(), Duration::from_secs(30));
        let check = dog.check().await;
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.failure.unwrap().action, RecoveryAction::RestartBrowser);
    }

    #[tokio::test]
    async fn test_page_watchdog_flags_bot_walls() {
        let results = Arc::new(ResultStore::new());
        let task = Task::new("https://example.com/", TaskType::Visit).unwrap();
        for _ in 0..3 {
            let err = ExecutionError::new(ErrorKind::BotDetected, "blocked");
            results.record_retry(TaskResult::failed(&task, &err, TaskStatus::Retrying, Utc::now()));
        }
        results.record(TaskResult::succeeded(&task, PageOutcome::default(), Utc::now()));

        let dog = PageWatchdog::new(results, 10, 0.5, Duration::from_secs(15));
        let check = dog.check().await;
        assert_eq!(check.status, HealthStatus::Unhealthy);
        let failure = check.failure.unwrap();
        assert_eq!(failure.kind, "bot_detection");
        assert_eq!(failure.action, RecoveryAction::RotateProxy);
    }

    #[tokio::test]
    async fn test_page_watchdog_without_samples_is_healthy() {
        let dog = PageWatchdog::new(Arc::new(ResultStore::new()), 10, 0.5, Duration::from_secs(15));
        assert!(!dog.check().await.is_failing());
    }

    #[tokio::test]
    async fn test_network_watchdog_levels() {
        let mut proxies = MockProxyProvider::new();
        let mut answers = vec![
            ProxyHealth { total: 4, healthy: 4, unhealthy: vec![] },
            ProxyHealth { total: 4, healthy: 1, unhealthy: vec!["a".into(), "b".into(), "c".into()] },
            ProxyHealth { total: 4, healthy: 0, unhealthy: vec![] },
        ]
        .into_iter();
        proxies
            .expect_health_check()
            .times(3)
            .returning(move || Ok(answers.next().unwrap()));

        let dog = NetworkWatchdog::new(Arc::new(proxies), Duration::from_secs(60));
        assert_eq!(dog.check().await.status, HealthStatus::Healthy);
        assert_eq!(dog.check().await.status, HealthStatus::Unhealthy);
        assert_eq!(dog.check().await.status, HealthStatus::Critical);
    }
}
