use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{FailureInfo, HealthCheck, HealthStatus, RecoveryAction, RecoveryExecutor, Watchdog, WatchdogState};
use crate::cli::config::WatchdogSettings;
use crate::events::{Event, EventBus, EventKind};

/// Aggregate over every watchdog
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStats {
    pub total_watchdogs: usize,
    pub running: usize,
    pub total_checks: u64,
    pub total_failures: u64,
    pub total_recovery_attempts: u64,
    pub total_recovery_successes: u64,
    pub total_alerts: u64,
    pub overall_status: HealthStatus,
}

/// Result of checking every watchdog at once
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status reported
    pub status: HealthStatus,
    pub checks: HashMap<String, HealthCheck>,
}

enum Decision {
    Nothing,
    Recover(RecoveryAction, FailureInfo),
    Alert(FailureInfo),
}

struct Shared {
    settings: WatchdogSettings,
    recovery: Arc<dyn RecoveryExecutor>,
    bus: Option<EventBus>,
    states: Mutex<HashMap<String, WatchdogState>>,
}

/// Runs watchdogs on their intervals and drives bounded recovery.
pub struct WatchdogManager {
    shared: Arc<Shared>,
    watchdogs: Vec<Arc<dyn Watchdog>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl WatchdogManager {
    pub fn new(settings: WatchdogSettings, recovery: Arc<dyn RecoveryExecutor>, bus: Option<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                recovery,
                bus,
                states: Mutex::new(HashMap::new()),
            }),
            watchdogs: Vec::new(),
            shutdown: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&mut self, watchdog: Arc<dyn Watchdog>) {
        let state = WatchdogState::new(watchdog.name(), self.shared.settings.enabled);
        lock(&self.shared.states).insert(watchdog.name().to_string(), state);
        self.watchdogs.push(watchdog);
    }

    /// Start one interval loop per watchdog
    pub fn start(&self) {
        if !self.shared.settings.enabled {
            info!("Watchdogs disabled");
            return;
        }
        let mut shutdown = lock(&self.shutdown);
        if shutdown.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let mut loops = lock(&self.loops);
        for watchdog in &self.watchdogs {
            if watchdog.interval().is_zero() {
                error!("Watchdog '{}' has a zero check interval, not starting it", watchdog.name());
                continue;
            }
            self.shared.set_running(watchdog.name(), true);
            let shared = Arc::clone(&self.shared);
            let watchdog = Arc::clone(watchdog);
            let mut stop = rx.clone();
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(watchdog.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            shared.run_check(watchdog.as_ref()).await;
                        }
                        _ = stop.changed() => break,
                    }
                }
                debug!("Watchdog '{}' stopped", watchdog.name());
            }));
        }
        info!("Started {} watchdogs", self.watchdogs.len());
    }

    pub async fn stop(&self) {
        let Some(tx) = lock(&self.shutdown).take() else {
            return;
        };
        let _ = tx.send(true);

        let loops: Vec<JoinHandle<()>> = lock(&self.loops).drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!("Watchdog loop ended abnormally: {}", e);
            }
        }
        for watchdog in &self.watchdogs {
            self.shared.set_running(watchdog.name(), false);
        }
        info!("Watchdogs stopped");
    }

    pub fn get_states(&self) -> Vec<WatchdogState> {
        let mut states: Vec<WatchdogState> = lock(&self.shared.states).values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn get(&self, name: &str) -> Option<WatchdogState> {
        lock(&self.shared.states).get(name).cloned()
    }

    pub fn get_stats(&self) -> WatchdogStats {
        let states = lock(&self.shared.states);
        WatchdogStats {
            total_watchdogs: states.len(),
            running: states.values().filter(|s| s.running).count(),
            total_checks: states.values().map(|s| s.checks_run).sum(),
            total_failures: states.values().map(|s| s.failures_detected).sum(),
            total_recovery_attempts: states.values().map(|s| s.recovery_attempts).sum(),
            total_recovery_successes: states.values().map(|s| s.recovery_successes).sum(),
            total_alerts: states.values().map(|s| s.alerts_raised).sum(),
            overall_status: states
                .values()
                .map(|s| s.last_status)
                .max()
                .unwrap_or(HealthStatus::Unknown),
        }
    }

    /// Run every watchdog now. Results feed the same failure tracking as the
    /// interval loops.
    pub async fn check_health(&self) -> HealthReport {
        let mut checks = HashMap::new();
        let mut status = HealthStatus::Healthy;
        for watchdog in &self.watchdogs {
            let check = self.shared.run_check(watchdog.as_ref()).await;
            let reported = self
                .get(watchdog.name())
                .map_or(check.status, |state| state.last_status);
            status = status.max(reported);
            checks.insert(watchdog.name().to_string(), check);
        }
        HealthReport { status, checks }
    }
}

impl Shared {
    fn set_running(&self, name: &str, running: bool) {
        if let Some(state) = lock(&self.states).get_mut(name) {
            state.running = running;
        }
    }

    async fn run_check(&self, watchdog: &dyn Watchdog) -> HealthCheck {
        let name = watchdog.name().to_string();
        let check = watchdog.check().await;
        let (previous, current, decision) = self.evaluate(&name, &check);

        if previous != current {
            info!("Watchdog '{}' status {} -> {}", name, previous, current);
            self.emit(
                Event::new(EventKind::HealthChanged, "watchdog_manager")
                    .with("watchdog", name.clone())
                    .with("previous", previous.as_str())
                    .with("status", current.as_str()),
            )
            .await;
        }

        if let Some(failure) = &check.failure {
            debug!("Watchdog '{}' detected {}: {}", name, failure.kind, failure.message);
            self.emit(
                Event::new(EventKind::FailureDetected, "watchdog_manager")
                    .with("watchdog", name.clone())
                    .with("kind", failure.kind.clone())
                    .with("message", failure.message.clone()),
            )
            .await;
        }

        match decision {
            Decision::Nothing => {}
            Decision::Recover(action, failure) => self.recover(&name, action, &failure).await,
            Decision::Alert(failure) => {
                error!(
                    "Watchdog '{}' gave up recovering from {}: {}",
                    name, failure.kind, failure.message
                );
                self.emit(
                    Event::new(EventKind::WatchdogAlert, "watchdog_manager")
                        .with("watchdog", name.clone())
                        .with("kind", failure.kind.clone())
                        .with("message", failure.message.clone())
                        .with("status", HealthStatus::Critical.as_str()),
                )
                .await;
            }
        }

        check
    }

    /// Update the state with a check and decide what to do about it
    fn evaluate(&self, name: &str, check: &HealthCheck) -> (HealthStatus, HealthStatus, Decision) {
        let mut states = lock(&self.states);
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| WatchdogState::new(name, true));

        let previous = state.last_status;
        state.checks_run += 1;
        state.last_check = Some(Utc::now());

        let Some(failure) = &check.failure else {
            state.consecutive_failures = 0;
            if check.status == HealthStatus::Healthy {
                state.alerted = false;
                state.episode_attempts = 0;
            }
            state.last_status = if state.alerted { HealthStatus::Critical } else { check.status };
            return (previous, state.last_status, Decision::Nothing);
        };

        state.failures_detected += 1;
        state.consecutive_failures += 1;
        state.last_failure = Some(failure.clone());

        let decision = if state.alerted || state.consecutive_failures < self.settings.failure_threshold {
            Decision::Nothing
        } else if !failure.recoverable || state.episode_attempts >= self.settings.max_recovery_attempts {
            state.alerted = true;
            state.alerts_raised += 1;
            Decision::Alert(failure.clone())
        } else {
            let cooldown = Duration::from_secs(self.settings.recovery_cooldown_secs);
            let cooling = state
                .last_recovery
                .map_or(false, |at| at.elapsed() < cooldown);
            if cooling {
                Decision::Nothing
            } else {
                state.episode_attempts += 1;
                state.recovery_attempts += 1;
                state.last_recovery = Some(Instant::now());
                Decision::Recover(failure.action, failure.clone())
            }
        };

        state.last_status = if state.alerted { HealthStatus::Critical } else { check.status };
        (previous, state.last_status, decision)
    }

    async fn recover(&self, name: &str, action: RecoveryAction, failure: &FailureInfo) {
        warn!("Watchdog '{}' attempting recovery: {}", name, action.as_str());
        self.emit(
            Event::new(EventKind::RecoveryStarted, "watchdog_manager")
                .with("watchdog", name)
                .with("action", action.as_str()),
        )
        .await;

        match self.recovery.recover(action, failure).await {
            Ok(()) => {
                if let Some(state) = lock(&self.states).get_mut(name) {
                    state.recovery_successes += 1;
                    state.consecutive_failures = 0;
                }
                info!("Watchdog '{}' recovery {} succeeded", name, action.as_str());
                self.emit(
                    Event::new(EventKind::RecoverySucceeded, "watchdog_manager")
                        .with("watchdog", name)
                        .with("action", action.as_str()),
                )
                .await;
            }
            Err(e) => {
                warn!("Watchdog '{}' recovery {} failed: {:#}", name, action.as_str(), e);
                self.emit(
                    Event::new(EventKind::RecoveryFailed, "watchdog_manager")
                        .with("watchdog", name)
                        .with("action", action.as_str())
                        .with("error", format!("{:#}", e)),
                )
                .await;
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event).await;
        }
    }
}
