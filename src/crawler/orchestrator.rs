//! Top-level facade wiring the engine together.
//!
//! The orchestrator owns the event bus, scheduler, worker pool, circuit
//! breakers and watchdogs. Callers submit tasks or batches, wait for their
//! results and observe the system through stats, health and events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{BreakerStats, CircuitBreakerManager, BROWSER_LAUNCH};
use crate::browser::{
    BehaviorSimulator, BrowserEngine, CaptchaSolver, DataExtractor, FingerprintGenerator,
    FingerprintManager, HtmlExtractor, HumanBehavior, MarkerCaptchaDetector, RemoteBrowserService,
};
use crate::cli::config::OrchestratorConfig;
use crate::crawler::executor::{BrowserExecutor, TaskExecutor};
use crate::crawler::pool::{PoolStats, WorkerPool};
use crate::crawler::results::ResultStore;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::scheduler::{RejectReason, SchedulerStats, TaskScheduler};
use crate::crawler::task::{BatchResult, Task, TaskResult, TaskStatus};
use crate::error::{ErrorKind, ExecutionError, SubmitError};
use crate::events::{Event, EventBus, EventBusStats, EventFilter, EventKind, Subscription};
use crate::proxy::{ProxyPool, ProxyProvider, RotationStrategy};
use crate::storage::{JsonlOutputWriter, OutputWriter, QueueSnapshot};
use crate::utils::Metrics;
use crate::watchdog::{
    BrowserWatchdog, FailureInfo, HealthCheck, HealthStatus, NetworkWatchdog, PageWatchdog,
    RecoveryAction, RecoveryExecutor, WatchdogManager, WatchdogState, WatchdogStats,
};

/// The external collaborators a browser-backed orchestrator runs with
pub struct Collaborators {
    pub engine: Arc<dyn BrowserEngine>,
    pub fingerprints: Arc<dyn FingerprintGenerator>,
    pub captcha: Arc<dyn CaptchaSolver>,
    pub extractor: Arc<dyn DataExtractor>,
    pub behavior: Arc<dyn BehaviorSimulator>,
    pub proxies: Option<Arc<dyn ProxyProvider>>,
    pub output: Option<Arc<dyn OutputWriter>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub running: bool,
    pub uptime_secs: u64,
    pub scheduler: SchedulerStats,
    pub pool: PoolStats,
    pub event_bus: EventBusStats,
    pub circuit_breakers: Vec<BreakerStats>,
    pub watchdogs: WatchdogStats,
    pub watchdog_states: Vec<WatchdogState>,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub running: bool,
    pub open_circuits: Vec<String>,
    pub checks: HashMap<String, HealthCheck>,
}

/// Carries out recovery actions requested by the watchdogs
struct EngineRecovery {
    engine: Option<Arc<dyn BrowserEngine>>,
    proxies: Option<Arc<dyn ProxyProvider>>,
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<CircuitBreakerManager>,
    backoff: Duration,
}

#[async_trait]
impl RecoveryExecutor for EngineRecovery {
    async fn recover(&self, action: RecoveryAction, failure: &FailureInfo) -> Result<()> {
        debug!("Recovering from {} with {}", failure.kind, action.as_str());
        match action {
            RecoveryAction::RestartBrowser => {
                let engine = self.engine.as_ref().ok_or_else(|| anyhow!("No browser engine configured"))?;
                if let Err(e) = engine.close().await {
                    warn!("Closing browser before restart failed: {:#}", e);
                }
                engine.launch().await.context("Browser restart failed")?;
                self.breakers.reset(BROWSER_LAUNCH);
                Ok(())
            }
            RecoveryAction::RotateProxy => {
                let proxies = self.proxies.as_ref().ok_or_else(|| anyhow!("No proxy provider configured"))?;
                match proxies.rotate().await? {
                    Some(proxy) => {
                        info!("Rotated to proxy {}", proxy.name);
                        Ok(())
                    }
                    None => Err(anyhow!("No healthy proxy to rotate to")),
                }
            }
            RecoveryAction::Backoff => {
                self.scheduler.pause_for(self.backoff);
                Ok(())
            }
            RecoveryAction::None => Ok(()),
            RecoveryAction::RetryPage
            | RecoveryAction::DismissPopup
            | RecoveryAction::ClearCache
            | RecoveryAction::SkipTask => Err(anyhow!(
                "{} applies to a single page and is handled by the executor",
                action.as_str()
            )),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: EventBus,
    scheduler: Arc<TaskScheduler>,
    results: Arc<ResultStore>,
    pool: Arc<WorkerPool>,
    breakers: Arc<CircuitBreakerManager>,
    watchdogs: WatchdogManager,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Orchestrator {
    /// Build an orchestrator with the shipped collaborators: the remote
    /// browser service, the configured proxy pool and the JSON-lines writer.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let engine = Arc::new(RemoteBrowserService::new(&config.browser)?);
        let proxies = config
            .proxy
            .enabled
            .then(|| Arc::new(ProxyPool::new(config.proxy.clone())) as Arc<dyn ProxyProvider>);
        let output = if config.output.enabled {
            let writer = JsonlOutputWriter::new(&config.output.directory).await?;
            Some(Arc::new(writer) as Arc<dyn OutputWriter>)
        } else {
            None
        };

        let collaborators = Collaborators {
            engine,
            fingerprints: Arc::new(FingerprintManager::new(config.browser.fingerprints.clone())),
            captcha: Arc::new(MarkerCaptchaDetector::new()?),
            extractor: Arc::new(HtmlExtractor::new()),
            behavior: Arc::new(HumanBehavior::new(config.browser.behavior.clone())),
            proxies,
            output,
        };
        Self::with_collaborators(config, collaborators)
    }

    /// Build an orchestrator that executes tasks through `collaborators`.
    pub fn with_collaborators(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        let bus = EventBus::new(config.event_bus.queue_size);
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            Some(bus.clone()),
        ));

        let mut executor = BrowserExecutor::new(
            Arc::clone(&collaborators.engine),
            collaborators.fingerprints,
            collaborators.captcha,
            collaborators.extractor,
            collaborators.behavior,
            Arc::clone(&breakers),
        );
        if let Some(proxies) = &collaborators.proxies {
            let rotation = RotationStrategy::from_config(
                &config.proxy.rotation_strategy,
                config.proxy.rotation_interval,
            );
            executor = executor.with_proxies(Arc::clone(proxies), rotation);
        }
        if let Some(output) = &collaborators.output {
            executor = executor.with_output(Arc::clone(output));
        }

        Self::assemble(
            config,
            bus,
            breakers,
            Arc::new(executor),
            Some(collaborators.engine),
            collaborators.proxies,
            collaborators.output,
        )
    }

    /// Build an orchestrator around a custom execution strategy. Only the
    /// page watchdog runs, since there is no browser or proxy to check.
    pub fn with_executor(config: OrchestratorConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        let bus = EventBus::new(config.event_bus.queue_size);
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            Some(bus.clone()),
        ));
        Self::assemble(config, bus, breakers, executor, None, None, None)
    }

    fn assemble(
        config: OrchestratorConfig,
        bus: EventBus,
        breakers: Arc<CircuitBreakerManager>,
        executor: Arc<dyn TaskExecutor>,
        engine: Option<Arc<dyn BrowserEngine>>,
        proxies: Option<Arc<dyn ProxyProvider>>,
        output: Option<Arc<dyn OutputWriter>>,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), Some(bus.clone())));
        let results = Arc::new(ResultStore::with_capacity(config.pool.retained_results));

        let mut pool = WorkerPool::new(
            config.pool.clone(),
            Arc::clone(&scheduler),
            executor,
            Arc::clone(&results),
            RetryPolicy::from(&config.retry),
            Some(bus.clone()),
        );
        if let Some(output) = output {
            pool = pool.with_output(output);
        }

        let settings = &config.watchdog;
        let recovery = EngineRecovery {
            engine: engine.clone(),
            proxies: proxies.clone(),
            scheduler: Arc::clone(&scheduler),
            breakers: Arc::clone(&breakers),
            backoff: Duration::from_secs(settings.backoff_secs),
        };
        let mut watchdogs = WatchdogManager::new(settings.clone(), Arc::new(recovery), Some(bus.clone()));
        if let Some(engine) = engine {
            watchdogs.register(Arc::new(BrowserWatchdog::new(
                engine,
                Arc::clone(&breakers),
                Duration::from_secs(settings.browser_interval_secs),
            )));
        }
        watchdogs.register(Arc::new(PageWatchdog::new(
            Arc::clone(&results),
            settings.page_window,
            settings.page_failure_rate_threshold,
            Duration::from_secs(settings.page_interval_secs),
        )));
        if let Some(proxies) = proxies {
            watchdogs.register(Arc::new(NetworkWatchdog::new(
                proxies,
                Duration::from_secs(settings.network_interval_secs),
            )));
        }

        Ok(Self {
            config,
            bus,
            scheduler,
            results,
            pool: Arc::new(pool),
            breakers,
            watchdogs,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start the event bus, then the workers, then the watchdogs.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.start().await;
        self.pool.start();
        self.watchdogs.start();
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        self.bus
            .publish(
                Event::new(EventKind::SystemStarted, "orchestrator")
                    .with("workers", self.config.pool.max_workers),
            )
            .await;
        info!("Orchestrator started");
    }

    /// Stop in reverse order of startup. Tasks still queued are written to
    /// the state file when one is configured.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Orchestrator stopping");
        self.bus
            .publish(Event::new(EventKind::SystemStopping, "orchestrator"))
            .await;

        self.watchdogs.stop().await;
        self.pool.stop().await;
        self.bus.stop().await;

        if let Some(path) = &self.config.persistence.state_file {
            let queued = self.scheduler.drain();
            if !queued.is_empty() {
                QueueSnapshot::new(queued)
                    .save(path)
                    .await
                    .context("Failed to persist queued tasks")?;
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    /// Queue a task, returning its id.
    pub fn submit_task(&self, task: Task) -> Result<String, SubmitError> {
        if !self.is_running() {
            return Err(SubmitError::NotRunning);
        }
        if self.is_live(&task.id) {
            return Err(SubmitError::Duplicate(task.id));
        }

        let id = task.id.clone();
        self.bus.publish_sync(
            Event::new(EventKind::TaskSubmitted, "orchestrator")
                .with("task_id", id.clone())
                .with("url", task.url.clone())
                .with("task_type", task.task_type.as_str())
                .with("priority", task.priority)
                .correlated(task.batch_id.clone().unwrap_or_else(|| id.clone())),
        );

        self.scheduler
            .try_enqueue(task)
            .map_err(|(task, reason)| submit_error(&task, reason))?;
        Ok(id)
    }

    /// Queued, running, waiting for a retry or claimed by an unfinished batch.
    fn is_live(&self, task_id: &str) -> bool {
        self.scheduler.contains(task_id)
            || self.pool.is_active(task_id)
            || self.results.in_open_batch(task_id)
    }

    /// Queue tasks as one batch, returning the batch id.
    ///
    /// Members whose id is already live, or repeated within the batch, are
    /// left out of it and do not touch the existing task. Members the queue
    /// rejects for any other reason are recorded as failed so the batch still
    /// completes.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<String, SubmitError> {
        if !self.is_running() {
            return Err(SubmitError::NotRunning);
        }

        let batch_id = Uuid::new_v4().to_string();
        let total = tasks.len();
        let mut seen = HashSet::new();
        let (mut members, duplicates): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|task| seen.insert(task.id.clone()) && !self.is_live(&task.id));
        for task in &mut members {
            task.batch_id = Some(batch_id.clone());
        }

        let refused: HashSet<String> = self
            .results
            .register_batch(BatchResult::new(
                batch_id.clone(),
                members.iter().map(|t| t.id.clone()).collect(),
            ))
            .into_iter()
            .collect();

        let registered = members.len().saturating_sub(refused.len());
        let mut rejected = 0;
        for task in duplicates {
            rejected += 1;
            warn!("Batch {} member {} rejected: duplicate id", batch_id, task.id);
        }

        let mut accepted = 0;
        for task in members {
            if refused.contains(&task.id) {
                rejected += 1;
                warn!("Batch {} member {} rejected: duplicate id", batch_id, task.id);
                continue;
            }
            match self.scheduler.try_enqueue(task) {
                Ok(()) => accepted += 1,
                Err((task, RejectReason::Duplicate)) => {
                    rejected += 1;
                    warn!("Batch {} member {} rejected: duplicate id", batch_id, task.id);
                    if let Some(batch) = self.results.remove_batch_member(&batch_id, &task.id) {
                        self.pool.announce_batch(&batch).await;
                    }
                }
                Err((task, reason)) => {
                    let err = submit_error(&task, reason);
                    warn!("Batch {} member {} rejected: {}", batch_id, task.id, err);
                    let failure = ExecutionError::fatal(ErrorKind::Internal, err.to_string());
                    self.pool
                        .record_terminal(TaskResult::not_run(&task, TaskStatus::Failed, &failure))
                        .await;
                }
            }
        }

        info!("Batch {} submitted: {}/{} tasks queued", batch_id, accepted, total);
        self.bus
            .publish(
                Event::new(EventKind::BatchSubmitted, "orchestrator")
                    .with("batch_id", batch_id.clone())
                    .with("total", total)
                    .with("accepted", accepted)
                    .with("rejected", rejected)
                    .correlated(batch_id.clone()),
            )
            .await;

        // A batch left with no members was complete on registration
        if registered == 0 {
            if let Some(batch) = self.results.batch(&batch_id) {
                self.pool.announce_batch(&batch).await;
            }
        }
        Ok(batch_id)
    }

    pub async fn wait_for_task(&self, task_id: &str, timeout: Option<Duration>) -> Option<TaskResult> {
        self.results.wait_for(task_id, timeout).await
    }

    /// Wait for a batch. On timeout the partial aggregate is returned.
    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Option<Duration>) -> Option<BatchResult> {
        self.results.wait_for_batch(batch_id, timeout).await
    }

    /// Submit a task and wait for its result.
    pub async fn run_task(&self, task: Task, timeout: Option<Duration>) -> Result<Option<TaskResult>, SubmitError> {
        let id = self.submit_task(task)?;
        Ok(self.wait_for_task(&id, timeout).await)
    }

    /// Cancel a queued, running or retry-waiting task.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        if let Some(task) = self.scheduler.cancel_task(task_id) {
            let err = ExecutionError::cancelled();
            self.bus
                .publish(
                    Event::new(EventKind::TaskCancelled, "orchestrator")
                        .with("task_id", task.id.clone())
                        .with("url", task.url.clone()),
                )
                .await;
            self.pool
                .record_terminal(TaskResult::not_run(&task, TaskStatus::Cancelled, &err))
                .await;
            return true;
        }
        self.pool.cancel(task_id).await
    }

    pub async fn get_stats(&self) -> OrchestratorStats {
        let uptime_secs = self
            .started_at
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map_or(0, |at| at.elapsed().as_secs());

        OrchestratorStats {
            running: self.is_running(),
            uptime_secs,
            scheduler: self.scheduler.stats(),
            pool: self.pool.stats(),
            event_bus: self.bus.stats(),
            circuit_breakers: self.breakers.stats(),
            watchdogs: self.watchdogs.get_stats(),
            watchdog_states: self.watchdogs.get_states(),
            metrics: self.pool.metrics().get_metrics().await,
        }
    }

    /// Run every watchdog now and combine with the breaker states.
    pub async fn get_health(&self) -> SystemHealth {
        let report = self.watchdogs.check_health().await;
        let open_circuits = self.breakers.open_circuits();
        let mut status = report.status;
        if !open_circuits.is_empty() {
            status = status.max(HealthStatus::Degraded);
        }
        SystemHealth {
            status,
            running: self.is_running(),
            open_circuits,
            checks: report.checks,
        }
    }

    /// Register a handler on the event bus.
    pub fn subscribe<F, Fut>(&self, filter: impl Into<EventFilter>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.subscribe(filter, handler)
    }

    /// Re-enqueue the tasks saved by the last shutdown. Returns how many
    /// were restored; the state file is removed once they are queued.
    pub async fn resume_from_snapshot(&self) -> Result<usize> {
        let Some(path) = &self.config.persistence.state_file else {
            return Ok(0);
        };
        let Some(snapshot) = QueueSnapshot::load(path).await? else {
            return Ok(0);
        };

        let tasks = snapshot.into_pending_tasks();
        let total = tasks.len();
        let restored = self.scheduler.enqueue_many(tasks);
        if restored < total {
            warn!("Only {}/{} saved tasks could be queued", restored, total);
        }

        tokio::fs::remove_file(path)
            .await
            .context(format!("Failed to remove state file: {}", path.display()))?;
        info!("Resumed {} tasks from {}", restored, path.display());
        Ok(restored)
    }
}

fn submit_error(task: &Task, reason: RejectReason) -> SubmitError {
    match reason {
        RejectReason::QueueFull => SubmitError::QueueFull,
        RejectReason::Duplicate => SubmitError::Duplicate(task.id.clone()),
        RejectReason::InvalidState => SubmitError::InvalidState(task.id.clone()),
    }
}
