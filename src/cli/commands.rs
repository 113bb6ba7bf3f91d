use anyhow::{Result, Context};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::config::OrchestratorConfig;
use crate::crawler::orchestrator::Orchestrator;
use crate::crawler::task::{BatchResult, Task, TaskConfig, TaskType};
use crate::events::{Event, EventFilter};

/// Options of the `run` command
pub struct RunOptions {
    pub task_type: TaskType,
    pub priority: i32,
    pub workers: Option<usize>,
    pub timeout: Option<u64>,
    pub events: bool,
}

/// One entry of a batch file
#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub url: String,
    #[serde(default = "default_task_type")]
    pub task_type: TaskType,
    pub priority: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Replaces the profile's task defaults for this entry
    pub config: Option<TaskConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BatchFile {
    pub tasks: Vec<BatchEntry>,
}

fn default_task_type() -> TaskType {
    TaskType::Visit
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read batch file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .context(format!("Failed to parse batch file: {}", path.display()))
    }

    /// Build tasks, using `defaults` for entries without their own config
    pub fn into_tasks(self, defaults: &TaskConfig) -> Result<Vec<Task>> {
        self.tasks
            .into_iter()
            .map(|entry| {
                let mut task = Task::new(&entry.url, entry.task_type)?
                    .with_config(entry.config.unwrap_or_else(|| defaults.clone()))
                    .with_tags(entry.tags);
                if let Some(priority) = entry.priority {
                    task = task.with_priority(priority);
                }
                task.metadata = entry.metadata;
                Ok(task)
            })
            .collect()
    }
}

/// Run tasks for the given URLs
pub async fn run(urls: Vec<String>, profile: String, options: RunOptions) -> Result<()> {
    let mut config = OrchestratorConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;

    if let Some(workers) = options.workers {
        config.pool.max_workers = workers;
    }
    if let Some(timeout) = options.timeout {
        config.task_defaults.timeout = Duration::from_secs(timeout);
    }

    let tasks = urls
        .iter()
        .map(|url| {
            Ok(Task::new(url, options.task_type)?
                .with_priority(options.priority)
                .with_config(config.task_defaults.clone()))
        })
        .collect::<Result<Vec<Task>>>()?;

    run_batch(config, tasks, options.events).await
}

/// Run the tasks listed in a batch file
pub async fn batch(file: PathBuf, profile: String, events: bool) -> Result<()> {
    let config = OrchestratorConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    let tasks = BatchFile::load(&file)?.into_tasks(&config.task_defaults)?;
    info!("Loaded {} tasks from {}", tasks.len(), file.display());

    run_batch(config, tasks, events).await
}

async fn run_batch(config: OrchestratorConfig, tasks: Vec<Task>, events: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).await?;
    if events {
        stream_events(&orchestrator);
    }
    orchestrator.start().await;

    let batch_id = orchestrator.submit_batch(tasks).await?;
    let outcome = tokio::select! {
        batch = orchestrator.wait_for_batch(&batch_id, None) => batch,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            None
        }
    };

    orchestrator.stop().await?;
    match outcome {
        Some(batch) => print_summary(&batch),
        None => info!("Batch {} did not finish", batch_id),
    }
    Ok(())
}

/// Re-run the tasks saved at the last shutdown
pub async fn resume(profile: String) -> Result<()> {
    let config = OrchestratorConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    if config.persistence.state_file.is_none() {
        anyhow::bail!("Profile '{}' has no persistence.state_file configured", profile);
    }

    let orchestrator = Orchestrator::from_config(config).await?;
    let restored = orchestrator.resume_from_snapshot().await?;
    if restored == 0 {
        println!("No saved tasks to resume");
        return Ok(());
    }

    orchestrator.start().await;
    tokio::select! {
        _ = wait_until_idle(&orchestrator) => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, shutting down"),
    }
    let stats = orchestrator.get_stats().await;
    orchestrator.stop().await?;

    println!(
        "Resumed {} tasks: {} succeeded, {} failed, {} cancelled",
        restored,
        stats.pool.total_tasks_succeeded,
        stats.pool.total_tasks_failed,
        stats.pool.total_tasks_cancelled
    );
    Ok(())
}

/// Run every watchdog once and print the report
pub async fn health(profile: String) -> Result<()> {
    let mut config = OrchestratorConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    // One-off check, the interval loops are not needed
    config.watchdog.enabled = false;

    let orchestrator = Orchestrator::from_config(config).await?;
    orchestrator.start().await;
    let health = orchestrator.get_health().await;
    orchestrator.stop().await?;

    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

async fn wait_until_idle(orchestrator: &Orchestrator) {
    loop {
        let stats = orchestrator.get_stats().await;
        if stats.scheduler.queue_size == 0
            && stats.pool.active_workers == 0
            && stats.pool.pending_retries == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn stream_events(orchestrator: &Orchestrator) {
    // Lives as long as the bus
    let _subscription = orchestrator.subscribe(EventFilter::All, |event: Event| async move {
        println!("{}", serde_json::to_string(&event)?);
        Ok(())
    });
}

fn print_summary(batch: &BatchResult) {
    println!("Batch {}", batch.batch_id);
    println!("  Total:     {}", batch.total);
    println!("  Completed: {}", batch.completed);
    println!("  Failed:    {}", batch.failed);
    println!("  Cancelled: {}", batch.cancelled);
    println!("  Success:   {:.1}%", batch.success_rate() * 100.0);

    for result in batch.results.iter().filter(|r| !r.success) {
        println!(
            "  - {} (attempt {}): {}",
            result.task_id,
            result.attempt,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = OrchestratorConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults when missing
pub fn manage_profile(profile_name: String) -> Result<()> {
    match OrchestratorConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = OrchestratorConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = OrchestratorConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
