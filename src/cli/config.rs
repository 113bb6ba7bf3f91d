use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};
use std::collections::HashMap;

use crate::crawler::results::RECENT_ATTEMPTS;
use crate::crawler::retry::BackoffStrategy;
use crate::crawler::task::TaskConfig;
use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub event_bus: EventBusSettings,
    pub watchdog: WatchdogSettings,
    pub task_defaults: TaskConfig,
    pub browser: BrowserSettings,
    pub proxy: ProxySettings,
    pub output: OutputSettings,
    pub persistence: PersistenceSettings,
}

/// Task queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_queue_size: usize,
    pub requests_per_minute: Option<u32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            requests_per_minute: None,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub dequeue_timeout_ms: u64,  // How long an idle worker waits before re-checking shutdown
    pub shutdown_timeout_secs: u64,
    pub retained_results: usize,  // Finished task results and batches kept for lookup
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            dequeue_timeout_ms: 1000,
            shutdown_timeout_secs: 30,
            retained_results: 10_000,
        }
    }
}

/// Retry backoff settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker thresholds, shared by every named breaker
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,  // Time spent open before trial calls are allowed
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 60,
            half_open_max_calls: 1,
        }
    }
}

/// Event bus settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventBusSettings {
    pub queue_size: usize,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self { queue_size: 10_000 }
    }
}

/// Health monitoring and recovery settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub browser_interval_secs: u64,
    pub page_interval_secs: u64,
    pub network_interval_secs: u64,
    pub failure_threshold: u32,  // Consecutive failing checks before recovery starts
    pub max_recovery_attempts: u32,
    pub recovery_cooldown_secs: u64,
    pub page_failure_rate_threshold: f64,
    pub page_window: usize,  // Number of recent results the page watchdog looks at
    pub backoff_secs: u64,  // Pause applied by the backoff recovery action
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            browser_interval_secs: 30,
            page_interval_secs: 15,
            network_interval_secs: 60,
            failure_threshold: 3,
            max_recovery_attempts: 3,
            recovery_cooldown_secs: 30,
            page_failure_rate_threshold: 0.5,
            page_window: 20,
            backoff_secs: 30,
        }
    }
}

/// Browser service settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub service_url: String,
    pub browser_type: String,  // "chrome", "firefox", etc.
    pub headless: bool,
    pub request_timeout_secs: u64,
    pub fingerprints: Vec<BrowserFingerprint>,
    pub behavior: BrowserBehavior,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Browser behavior simulation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserBehavior {
    pub scroll_behavior: String,  // "random", "smooth", "none"
    pub click_delay: (u64, u64),  // Min and max delay in milliseconds
    pub typing_speed: (u64, u64), // Min and max milliseconds per character
    pub mouse_movement: bool,
    pub dwell_time: (u64, u64), // Min and max time on page in milliseconds
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:5000".to_string(),
            browser_type: "chrome".to_string(),
            headless: true,
            request_timeout_secs: 120,
            fingerprints: vec![
                BrowserFingerprint {
                    name: "windows_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "Win32".to_string(),
                    extra_headers: HashMap::new(),
                },
            ],
            behavior: BrowserBehavior::default(),
        }
    }
}

impl Default for BrowserBehavior {
    fn default() -> Self {
        Self {
            scroll_behavior: "random".to_string(),
            click_delay: (100, 300),
            typing_speed: (50, 150),
            mouse_movement: true,
            dwell_time: (1000, 4000),
        }
    }
}

/// Proxy settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub rotation_strategy: String, // "session", "request", "timed"
    pub rotation_interval: Option<u64>, // Seconds between rotations if using "timed"
    pub health_check_url: String,
    pub proxy_list: Vec<ProxyConfig>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_strategy: "session".to_string(),
            rotation_interval: Some(600),
            health_check_url: "https://www.google.com".to_string(),
            proxy_list: vec![],
        }
    }
}

/// Individual proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: String, // "http", "socks5"
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country: Option<String>,
}

/// Where results and screenshots are written
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputSettings {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./output"),
        }
    }
}

/// Queue snapshot settings used to resume interrupted runs
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PersistenceSettings {
    pub state_file: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::invalid("pool.max_workers", "must be at least 1"));
        }
        if self.pool.dequeue_timeout_ms == 0 {
            return Err(ConfigError::invalid("pool.dequeue_timeout_ms", "must be at least 1"));
        }
        if self.pool.retained_results == 0 {
            return Err(ConfigError::invalid("pool.retained_results", "must be at least 1"));
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(ConfigError::invalid("scheduler.max_queue_size", "must be at least 1"));
        }
        if self.scheduler.requests_per_minute == Some(0) {
            return Err(ConfigError::invalid(
                "scheduler.requests_per_minute",
                "must be positive or omitted",
            ));
        }
        if self.event_bus.queue_size == 0 {
            return Err(ConfigError::invalid("event_bus.queue_size", "must be at least 1"));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_max_calls == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "thresholds and half_open_max_calls must be at least 1",
            ));
        }

        if self.retry.factor < 1.0 || !self.retry.factor.is_finite() {
            return Err(ConfigError::invalid("retry.factor", "must be a finite value >= 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid("retry", "base_delay_ms exceeds max_delay_ms"));
        }

        let wd = &self.watchdog;
        if !(0.0..=1.0).contains(&wd.page_failure_rate_threshold) {
            return Err(ConfigError::invalid(
                "watchdog.page_failure_rate_threshold",
                "must be between 0 and 1",
            ));
        }
        if wd.failure_threshold == 0 {
            return Err(ConfigError::invalid("watchdog.failure_threshold", "must be at least 1"));
        }
        for (key, secs) in [
            ("watchdog.browser_interval_secs", wd.browser_interval_secs),
            ("watchdog.page_interval_secs", wd.page_interval_secs),
            ("watchdog.network_interval_secs", wd.network_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }
        if wd.page_window == 0 || wd.page_window > RECENT_ATTEMPTS {
            return Err(ConfigError::invalid(
                "watchdog.page_window",
                format!("must be between 1 and {}", RECENT_ATTEMPTS),
            ));
        }

        let behavior = &self.browser.behavior;
        for (key, (min, max)) in [
            ("browser.behavior.click_delay", behavior.click_delay),
            ("browser.behavior.typing_speed", behavior.typing_speed),
            ("browser.behavior.dwell_time", behavior.dwell_time),
        ] {
            if min > max {
                return Err(ConfigError::invalid(key, format!("min {} exceeds max {}", min, max)));
            }
        }

        if self.browser.fingerprints.is_empty() {
            return Err(ConfigError::invalid("browser.fingerprints", "at least one is required"));
        }
        if self.proxy.enabled && self.proxy.proxy_list.is_empty() {
            return Err(ConfigError::invalid("proxy.proxy_list", "proxies are enabled but none are configured"));
        }

        Ok(())
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-orchestrator", "page-orchestrator") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the profiles directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile, falling back to the default for "default"
    pub fn load_profile(profile: &str) -> Result<Self> {
        if profile == "default" {
            return Self::load_default();
        }

        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()
            .context(format!("Invalid configuration in {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let sites_dir = Self::config_dir().join("sites");
        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
