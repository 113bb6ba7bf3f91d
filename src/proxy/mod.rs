pub mod manager;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::config::ProxyConfig;

// Re-export common types
pub use manager::ProxyPool;

/// When a provider moves on to a different proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// A fresh proxy for every request
    PerRequest,
    /// Keep a proxy until the interval elapses
    Timed(Duration),
    /// Keep a proxy until it fails
    Session,
}

impl RotationStrategy {
    /// Parse the configured strategy name ("request", "timed", "session").
    pub fn from_config(name: &str, interval_secs: Option<u64>) -> Self {
        match name {
            "request" => RotationStrategy::PerRequest,
            "timed" => RotationStrategy::Timed(Duration::from_secs(interval_secs.unwrap_or(600))),
            _ => RotationStrategy::Session,
        }
    }
}

/// Restricts which proxies are eligible
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyFilter {
    pub country: Option<String>,
    pub proxy_type: Option<String>,
}

impl ProxyFilter {
    pub fn matches(&self, proxy: &ProxyConfig) -> bool {
        let country_ok = match (&self.country, &proxy.country) {
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
            (None, _) => true,
        };
        let type_ok = self
            .proxy_type
            .as_ref()
            .map_or(true, |wanted| wanted.eq_ignore_ascii_case(&proxy.proxy_type));
        country_ok && type_ok
    }
}

/// Result of probing every proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: Vec<String>,
}

impl ProxyHealth {
    /// Share of proxies that answered, 1.0 when none are configured
    pub fn healthy_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}

/// Source of outbound proxies. Proxies are identified by their configured name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Proxy to use for the next request. `None` when proxying is disabled.
    async fn get_proxy(
        &self,
        strategy: RotationStrategy,
        filter: ProxyFilter,
    ) -> Result<Option<ProxyConfig>>;

    async fn mark_success(&self, proxy_id: &str, latency: Duration);

    async fn mark_failure(&self, proxy_id: &str, reason: &str);

    async fn health_check(&self) -> Result<ProxyHealth>;

    /// Abandon the current proxy and pick another
    async fn rotate(&self) -> Result<Option<ProxyConfig>>;
}
