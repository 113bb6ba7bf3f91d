use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::circuit::{BreakerStats, CircuitBreaker, CircuitState, SharedBreaker};
use crate::cli::config::CircuitBreakerSettings;
use crate::events::EventBus;

/// Breaker guarding browser launches
pub const BROWSER_LAUNCH: &str = "browser-launch";

/// Breaker guarding proxy acquisition
pub const PROXY_ACQUIRE: &str = "proxy-acquire";

/// Named breakers, created on first use with shared settings
pub struct CircuitBreakerManager {
    settings: CircuitBreakerSettings,
    breakers: RwLock<HashMap<String, SharedBreaker>>,
    bus: Option<EventBus>,
}

impl CircuitBreakerManager {
    pub fn new(settings: CircuitBreakerSettings, bus: Option<EventBus>) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Get the breaker for `name`, creating it if needed.
    pub fn get(&self, name: &str) -> SharedBreaker {
        if let Some(existing) = self.get_existing(name) {
            return existing;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating circuit breaker '{}'", name);
                Arc::new(CircuitBreaker::new(
                    name,
                    self.settings.clone(),
                    self.bus.clone(),
                ))
            })
            .clone()
    }

    pub fn get_existing(&self, name: &str) -> Option<SharedBreaker> {
        self.breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Stats for every breaker, sorted by name
    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|b| b.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers currently rejecting calls
    pub fn open_circuits(&self) -> Vec<String> {
        let breakers: Vec<SharedBreaker> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut open: Vec<String> = breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.name().to_string())
            .collect();
        open.sort();
        open
    }

    /// Reset one breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.get_existing(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<SharedBreaker> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BreakerError;

    fn manager() -> CircuitBreakerManager {
        CircuitBreakerManager::new(
            CircuitBreakerSettings {
                failure_threshold: 1,
                success_threshold: 1,
                timeout_secs: 60,
                half_open_max_calls: 1,
            },
            None,
        )
    }

    #[test]
    fn test_lazily_creates_one_instance_per_name() {
        let manager = manager();
        assert!(manager.get_existing(BROWSER_LAUNCH).is_none());
        let a = manager.get(BROWSER_LAUNCH);
        let b = manager.get(BROWSER_LAUNCH);
        assert!(Arc::ptr_eq(&a, &b));
        manager.get(PROXY_ACQUIRE);
        let names: Vec<String> = manager.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![BROWSER_LAUNCH.to_string(), PROXY_ACQUIRE.to_string()]);
    }

    #[tokio::test]
    async fn test_breakers_are_isolated_and_resettable() {
        let manager = manager();
        let result: Result<(), BreakerError<&str>> = manager
            .get(PROXY_ACQUIRE)
            .call(|| async { Err("no proxies") })
            .await;
        assert!(result.is_err());

        assert_eq!(manager.open_circuits(), vec![PROXY_ACQUIRE.to_string()]);
        assert_eq!(manager.get(BROWSER_LAUNCH).state(), CircuitState::Closed);

        assert!(manager.reset(PROXY_ACQUIRE));
        assert!(manager.open_circuits().is_empty());
        assert!(!manager.reset("unknown"));

        for name in [BROWSER_LAUNCH, PROXY_ACQUIRE] {
            let _: Result<(), BreakerError<&str>> =
                manager.get(name).call(|| async { Err("down") }).await;
        }
        assert_eq!(manager.open_circuits().len(), 2);
        manager.reset_all();
        assert!(manager.open_circuits().is_empty());
    }
}
