pub mod circuit;
pub mod manager;

// Re-export common types
pub use circuit::{BreakerStats, CircuitBreaker, CircuitState, SharedBreaker};
pub use manager::{CircuitBreakerManager, BROWSER_LAUNCH, PROXY_ACQUIRE};
