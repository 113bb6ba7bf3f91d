pub mod behavior;
pub mod captcha;
pub mod extract;
pub mod fingerprint;
pub mod remote;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cli::config::ProxyConfig;
use crate::crawler::task::Task;

// Re-export common types
pub use behavior::HumanBehavior;
pub use captcha::MarkerCaptchaDetector;
pub use extract::HtmlExtractor;
pub use fingerprint::{CompleteFingerprint, FingerprintManager};
pub use remote::RemoteBrowserService;

/// Identity a new browser context is opened with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOptions {
    pub fingerprint: Option<CompleteFingerprint>,
    pub proxy: Option<ProxyConfig>,
}

/// Controls the browser process (or service) that pages are opened in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self) -> Result<()>;

    async fn is_running(&self) -> bool;

    /// Cheap liveness check used by the browser watchdog
    async fn health_check(&self) -> Result<()>;

    /// Open an isolated page with its own identity
    async fn new_context(&self, options: ContextOptions) -> Result<Box<dyn BrowserPage>>;

    async fn close(&self) -> Result<()>;
}

/// One open page
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
    async fn scroll(&self, distance: i32) -> Result<()>;

    /// PNG bytes of the current viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn evaluate(&self, script: &str) -> Result<Value>;
    async fn content(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    async fn url(&self) -> Result<String>;

    /// Status of the last navigation, when known
    async fn status_code(&self) -> Option<u16>;

    async fn close(&self) -> Result<()>;
}

/// Produces the browser identity for a task
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FingerprintGenerator: Send + Sync {
    async fn generate(&self, task: &Task) -> Result<CompleteFingerprint>;
}

/// What the CAPTCHA collaborator found on a page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaOutcome {
    pub detected: bool,
    pub solved: bool,
    /// The page is a bot wall rather than a solvable challenge
    pub bot_detected: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn detect_and_solve(&self, url: &str, content: &str) -> Result<CaptchaOutcome>;
}

/// Pulls structured data out of page HTML
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataExtractor: Send + Sync {
    async fn extract(&self, html: &str, selectors: &HashMap<String, String>) -> Result<Value>;
}

/// Drives page interactions with human-like timing
#[async_trait]
pub trait BehaviorSimulator: Send + Sync {
    async fn click(&self, page: &dyn BrowserPage, selector: &str) -> Result<()>;
    async fn type_text(&self, page: &dyn BrowserPage, selector: &str, text: &str) -> Result<()>;
    async fn scroll(&self, page: &dyn BrowserPage) -> Result<()>;

    /// Linger on the page as a reader would
    async fn dwell(&self, page: &dyn BrowserPage) -> Result<()>;
}
