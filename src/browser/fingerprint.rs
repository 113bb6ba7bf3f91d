use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FingerprintGenerator;
use crate::cli::config::BrowserFingerprint;
use crate::crawler::task::Task;

/// Expands the configured base fingerprints into full browser identities
pub struct FingerprintManager {
    fingerprints: Vec<BrowserFingerprint>,
}

/// Viewport dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f32,
}

/// Complete browser fingerprint sent with every new context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headers: HashMap<String, String>,
    pub plugins: Vec<String>,
    pub fonts: Vec<String>,
    pub timezone: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub has_touch: bool,
    pub color_depth: u32,
    pub hardware_concurrency: u32,
}

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Berlin",
];

impl FingerprintManager {
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Self {
        Self { fingerprints }
    }

    pub fn random_fingerprint(&self) -> Result<CompleteFingerprint> {
        if self.fingerprints.is_empty() {
            anyhow::bail!("No fingerprints available");
        }
        let index = thread_rng().gen_range(0..self.fingerprints.len());
        Ok(self.complete_fingerprint(&self.fingerprints[index]))
    }

    pub fn get_fingerprint(&self, name: &str) -> Result<CompleteFingerprint> {
        let fingerprint = self
            .fingerprints
            .iter()
            .find(|f| f.name == name)
            .context(format!("Fingerprint not found: {}", name))?;
        Ok(self.complete_fingerprint(fingerprint))
    }

    fn complete_fingerprint(&self, base: &BrowserFingerprint) -> CompleteFingerprint {
        let mut rng = thread_rng();
        let mobile = base.user_agent.contains("Mobile");

        let viewport = if mobile {
            Viewport {
                width: rng.gen_range(320..480),
                height: rng.gen_range(568..812),
                device_scale_factor: rng.gen_range(1.5..3.0),
            }
        } else {
            Viewport {
                width: rng.gen_range(1024..1920),
                height: rng.gen_range(768..1080),
                device_scale_factor: rng.gen_range(1.0..2.0),
            }
        };

        let mut headers = HashMap::from([
            ("User-Agent".to_string(), base.user_agent.clone()),
            ("Accept-Language".to_string(), base.accept_language.clone()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"
                    .to_string(),
            ),
            ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
            ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ]);
        // Configured headers override the standard set
        headers.extend(base.extra_headers.clone());

        let plugins: Vec<String> = if base.user_agent.contains("Chrome") {
            vec!["Chrome PDF Plugin", "Chrome PDF Viewer", "Native Client"]
        } else if base.user_agent.contains("Firefox") {
            vec!["PDF Viewer", "Firefox Default Browser Helper"]
        } else {
            Vec::new()
        }
        .into_iter()
        .map(String::from)
        .collect();

        let fonts = ["Arial", "Courier New", "Georgia", "Times New Roman", "Verdana"]
            .iter()
            .map(|f| f.to_string())
            .collect();

        let (webgl_vendor, webgl_renderer) = if base.platform.contains("Win") {
            ("Google Inc.", "ANGLE (Intel(R) HD Graphics Direct3D11 vs_5_0 ps_5_0)")
        } else if base.platform.contains("Mac") {
            ("Apple Inc.", "Apple GPU")
        } else {
            ("Mesa", "Mesa DRI Intel(R) HD Graphics 620 (Kaby Lake GT2)")
        };

        let complete = CompleteFingerprint {
            name: base.name.clone(),
            user_agent: base.user_agent.clone(),
            accept_language: base.accept_language.clone(),
            platform: base.platform.clone(),
            viewport,
            headers,
            plugins,
            fonts,
            timezone: TIMEZONES[rng.gen_range(0..TIMEZONES.len())].to_string(),
            webgl_vendor: webgl_vendor.to_string(),
            webgl_renderer: webgl_renderer.to_string(),
            has_touch: mobile,
            color_depth: 24,
            hardware_concurrency: rng.gen_range(2..=16),
        };

        debug!("Generated fingerprint: {}", complete.name);
        complete
    }
}

#[async_trait]
impl FingerprintGenerator for FingerprintManager {
    /// Uses the task's pinned fingerprint when it names one, else a random one.
    async fn generate(&self, task: &Task) -> Result<CompleteFingerprint> {
        match &task.fingerprint_id {
            Some(name) => self.get_fingerprint(name),
            None => self.random_fingerprint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TaskType;

    fn base(name: &str, user_agent: &str, platform: &str) -> BrowserFingerprint {
        BrowserFingerprint {
            name: name.to_string(),
            user_agent: user_agent.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: platform.to_string(),
            extra_headers: HashMap::from([("DNT".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn test_mobile_fingerprint_gets_mobile_viewport() {
        let manager = FingerprintManager::new(vec![base(
            "iphone",
            "Mozilla/5.0 (iPhone) Mobile Safari",
            "iPhone",
        )]);
        let fp = manager.get_fingerprint("iphone").unwrap();
        assert!(fp.has_touch);
        assert!(fp.viewport.width < 480);
        assert_eq!(fp.headers.get("DNT").map(String::as_str), Some("1"));
        assert!(fp.plugins.is_empty());
    }

    #[test]
    fn test_unknown_or_empty_fingerprints_fail() {
        let manager = FingerprintManager::new(Vec::new());
        assert!(manager.random_fingerprint().is_err());
        assert!(manager.get_fingerprint("nope").is_err());
    }

    #[tokio::test]
    async fn test_generate_honors_pinned_fingerprint() {
        let manager = FingerprintManager::new(vec![
            base("win", "Mozilla/5.0 Chrome/120.0", "Win32"),
            base("mac", "Mozilla/5.0 Firefox/121.0", "MacIntel"),
        ]);
        let mut task = Task::new("https://example.com/", TaskType::Visit).unwrap();
        task.fingerprint_id = Some("mac".to_string());

        let fp = manager.generate(&task).await.unwrap();
        assert_eq!(fp.name, "mac");
        assert_eq!(fp.webgl_vendor, "Apple Inc.");
        assert_eq!(fp.plugins.len(), 2);
    }
}
