use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::RegexSet;
use tracing::debug;

use super::{CaptchaOutcome, CaptchaSolver};

/// Markers of interactive challenges a solver could in principle handle
const CHALLENGE_MARKERS: &[&str] = &[
    r"(?i)g-recaptcha",
    r"(?i)hcaptcha\.com",
    r"(?i)cf-turnstile",
    r"(?i)class=.captcha",
    r"(?i)please (complete|solve) the (security check|captcha)",
];

/// Markers of outright bot walls
const BOT_WALL_MARKERS: &[&str] = &[
    r"(?i)access denied",
    r"(?i)are you a (robot|human)",
    r"(?i)unusual traffic from your (computer|network)",
    r"(?i)cf-browser-verification",
    r"(?i)request blocked",
];

/// Detects CAPTCHA and bot-wall pages from their markup. It never solves
/// anything, so a detected challenge always fails the attempt.
pub struct MarkerCaptchaDetector {
    challenges: RegexSet,
    bot_walls: RegexSet,
}

impl MarkerCaptchaDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            challenges: RegexSet::new(CHALLENGE_MARKERS).context("Invalid challenge marker")?,
            bot_walls: RegexSet::new(BOT_WALL_MARKERS).context("Invalid bot wall marker")?,
        })
    }

    pub fn inspect(&self, content: &str) -> CaptchaOutcome {
        CaptchaOutcome {
            detected: self.challenges.is_match(content),
            solved: false,
            bot_detected: self.bot_walls.is_match(content),
        }
    }
}

#[async_trait]
impl CaptchaSolver for MarkerCaptchaDetector {
    async fn detect_and_solve(&self, url: &str, content: &str) -> Result<CaptchaOutcome> {
        let outcome = self.inspect(content);
        if outcome.detected || outcome.bot_detected {
            debug!(
                "Challenge markers on {} (captcha: {}, bot wall: {})",
                url, outcome.detected, outcome.bot_detected
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_recaptcha_widget() {
        let detector = MarkerCaptchaDetector::new().unwrap();
        let outcome = detector
            .detect_and_solve(
                "https://example.com",
                r#"<div class="g-recaptcha" data-sitekey="x"></div>"#,
            )
            .await
            .unwrap();
        assert!(outcome.detected);
        assert!(!outcome.solved);
        assert!(!outcome.bot_detected);
    }

    #[test]
    fn test_detects_bot_wall() {
        let detector = MarkerCaptchaDetector::new().unwrap();
        let outcome = detector.inspect("<h1>Access Denied</h1><p>Request blocked.</p>");
        assert!(outcome.bot_detected);
        assert!(!outcome.detected);
    }

    #[test]
    fn test_plain_page_is_clean() {
        let detector = MarkerCaptchaDetector::new().unwrap();
        assert_eq!(
            detector.inspect("<html><body><h1>Welcome</h1></body></html>"),
            CaptchaOutcome::default()
        );
    }
}
