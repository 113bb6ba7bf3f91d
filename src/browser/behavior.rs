use anyhow::Result;
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::{BehaviorSimulator, BrowserPage};
use crate::cli::config::BrowserBehavior;

/// Random value in `[min, max]`, tolerating an empty or inverted range.
/// The generator is dropped before the caller awaits anything.
fn pick(range: (u64, u64)) -> u64 {
    let (min, max) = range;
    if max <= min {
        return min;
    }
    thread_rng().gen_range(min..=max)
}

/// Human-like behavior simulator driving a `BrowserPage`
pub struct HumanBehavior {
    /// Configuration for behavior simulation
    config: BrowserBehavior,
}

impl HumanBehavior {
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Scroll chunks and the pause after each, decided up front
    fn scroll_plan(&self, distance: i32) -> Vec<(i32, u64)> {
        let mut rng = thread_rng();
        let mut plan = Vec::new();
        let mut scrolled = 0;
        while scrolled < distance {
            let chunk = rng.gen_range(100..300).min(distance - scrolled);
            scrolled += chunk;
            let pause_ms = match self.config.scroll_behavior.as_str() {
                "none" => 0,
                _ => rng.gen_range(300..800),
            };
            plan.push((chunk, pause_ms));
        }
        plan
    }
}

#[async_trait]
impl BehaviorSimulator for HumanBehavior {
    async fn click(&self, page: &dyn BrowserPage, selector: &str) -> Result<()> {
        // Reaction time before the click
        sleep(Duration::from_millis(pick(self.config.click_delay))).await;

        if self.config.mouse_movement {
            page.evaluate(&format!(
                "document.querySelector({:?})?.scrollIntoView({{block: 'center'}})",
                selector
            ))
            .await?;
            sleep(Duration::from_millis(pick((50, 150)))).await;
        }

        page.click(selector).await?;
        debug!("Clicked {}", selector);
        Ok(())
    }

    async fn type_text(&self, page: &dyn BrowserPage, selector: &str, text: &str) -> Result<()> {
        for c in text.chars() {
            page.type_text(selector, &c.to_string()).await?;
            sleep(Duration::from_millis(pick(self.config.typing_speed))).await;
        }
        debug!("Typed {} characters into {}", text.chars().count(), selector);
        Ok(())
    }

    async fn scroll(&self, page: &dyn BrowserPage) -> Result<()> {
        if self.config.scroll_behavior == "none" {
            return Ok(());
        }

        let distance = thread_rng().gen_range(100..800);
        for (chunk, pause_ms) in self.scroll_plan(distance) {
            page.scroll(chunk).await?;
            sleep(Duration::from_millis(pause_ms)).await;
        }
        debug!("Scrolled {} pixels", distance);
        Ok(())
    }

    async fn dwell(&self, _page: &dyn BrowserPage) -> Result<()> {
        let millis = pick(self.config.dwell_time);
        debug!("Dwelling for {}ms", millis);
        sleep(Duration::from_millis(millis)).await;
        Ok(())
    }
}
