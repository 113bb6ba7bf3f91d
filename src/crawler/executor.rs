//! Running one attempt of a task against the browser collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::breaker::{CircuitBreakerManager, BROWSER_LAUNCH, PROXY_ACQUIRE};
use crate::browser::extract::extract_links;
use crate::browser::{
    BehaviorSimulator, BrowserEngine, BrowserPage, CaptchaSolver, ContextOptions, DataExtractor,
    FingerprintGenerator,
};
use crate::cli::config::ProxyConfig;
use crate::crawler::task::{FlowStep, PageOutcome, ResourceUsage, Task, TaskType};
use crate::error::{ErrorKind, ExecutionError};
use crate::proxy::{ProxyFilter, ProxyProvider, RotationStrategy};
use crate::storage::OutputWriter;

/// Per-attempt information handed to the executor
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub worker_id: usize,
    pub attempt: u32,
}

/// Strategy for executing a single attempt of a task.
///
/// Implementations do not enforce the task timeout or handle cancellation;
/// the worker pool wraps every call with both.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<PageOutcome, ExecutionError>;
}

/// Map a collaborator error to an error kind, looking through the chain for
/// transport failures.
pub fn classify(err: &anyhow::Error, fallback: ErrorKind) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() {
                return ErrorKind::Timeout;
            }
            if e.is_connect() || e.is_request() {
                return ErrorKind::Network;
            }
        }
    }
    fallback
}

fn execution_error(err: anyhow::Error, fallback: ErrorKind) -> ExecutionError {
    ExecutionError::new(classify(&err, fallback), format!("{:#}", err))
}

/// Executes tasks through the browser engine and the other collaborators.
/// Browser launches and proxy acquisition go through their circuit breakers.
pub struct BrowserExecutor {
    engine: Arc<dyn BrowserEngine>,
    fingerprints: Arc<dyn FingerprintGenerator>,
    captcha: Arc<dyn CaptchaSolver>,
    extractor: Arc<dyn DataExtractor>,
    behavior: Arc<dyn BehaviorSimulator>,
    proxies: Option<Arc<dyn ProxyProvider>>,
    output: Option<Arc<dyn OutputWriter>>,
    breakers: Arc<CircuitBreakerManager>,
    rotation: RotationStrategy,
}

impl BrowserExecutor {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        fingerprints: Arc<dyn FingerprintGenerator>,
        captcha: Arc<dyn CaptchaSolver>,
        extractor: Arc<dyn DataExtractor>,
        behavior: Arc<dyn BehaviorSimulator>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            engine,
            fingerprints,
            captcha,
            extractor,
            behavior,
            proxies: None,
            output: None,
            breakers,
            rotation: RotationStrategy::Session,
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<dyn ProxyProvider>, rotation: RotationStrategy) -> Self {
        self.proxies = Some(proxies);
        self.rotation = rotation;
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputWriter>) -> Self {
        self.output = Some(output);
        self
    }

    async fn acquire_proxy(&self, task: &Task) -> Result<Option<ProxyConfig>, ExecutionError> {
        let Some(proxies) = self.proxies.as_ref().filter(|_| task.config.use_proxy) else {
            return Ok(None);
        };

        let filter = ProxyFilter {
            country: task.metadata.get("proxy_country").and_then(Value::as_str).map(String::from),
            proxy_type: None,
        };
        let rotation = self.rotation;
        self.breakers
            .get(PROXY_ACQUIRE)
            .call(|| proxies.get_proxy(rotation, filter))
            .await
            .map_err(|e| e.into_execution(ErrorKind::Proxy))
    }

    async fn open_page(&self, options: ContextOptions) -> Result<Box<dyn BrowserPage>, ExecutionError> {
        let engine = &self.engine;
        self.breakers
            .get(BROWSER_LAUNCH)
            .call(|| async move {
                if !engine.is_running().await {
                    engine.launch().await?;
                }
                engine.new_context(options).await
            })
            .await
            .map_err(|e| e.into_execution(ErrorKind::Browser))
    }

    /// Everything that happens on an open page.
    async fn drive(&self, task: &Task, page: &dyn BrowserPage) -> Result<PageOutcome, ExecutionError> {
        page.navigate(&task.url)
            .await
            .map_err(|e| execution_error(e, ErrorKind::Network))?;
        let mut requests = 1;

        let content = page
            .content()
            .await
            .map_err(|e| execution_error(e, ErrorKind::Browser))?;

        let captcha = if task.config.solve_captcha {
            self.captcha
                .detect_and_solve(&task.url, &content)
                .await
                .map_err(|e| execution_error(e, ErrorKind::Captcha))?
        } else {
            Default::default()
        };
        if captcha.bot_detected {
            return Err(ExecutionError::new(
                ErrorKind::BotDetected,
                format!("Bot wall on {}", task.url),
            ));
        }
        if captcha.detected && !captcha.solved {
            return Err(ExecutionError::new(
                ErrorKind::Captcha,
                format!("Unsolved CAPTCHA on {}", task.url),
            ));
        }

        if task.config.simulate_behavior {
            self.behavior
                .scroll(page)
                .await
                .map_err(|e| execution_error(e, ErrorKind::Browser))?;
            self.behavior
                .dwell(page)
                .await
                .map_err(|e| execution_error(e, ErrorKind::Browser))?;
        }

        let mut screenshot = None;
        let data = match task.task_type {
            TaskType::Visit => json!({ "links": extract_links(&content, &task.url) }),
            TaskType::Scrape => self
                .extractor
                .extract(&content, &task.config.selectors)
                .await
                .map_err(|e| execution_error(e, ErrorKind::Extraction))?,
            TaskType::Click => {
                let selector = task.config.click_selector.as_deref().ok_or_else(|| {
                    ExecutionError::fatal(ErrorKind::Internal, "Click task without click_selector")
                })?;
                self.click(task, page, selector).await?;
                requests += 1;
                json!({ "clicked": selector })
            }
            TaskType::Screenshot => {
                screenshot = Some(self.capture(page).await?);
                Value::Null
            }
            TaskType::Custom => {
                let script = task.config.script.as_deref().ok_or_else(|| {
                    ExecutionError::fatal(ErrorKind::Internal, "Custom task without script")
                })?;
                requests += 1;
                page.evaluate(script)
                    .await
                    .map_err(|e| execution_error(e, ErrorKind::Browser))?
            }
            TaskType::RecordedFlow => {
                let (data, shot, flow_requests) = self.replay(task, page).await?;
                screenshot = shot.or(screenshot);
                requests += flow_requests;
                data
            }
        };

        if screenshot.is_none() && task.config.take_screenshot {
            screenshot = Some(self.capture(page).await?);
        }

        let screenshot_path = match (screenshot, &self.output) {
            (Some(png), Some(output)) => Some(
                output
                    .write_screenshot(task, &png)
                    .await
                    .map_err(|e| execution_error(e, ErrorKind::Output))?,
            ),
            (Some(_), None) => {
                debug!("Screenshot for task {} discarded, no output configured", task.id);
                None
            }
            _ => None,
        };

        let final_content = page.content().await.unwrap_or(content);
        Ok(PageOutcome {
            final_url: page.url().await.ok(),
            status_code: page.status_code().await,
            title: page.title().await.ok(),
            data,
            screenshot_path,
            resources: ResourceUsage {
                bytes_received: final_content.len() as u64,
                requests,
            },
            captcha_detected: captcha.detected,
            bot_detected: captcha.bot_detected,
            proxy_id: None,
            fingerprint_id: None,
        })
    }

    async fn click(&self, task: &Task, page: &dyn BrowserPage, selector: &str) -> Result<(), ExecutionError> {
        let clicked = if task.config.simulate_behavior {
            self.behavior.click(page, selector).await
        } else {
            page.click(selector).await
        };
        clicked.map_err(|e| execution_error(e, ErrorKind::Browser))
    }

    async fn capture(&self, page: &dyn BrowserPage) -> Result<Vec<u8>, ExecutionError> {
        page.screenshot()
            .await
            .map_err(|e| execution_error(e, ErrorKind::Browser))
    }

    /// Replay a recorded flow, collecting extracted values by name.
    async fn replay(
        &self,
        task: &Task,
        page: &dyn BrowserPage,
    ) -> Result<(Value, Option<Vec<u8>>, u32), ExecutionError> {
        let mut data = Map::new();
        let mut screenshot = None;
        let mut requests = 0;

        for (index, step) in task.config.flow.iter().enumerate() {
            debug!("Task {} flow step {}: {:?}", task.id, index, step);
            let browser_err = |e: anyhow::Error| execution_error(e, ErrorKind::Browser);
            match step {
                FlowStep::Navigate { url } => {
                    page.navigate(url)
                        .await
                        .map_err(|e| execution_error(e, ErrorKind::Network))?;
                    requests += 1;
                }
                FlowStep::Click { selector } => {
                    self.click(task, page, selector).await?;
                    requests += 1;
                }
                FlowStep::Type { selector, text } => {
                    let typed = if task.config.simulate_behavior {
                        self.behavior.type_text(page, selector, text).await
                    } else {
                        page.type_text(selector, text).await
                    };
                    typed.map_err(browser_err)?;
                }
                FlowStep::Scroll { distance } => page.scroll(*distance).await.map_err(browser_err)?,
                FlowStep::Wait { millis } => tokio::time::sleep(Duration::from_millis(*millis)).await,
                FlowStep::Screenshot => screenshot = Some(self.capture(page).await?),
                FlowStep::Extract { name, selector } => {
                    let html = page.content().await.map_err(browser_err)?;
                    let selectors = HashMap::from([(name.clone(), selector.clone())]);
                    let mut extracted = self
                        .extractor
                        .extract(&html, &selectors)
                        .await
                        .map_err(|e| execution_error(e, ErrorKind::Extraction))?;
                    let value = extracted
                        .as_object_mut()
                        .and_then(|map| map.remove(name))
                        .unwrap_or(Value::Null);
                    data.insert(name.clone(), value);
                }
                FlowStep::Evaluate { script } => {
                    let value = page.evaluate(script).await.map_err(browser_err)?;
                    data.insert(format!("step_{}", index), value);
                    requests += 1;
                }
            }
        }

        Ok((Value::Object(data), screenshot, requests))
    }
}

#[async_trait]
impl TaskExecutor for BrowserExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<PageOutcome, ExecutionError> {
        let started = Instant::now();
        let proxy = self.acquire_proxy(task).await?;
        let proxy_id = proxy.as_ref().map(|p| p.name.clone());

        let fingerprint = self
            .fingerprints
            .generate(task)
            .await
            .map_err(|e| execution_error(e, ErrorKind::Browser))?;
        let fingerprint_id = fingerprint.name.clone();

        debug!(
            "Worker {} running task {} attempt {} (proxy: {:?}, fingerprint: {})",
            ctx.worker_id, task.id, ctx.attempt, proxy_id, fingerprint_id
        );

        let page = self
            .open_page(ContextOptions {
                fingerprint: Some(fingerprint),
                proxy,
            })
            .await?;

        let outcome = self.drive(task, page.as_ref()).await;

        if let Err(e) = page.close().await {
            warn!("Failed to close page for task {}: {:#}", task.id, e);
        }

        if let (Some(proxies), Some(id)) = (&self.proxies, &proxy_id) {
            match &outcome {
                Ok(_) => proxies.mark_success(id, started.elapsed()).await,
                Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::BotDetected) => {
                    proxies.mark_failure(id, &e.message).await
                }
                Err(_) => {}
            }
        }

        outcome.map(|mut outcome| {
            outcome.proxy_id = proxy_id;
            outcome.fingerprint_id = Some(fingerprint_id);
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{
        CaptchaOutcome, FingerprintManager, HtmlExtractor, HumanBehavior, MarkerCaptchaDetector,
        MockBrowserEngine, MockBrowserPage, MockCaptchaSolver,
    };
    use crate::cli::config::{BrowserBehavior, BrowserSettings, CircuitBreakerSettings};
    use crate::proxy::MockProxyProvider;
    use crate::storage::output::MockOutputWriter;

    const HTML: &str = r#"<html><body><h1>Hello</h1><a href="/about">About</a></body></html>"#;

    fn page_with(html: &'static str) -> MockBrowserPage {
        let mut page = MockBrowserPage::new();
        page.expect_navigate().returning(|_| Ok(()));
        page.expect_content().returning(move || Ok(html.to_string()));
        page.expect_url().returning(|| Ok("https://example.com/".to_string()));
        page.expect_title().returning(|| Ok("Example".to_string()));
        page.expect_status_code().returning(|| Some(200));
        page.expect_close().times(1).returning(|| Ok(()));
        page
    }

    fn engine_with<F>(make_page: F) -> MockBrowserEngine
    where
        F: Fn() -> MockBrowserPage + Send + 'static,
    {
        let mut engine = MockBrowserEngine::new();
        engine.expect_is_running().returning(|| true);
        engine
            .expect_new_context()
            .returning(move |_| Ok(Box::new(make_page()) as Box<dyn BrowserPage>));
        engine
    }

    fn breakers(failure_threshold: u32) -> Arc<CircuitBreakerManager> {
        Arc::new(CircuitBreakerManager::new(
            CircuitBreakerSettings {
                failure_threshold,
                ..Default::default()
            },
            None,
        ))
    }

    fn executor(engine: MockBrowserEngine, captcha: Arc<dyn CaptchaSolver>) -> BrowserExecutor {
        BrowserExecutor::new(
            Arc::new(engine),
            Arc::new(FingerprintManager::new(BrowserSettings::default().fingerprints)),
            captcha,
            Arc::new(HtmlExtractor::new()),
            Arc::new(HumanBehavior::new(BrowserBehavior::default())),
            breakers(2),
        )
    }

    fn detector() -> Arc<dyn CaptchaSolver> {
        Arc::new(MarkerCaptchaDetector::new().unwrap())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            worker_id: 0,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_visit_collects_links_and_page_facts() {
        let exec = executor(engine_with(|| page_with(HTML)), detector());
        let task = Task::new("https://example.com/", TaskType::Visit).unwrap();

        let outcome = exec.execute(&task, &ctx()).await.unwrap();
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(outcome.title.as_deref(), Some("Example"));
        assert_eq!(outcome.data["links"], json!(["https://example.com/about"]));
        assert_eq!(outcome.fingerprint_id.as_deref(), Some("windows_chrome"));
        assert!(outcome.resources.bytes_received > 0);
    }

    #[tokio::test]
    async fn test_scrape_uses_selectors() {
        let exec = executor(engine_with(|| page_with(HTML)), detector());
        let mut task = Task::new("https://example.com/", TaskType::Scrape).unwrap();
        task.config.selectors = HashMap::from([("heading".to_string(), "h1".to_string())]);

        let outcome = exec.execute(&task, &ctx()).await.unwrap();
        assert_eq!(outcome.data, json!({"heading": "Hello"}));
    }

    #[tokio::test]
    async fn test_unsolved_captcha_fails_attempt() {
        let mut captcha = MockCaptchaSolver::new();
        captcha.expect_detect_and_solve().returning(|_, _| {
            Ok(CaptchaOutcome {
                detected: true,
                solved: false,
                bot_detected: false,
            })
        });
        let exec = executor(engine_with(|| page_with(HTML)), Arc::new(captcha));
        let task = Task::new("https://example.com/", TaskType::Visit).unwrap();

        let err = exec.execute(&task, &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Captcha);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_click_without_selector_is_fatal() {
        let exec = executor(engine_with(|| page_with(HTML)), detector());
        let task = Task::new("https://example.com/", TaskType::Click).unwrap();

        let err = exec.execute(&task, &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_launch_failures_open_browser_circuit() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_is_running().returning(|| false);
        engine
            .expect_launch()
            .times(2)
            .returning(|| Err(anyhow::anyhow!("chrome crashed")));
        let exec = executor(engine, detector());
        let task = Task::new("https://example.com/", TaskType::Visit).unwrap();

        for _ in 0..2 {
            let err = exec.execute(&task, &ctx()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Browser);
        }
        let err = exec.execute(&task, &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert!(err.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_proxy_outcome_is_reported() {
        let mut proxies = MockProxyProvider::new();
        proxies.expect_get_proxy().returning(|_, _| {
            Ok(Some(ProxyConfig {
                name: "p1".to_string(),
                proxy_type: "http".to_string(),
                address: "127.0.0.1".to_string(),
                port: Some(3128),
                username: None,
                password: None,
                country: None,
            }))
        });
        proxies
            .expect_mark_success()
            .withf(|id, _| id == "p1")
            .times(1)
            .returning(|_, _| ());

        let mut output = MockOutputWriter::new();
        output
            .expect_write_screenshot()
            .times(1)
            .returning(|_, _| Ok("/tmp/shot.png".to_string()));

        let exec = executor(
            engine_with(|| {
                let mut page = page_with(HTML);
                page.expect_screenshot().returning(|| Ok(vec![1, 2, 3]));
                page
            }),
            detector(),
        )
        .with_proxies(Arc::new(proxies), RotationStrategy::PerRequest)
        .with_output(Arc::new(output));

        let task = Task::new("https://example.com/", TaskType::Screenshot).unwrap();
        let outcome = exec.execute(&task, &ctx()).await.unwrap();
        assert_eq!(outcome.proxy_id.as_deref(), Some("p1"));
        assert_eq!(outcome.screenshot_path.as_deref(), Some("/tmp/shot.png"));
    }

    #[tokio::test]
    async fn test_recorded_flow_collects_named_values() {
        let exec = executor(
            engine_with(|| {
                let mut page = page_with(HTML);
                page.expect_type_text().times(1).returning(|_, _| Ok(()));
                page.expect_evaluate().returning(|_| Ok(json!(7)));
                page
            }),
            detector(),
        );
        let mut task = Task::new("https://example.com/", TaskType::RecordedFlow).unwrap();
        task.config.flow = vec![
            FlowStep::Type {
                selector: "#q".to_string(),
                text: "rust".to_string(),
            },
            FlowStep::Extract {
                name: "heading".to_string(),
                selector: "h1".to_string(),
            },
            FlowStep::Evaluate {
                script: "3 + 4".to_string(),
            },
        ];

        let outcome = exec.execute(&task, &ctx()).await.unwrap();
        assert_eq!(outcome.data, json!({"heading": "Hello", "step_2": 7}));
    }
}
