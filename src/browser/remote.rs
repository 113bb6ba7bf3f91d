use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use super::{BrowserEngine, BrowserPage, ContextOptions};
use crate::cli::config::{BrowserBehavior, BrowserSettings, ProxyConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub session_id: String,
    pub url: String,
    pub browser_type: String,
    pub headless: bool,
    pub fingerprint: Value,
    pub behavior: Value,
    pub proxy: Option<ProxyConfig>,
    pub take_screenshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Interaction sent to an open session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionAction {
    Click { selector: String },
    Type { selector: String, text: String },
    Scroll { distance: i32 },
    Evaluate { script: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    /// Page state after the action, when it changed
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client of the external browser service. Each context is a service-side
/// session keyed by an id generated here.
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
    browser_type: String,
    headless: bool,
    behavior: BrowserBehavior,
    running: Arc<AtomicBool>,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.service_url.trim_end_matches('/').to_string(),
            browser_type: settings.browser_type.clone(),
            headless: settings.headless,
            behavior: settings.behavior.clone(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BrowserEngine for RemoteBrowserService {
    async fn launch(&self) -> Result<()> {
        self.health_check().await?;
        self.running.store(true, Ordering::SeqCst);
        debug!("Browser service ready at {}", self.base_url);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .context("Failed to reach browser service")?;

        if !response.status().is_success() {
            self.running.store(false, Ordering::SeqCst);
            anyhow::bail!("Browser service unhealthy: {}", response.status());
        }
        Ok(())
    }

    async fn new_context(&self, options: ContextOptions) -> Result<Box<dyn BrowserPage>> {
        if !self.is_running().await {
            anyhow::bail!("Browser service has not been launched");
        }

        let fingerprint = match &options.fingerprint {
            Some(fp) => serde_json::to_value(fp).context("Failed to serialize fingerprint")?,
            None => Value::Null,
        };
        let behavior =
            serde_json::to_value(&self.behavior).context("Failed to serialize behavior")?;

        Ok(Box::new(RemotePage {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_id: Uuid::new_v4().to_string(),
            browser_type: self.browser_type.clone(),
            headless: self.headless,
            fingerprint,
            behavior,
            proxy: options.proxy,
            state: Mutex::new(PageState::default()),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        debug!("Browser service released");
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct PageState {
    url: Option<String>,
    title: String,
    content: String,
    status_code: Option<u16>,
}

/// Page backed by a browser service session
pub struct RemotePage {
    client: Client,
    base_url: String,
    session_id: String,
    browser_type: String,
    headless: bool,
    fingerprint: Value,
    behavior: Value,
    proxy: Option<ProxyConfig>,
    state: Mutex<PageState>,
}

impl RemotePage {
    fn snapshot(&self) -> PageState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut PageState)) {
        f(&mut self.state.lock().unwrap_or_else(|p| p.into_inner()));
    }

    async fn act(&self, action: SessionAction) -> Result<Value> {
        let endpoint = format!("{}/session/{}/action", self.base_url, self.session_id);
        let response = self
            .client
            .post(&endpoint)
            .json(&action)
            .send()
            .await
            .context("Failed to send action to browser service")?
            .json::<ActionResponse>()
            .await
            .context("Failed to parse browser service action response")?;

        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            error!("Browser action {:?} failed: {}", action, message);
            anyhow::bail!("Browser action failed: {}", message);
        }

        self.update(|state| {
            if let Some(url) = response.url {
                state.url = Some(url);
            }
            if let Some(title) = response.title {
                state.title = title;
            }
            if let Some(content) = response.content {
                state.content = content;
            }
        });
        Ok(response.result)
    }
}

#[async_trait]
impl BrowserPage for RemotePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let request = BrowserServiceRequest {
            session_id: self.session_id.clone(),
            url: url.to_string(),
            browser_type: self.browser_type.clone(),
            headless: self.headless,
            fingerprint: self.fingerprint.clone(),
            behavior: self.behavior.clone(),
            proxy: self.proxy.clone(),
            take_screenshot: false,
        };

        debug!("Sending request to browser service: {}", url);

        let response = self
            .client
            .post(format!("{}/crawl", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to send request to browser service")?
            .json::<BrowserServiceResponse>()
            .await
            .context("Failed to parse browser service response")?;

        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| "crawl failed with unknown error".to_string());
            error!("Browser service error for {}: {}", url, message);
            anyhow::bail!("Browser service error: {}", message);
        }

        self.update(|state| {
            state.url = Some(response.url);
            state.title = response.title;
            state.content = response.content;
            state.status_code = response.status_code;
        });
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.act(SessionAction::Click {
            selector: selector.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.act(SessionAction::Type {
            selector: selector.to_string(),
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn scroll(&self, distance: i32) -> Result<()> {
        self.act(SessionAction::Scroll { distance }).await.map(|_| ())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/session/{}/screenshot", self.base_url, self.session_id))
            .send()
            .await
            .context("Failed to request screenshot")?;
        if !response.status().is_success() {
            anyhow::bail!("Screenshot failed: {}", response.status());
        }
        Ok(response
            .bytes()
            .await
            .context("Failed to read screenshot")?
            .to_vec())
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        self.act(SessionAction::Evaluate {
            script: script.to_string(),
        })
        .await
    }

    async fn content(&self) -> Result<String> {
        Ok(self.snapshot().content)
    }

    async fn title(&self) -> Result<String> {
        Ok(self.snapshot().title)
    }

    async fn url(&self) -> Result<String> {
        self.snapshot().url.context("Page has not navigated yet")
    }

    async fn status_code(&self) -> Option<u16> {
        self.snapshot().status_code
    }

    async fn close(&self) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/session/{}", self.base_url, self.session_id))
            .send()
            .await
            .context("Failed to close browser session")?;
        // The service forgets idle sessions on its own
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Closing session failed: {}", response.status());
        }
        debug!("Browser session {} closed", self.session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(url: &str) -> BrowserSettings {
        BrowserSettings {
            service_url: url.to_string(),
            request_timeout_secs: 5,
            ..Default::default()
        }
    }

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_new_context_requires_launch() {
        let server = healthy_server().await;
        let service = RemoteBrowserService::new(&settings(&server.uri())).unwrap();
        assert!(service.new_context(ContextOptions::default()).await.is_err());

        service.launch().await.unwrap();
        assert!(service.is_running().await);
        assert!(service.new_context(ContextOptions::default()).await.is_ok());

        service.close().await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_launch_fails_when_service_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let service = RemoteBrowserService::new(&settings(&server.uri())).unwrap();
        assert!(service.launch().await.is_err());
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_navigate_caches_page_state() {
        let server = healthy_server().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .and(body_partial_json(json!({"url": "https://example.com/"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "url": "https://example.com/landing",
                "title": "Landing",
                "content": "<html>hi</html>",
                "links": [],
                "status_code": 200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = RemoteBrowserService::new(&settings(&server.uri())).unwrap();
        service.launch().await.unwrap();
        let page = service.new_context(ContextOptions::default()).await.unwrap();

        page.navigate("https://example.com/").await.unwrap();
        assert_eq!(page.url().await.unwrap(), "https://example.com/landing");
        assert_eq!(page.title().await.unwrap(), "Landing");
        assert_eq!(page.content().await.unwrap(), "<html>hi</html>");
        assert_eq!(page.status_code().await, Some(200));
    }

    #[tokio::test]
    async fn test_service_error_is_reported() {
        let server = healthy_server().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "url": "https://example.com/",
                "error": "net::ERR_NAME_NOT_RESOLVED"
            })))
            .mount(&server)
            .await;

        let service = RemoteBrowserService::new(&settings(&server.uri())).unwrap();
        service.launch().await.unwrap();
        let page = service.new_context(ContextOptions::default()).await.unwrap();

        let err = page.navigate("https://example.com/").await.unwrap_err();
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
        assert!(page.url().await.is_err());
    }

    #[tokio::test]
    async fn test_actions_screenshot_and_close() {
        let server = healthy_server().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/session/[^/]+/action$"))
            .and(body_partial_json(json!({"action": "evaluate"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"answer": 42}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/session/[^/]+/screenshot$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/session/[^/]+$"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let service = RemoteBrowserService::new(&settings(&server.uri())).unwrap();
        service.launch().await.unwrap();
        let page = service.new_context(ContextOptions::default()).await.unwrap();

        assert_eq!(page.evaluate("1 + 41").await.unwrap(), json!({"answer": 42}));
        assert_eq!(page.screenshot().await.unwrap(), vec![0x89, b'P', b'N', b'G']);
        page.close().await.unwrap();
    }
}
