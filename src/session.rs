use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::document::{Document, SelectorPath};
use crate::formats::RenderOptions;

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(60);

/// The document could not be obtained at all. Fatal for one URL only.
#[derive(Debug, thiserror::Error)]
#[error("render {url}: {message}")]
pub struct RenderError {
    pub url: String,
    pub message: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, url: &Url, options: &RenderOptions) -> anyhow::Result<String>;
}

/// Plain GET; sees only server-rendered markup.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build page http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn render(&self, url: &Url, options: &RenderOptions) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &options.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: status {status}");
        }
        response.text().await.context("read page body")
    }
}

/// Headless Chromium with `--dump-dom`. Scripts get a virtual time budget
/// covering the configured wait and, with `lazy_scroll`, every scroll pause.
#[derive(Debug, Clone)]
pub struct BrowserRenderer {
    program: PathBuf,
}

impl BrowserRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn virtual_time_budget_ms(options: &RenderOptions) -> u64 {
    let mut secs = options.wait_time;
    if options.lazy_scroll {
        secs = secs.saturating_add(u64::from(options.max_scrolls).saturating_mul(options.scroll_pause));
    }
    secs.saturating_mul(1000)
}

fn browser_args(url: &Url, options: &RenderOptions) -> Vec<String> {
    vec![
        "--headless=new".to_owned(),
        "--disable-gpu".to_owned(),
        "--no-sandbox".to_owned(),
        "--hide-scrollbars".to_owned(),
        "--window-size=1920,1080".to_owned(),
        format!("--user-agent={}", options.user_agent),
        format!("--virtual-time-budget={}", virtual_time_budget_ms(options)),
        "--dump-dom".to_owned(),
        url.to_string(),
    ]
}

#[async_trait]
impl Renderer for BrowserRenderer {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn render(&self, url: &Url, options: &RenderOptions) -> anyhow::Result<String> {
        let program = self.program.display().to_string();
        let output = tokio::process::Command::new(&self.program)
            .args(browser_args(url, options))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn browser: {program}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("browser failed: {program} ({}): {}", output.status, stderr.trim());
        }
        String::from_utf8(output.stdout).context("browser output is not valid UTF-8")
    }
}

/// Acquires raw HTML for one URL, degrading to a plain fetch when the
/// primary renderer fails, times out or returns nothing.
pub struct Session {
    primary: Option<Arc<dyn Renderer>>,
    http: HttpRenderer,
    timeout: Duration,
}

impl Session {
    /// Plain HTTP only.
    pub fn http(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            primary: None,
            http: HttpRenderer::new(timeout)?,
            timeout,
        })
    }

    pub fn with_renderer(renderer: Arc<dyn Renderer>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            primary: Some(renderer),
            ..Self::http(timeout)?
        })
    }

    pub async fn acquire(&self, url: &Url, options: &RenderOptions) -> Result<String, RenderError> {
        if let Some(primary) = &self.primary {
            match self.bounded(primary.as_ref(), url, options).await {
                Ok(html) => {
                    log_readiness(url, &html, options);
                    return Ok(html);
                }
                Err(err) => tracing::warn!(
                    url = %url,
                    renderer = primary.name(),
                    "render failed; falling back to http: {err:#}"
                ),
            }
        }

        let html = self
            .bounded(&self.http, url, options)
            .await
            .map_err(|err| RenderError {
                url: url.to_string(),
                message: format!("{err:#}"),
            })?;
        log_readiness(url, &html, options);
        Ok(html)
    }

    async fn bounded(
        &self,
        renderer: &dyn Renderer,
        url: &Url,
        options: &RenderOptions,
    ) -> anyhow::Result<String> {
        let html = tokio::time::timeout(self.timeout, renderer.render(url, options))
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))??;
        if html.trim().is_empty() {
            anyhow::bail!("{} renderer returned an empty document", renderer.name());
        }
        Ok(html)
    }
}

/// A page that never shows its readiness selector is still processed.
fn log_readiness(url: &Url, html: &str, options: &RenderOptions) {
    let Some(ready) = options.page_ready.as_deref().filter(|p| !p.trim().is_empty()) else {
        return;
    };
    match SelectorPath::parse(ready) {
        Ok(path) if Document::parse(html).matches(&path) => {}
        Ok(_) => tracing::warn!(url = %url, selector = ready, "page-ready selector not found"),
        Err(err) => tracing::warn!(url = %url, "{err}"),
    }
}
