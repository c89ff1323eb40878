use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::assemble::{Record, RecordAssembler};
use crate::cli::{
    AssetArgs, CheckArgs, ExtractArgs, FallbackArgs, HarvestArgs, LlmEngine, Mode, RendererKind,
};
use crate::config_store::ConfigStore;
use crate::crawl::{looks_like_detail, scan_listing};
use crate::fallback::{FallbackExtractor, NoopFallback, OpenAiFallback};
use crate::formats::SiteConfig;
use crate::media::{LocalAssetStore, MediaFieldResolver};
use crate::openai::ResponsesClient;
use crate::session::{BrowserRenderer, Session};

/// Drives one run: start page, optional listing pagination, one record per detail page.
pub struct Harvester {
    session: Session,
    assembler: RecordAssembler,
    max_pages: usize,
}

impl Harvester {
    pub fn new(session: Session, assembler: RecordAssembler) -> Self {
        Self {
            session,
            assembler,
            max_pages: 50,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn harvest(
        &self,
        start: &Url,
        config: &SiteConfig,
        mode: Mode,
    ) -> anyhow::Result<Vec<Record>> {
        let start_html = self
            .session
            .acquire(start, &config.render)
            .await
            .context("render start url")?;

        let is_detail = match mode {
            Mode::Detail => true,
            Mode::List => false,
            Mode::Auto => looks_like_detail(&start_html, config),
        };
        if is_detail {
            tracing::info!(url = %start, "start url is a detail page");
            let record = self.assembler.assemble(&start_html, config, start).await;
            return Ok(vec![record]);
        }

        let mut records = Vec::new();
        let mut visited: HashSet<Url> = HashSet::new();
        let mut previous_first: Option<Url> = None;
        let mut page_url = start.clone();
        let mut html = start_html;

        for page in 1..=self.max_pages {
            let listing = scan_listing(&html, config, &page_url)
                .with_context(|| format!("scan listing page: {page_url}"))?;
            if listing.links.is_empty() {
                if page == 1 {
                    tracing::warn!(url = %page_url, "start page has no listing links");
                }
                break;
            }
            if previous_first.as_ref() == listing.first_link() {
                tracing::info!(url = %page_url, page, "listing page repeats the previous one; stopping");
                break;
            }
            previous_first = listing.first_link().cloned();
            tracing::info!(url = %page_url, page, links = listing.links.len(), "listing page");

            for link in &listing.links {
                if !visited.insert(link.clone()) {
                    continue;
                }
                match self.session.acquire(link, &config.render).await {
                    Ok(detail) => records.push(self.assembler.assemble(&detail, config, link).await),
                    Err(err) => tracing::error!(url = %link, "skipping listing: {err}"),
                }
            }

            let Some(next) = listing.next else {
                break;
            };
            if page == self.max_pages {
                tracing::info!(max_pages = self.max_pages, "page limit reached");
                break;
            }
            match self.session.acquire(&next, &config.render).await {
                Ok(next_html) => {
                    html = next_html;
                    page_url = next;
                }
                Err(err) => {
                    tracing::error!(url = %next, "stopping pagination: {err}");
                    break;
                }
            }
        }

        Ok(records)
    }
}

pub async fn run(args: HarvestArgs) -> anyhow::Result<()> {
    let start = parse_http_url(&args.url).context("parse --url")?;
    let store = ConfigStore::load(Path::new(&args.configs)).context("load site configs")?;
    let config = store
        .lookup(&start)
        .ok_or_else(|| anyhow::anyhow!("no site config matches {start}"))?;

    let out = match &args.out {
        Some(out) => PathBuf::from(out),
        None => crate::export::default_output_path(args.format),
    };
    if out.exists() && !args.force {
        anyhow::bail!("export output already exists: {}", out.display());
    }

    let render_timeout = Duration::from_secs(args.render_timeout_secs);
    let session = match args.renderer {
        RendererKind::Http => Session::http(render_timeout)?,
        RendererKind::Browser => Session::with_renderer(
            Arc::new(BrowserRenderer::new(&args.browser_bin)),
            render_timeout,
        )?,
    };
    let assembler = build_assembler(&args.assets, &args.fallback, config).await?;

    tracing::info!(
        url = %start,
        website = %config.website,
        mode = ?args.mode,
        renderer = ?args.renderer,
        engine = ?args.fallback.engine,
        format = ?args.format,
        "harvest"
    );
    let records = Harvester::new(session, assembler)
        .with_max_pages(args.max_pages)
        .harvest(&start, config, args.mode)
        .await?;

    let summary = crate::export::write_records(&records, config, &out, args.format, args.force)
        .context("export records")?;
    let errors = summary.errors.iter().map(|(_, count)| count).sum::<usize>();
    println!("{} ({} records, {errors} ERROR cells)", out.display(), summary.rows);
    Ok(())
}

pub async fn extract(args: ExtractArgs) -> anyhow::Result<()> {
    let url = parse_http_url(&args.url).context("parse --url")?;
    let store = ConfigStore::load(Path::new(&args.configs)).context("load site configs")?;
    let config = store
        .lookup(&url)
        .ok_or_else(|| anyhow::anyhow!("no site config matches {url}"))?;
    let html = tokio::fs::read_to_string(&args.html)
        .await
        .with_context(|| format!("read html: {}", args.html))?;

    let assembler = build_assembler(&args.assets, &args.fallback, config).await?;
    let record = assembler.assemble(&html, config, &url).await;

    let json = serde_json::to_string_pretty(&record).context("serialize record")?;
    println!("{json}");
    Ok(())
}

pub fn check(args: CheckArgs) -> anyhow::Result<()> {
    let store = ConfigStore::load(Path::new(&args.configs)).context("load site configs")?;

    let mut total = 0usize;
    for config in store.configs() {
        let problems = crate::config_store::problems(config);
        for problem in &problems {
            println!("{}: {problem}", config.website);
        }
        total += problems.len();
    }

    if total > 0 {
        anyhow::bail!("{total} problem(s) found");
    }
    println!("ok ({} site configs)", store.configs().len());
    Ok(())
}

async fn build_assembler(
    assets: &AssetArgs,
    fallback: &FallbackArgs,
    config: &SiteConfig,
) -> anyhow::Result<RecordAssembler> {
    let store = LocalAssetStore::new(&assets.assets, &config.render.user_agent)?;
    store
        .prepare(assets.clean_assets)
        .await
        .context("prepare asset dir")?;
    tracing::debug!(dir = %store.dir().display(), clean = assets.clean_assets, "asset dir ready");
    let media = MediaFieldResolver::new(Arc::new(store)).with_concurrency(assets.asset_concurrency);

    let llm_timeout = Duration::from_secs(fallback.llm_timeout_secs);
    let engine: Arc<dyn FallbackExtractor> = match fallback.engine {
        LlmEngine::Noop => Arc::new(NoopFallback),
        LlmEngine::Openai => {
            let client =
                ResponsesClient::from_env(&fallback.openai_base_url, &fallback.openai_model, llm_timeout)?;
            Arc::new(OpenAiFallback::new(client))
        }
    };

    Ok(RecordAssembler::new(media, engine)
        .with_policy(fallback.fallback)
        .with_fallback_timeout(llm_timeout))
}

fn parse_http_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http/https: {url}");
    }
    Ok(url)
}
