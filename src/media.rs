use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use sha2::Digest as _;
use tokio::fs;
use url::Url;

use crate::document::Document;
use crate::formats::FieldRule;
use crate::resolve::{ExtractionOutcome, Unresolved, select_fragments};
use crate::transform::Transform;

pub const ASSET_SEPARATOR: &str = ";";
pub const ASSET_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ASSET_CONCURRENCY: usize = 4;

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn fetch(&self, url: &Url) -> anyhow::Result<Vec<u8>>;
    async fn save(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("store {name}: {message}")]
    Store { name: String, message: String },
}

/// Asset store backed by a caller-owned directory.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    dir: PathBuf,
    client: reqwest::Client,
}

impl LocalAssetStore {
    pub fn new(dir: impl Into<PathBuf>, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ASSET_FETCH_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .context("build asset http client")?;
        Ok(Self {
            dir: dir.into(),
            client,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the directory; with `clean`, removes files left by earlier runs.
    pub async fn prepare(&self, clean: bool) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create asset dir: {}", self.dir.display()))?;
        if !clean {
            return Ok(());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read asset dir: {}", self.dir.display()))?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await.context("read asset dir entry")? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            fs::remove_file(entry.path())
                .await
                .with_context(|| format!("remove asset: {}", entry.path().display()))?;
            removed += 1;
        }
        tracing::info!(dir = %self.dir.display(), removed, "cleared asset directory");
        Ok(())
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        fs::try_exists(self.dir.join(name))
            .await
            .with_context(|| format!("stat asset: {name}"))
    }

    async fn fetch(&self, url: &Url) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: status {status}");
        }
        let bytes = response.bytes().await.context("read asset body")?;
        Ok(bytes.to_vec())
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.dir.join(name);
        let tmp_path = self
            .dir
            .join(format!(".{name}.tmp.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("rename tmp to final: {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedAsset {
    pub remote_url: Url,
    pub local_name: String,
}

/// The correlated (remote urls, local names) pair. Both sides always share a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOutcome {
    pub urls: ExtractionOutcome,
    pub names: ExtractionOutcome,
}

impl MediaOutcome {
    pub fn unresolved(reason: Unresolved) -> Self {
        Self {
            urls: ExtractionOutcome::Unresolved(reason.clone()),
            names: ExtractionOutcome::Unresolved(reason),
        }
    }

    fn from_assets(assets: &[RetrievedAsset]) -> Self {
        if assets.is_empty() {
            return Self::unresolved(Unresolved::NoAssets);
        }
        let urls = assets
            .iter()
            .map(|asset| asset.remote_url.as_str())
            .collect::<Vec<_>>()
            .join(ASSET_SEPARATOR);
        let names = assets
            .iter()
            .map(|asset| asset.local_name.as_str())
            .collect::<Vec<_>>()
            .join(ASSET_SEPARATOR);
        Self {
            urls: ExtractionOutcome::Resolved(urls),
            names: ExtractionOutcome::Resolved(names),
        }
    }
}

/// Evaluates a media rule into absolute candidate URLs, in document order.
///
/// Each matched value is reduced to its first `srcset` candidate, passed
/// through the rule's transform and resolved against `page_url`.
pub fn media_candidates(
    document: &Document,
    rule: &FieldRule,
    page_url: &Url,
) -> Result<Vec<Url>, Unresolved> {
    let fragments = select_fragments(document, rule)?;
    let transform = match rule.transform.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(expr) => Some(Transform::parse(expr).map_err(Unresolved::Transform)?),
        None => None,
    };

    let mut candidates: Vec<Url> = Vec::new();
    for fragment in fragments {
        let Some(raw) = first_srcset_candidate(&fragment) else {
            continue;
        };
        let raw = match &transform {
            Some(transform) => match transform.apply(raw) {
                Ok(Some(value)) if !value.trim().is_empty() => value.trim().to_owned(),
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(
                        candidate = raw,
                        expr = %err.expr,
                        message = %err.message,
                        "media candidate transform failed; skipping"
                    );
                    continue;
                }
            },
            None => raw.to_owned(),
        };
        let url = match page_url.join(&raw) {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!(candidate = %raw, %err, "media candidate is not a url; skipping");
                continue;
            }
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }

    if candidates.is_empty() {
        return Err(Unresolved::Empty);
    }
    Ok(candidates)
}

/// Takes the first URL of a `srcset` value; plain URLs pass through.
pub fn first_srcset_candidate(value: &str) -> Option<&str> {
    let token = value.split_whitespace().next()?;
    let token = token.trim_end_matches(',');
    if token.is_empty() { None } else { Some(token) }
}

/// Local file name for a remote asset: a digest prefix of the full URL plus
/// the sanitized basename. Distinct URLs never share a name; the same URL
/// always maps to the same name.
pub fn local_asset_name(url: &Url) -> String {
    let digest = sha2::Sha256::digest(url.as_str().as_bytes());
    let prefix = hex::encode(&digest[..8]);
    let basename = url
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default();
    format!("{prefix}_{}", sanitize_file_name(basename))
}

fn sanitize_file_name(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "asset".to_owned()
    } else {
        cleaned.to_owned()
    }
}

#[derive(Clone)]
pub struct MediaFieldResolver {
    store: Arc<dyn AssetStore>,
    concurrency: usize,
}

impl MediaFieldResolver {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self {
            store,
            concurrency: DEFAULT_ASSET_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Retrieves every candidate not already stored. Failed assets are
    /// dropped; the surviving urls and names stay index-aligned.
    pub async fn retrieve(&self, candidates: Vec<Url>) -> MediaOutcome {
        let total = candidates.len();
        let concurrency = self.concurrency.min(total.max(1));
        let mut results: Vec<Option<RetrievedAsset>> = vec![None; total];
        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = candidates.into_iter().enumerate();
        let mut failed = 0usize;

        loop {
            while join_set.len() < concurrency {
                let Some((index, url)) = pending.next() else {
                    break;
                };
                let store = Arc::clone(&self.store);
                join_set.spawn(async move {
                    let outcome = retrieve_one(store.as_ref(), &url).await;
                    (index, url, outcome)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((index, _, Ok(asset))) => results[index] = Some(asset),
                Ok((_, url, Err(err))) => {
                    failed += 1;
                    tracing::warn!(url = %url, error = %err, "asset retrieval failed; excluding asset");
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(error = %err, "asset retrieval task failed");
                }
            }
        }

        let assets = results.into_iter().flatten().collect::<Vec<_>>();
        tracing::debug!(total, retrieved = assets.len(), failed, "media field retrieval");
        MediaOutcome::from_assets(&assets)
    }
}

async fn retrieve_one(store: &dyn AssetStore, url: &Url) -> Result<RetrievedAsset, AssetError> {
    let name = local_asset_name(url);
    let store_error = |err: anyhow::Error| AssetError::Store {
        name: name.clone(),
        message: format!("{err:#}"),
    };

    if !store.exists(&name).await.map_err(store_error)? {
        let bytes = store.fetch(url).await.map_err(|err| AssetError::Fetch {
            url: url.to_string(),
            message: format!("{err:#}"),
        })?;
        store.save(&name, &bytes).await.map_err(store_error)?;
    }

    Ok(RetrievedAsset {
        remote_url: url.clone(),
        local_name: name,
    })
}
