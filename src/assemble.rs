use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeMap as _;
use serde::{Serialize, Serializer};
use url::Url;

use crate::document::Document;
use crate::fallback::{FallbackError, FallbackExtractor, FallbackPolicy};
use crate::formats::{ERROR_VALUE, SOURCE_URL_FIELD, SiteConfig};
use crate::media::{MediaFieldResolver, MediaOutcome, media_candidates};
use crate::resolve::{ExtractionOutcome, Unresolved, resolve_field};

pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Resolved,
    FilledByFallback,
    ErrorFinal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    value: String,
    state: FieldState,
}

/// One extracted listing: every declared field, in declared order, plus `source_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    source_url: String,
    cells: Vec<(String, Cell)>,
}

impl Record {
    fn new<'a>(source_url: &str, fields: impl Iterator<Item = &'a str>) -> Self {
        let cells = fields
            .map(|name| {
                let cell = Cell {
                    value: ERROR_VALUE.to_owned(),
                    state: FieldState::ErrorFinal,
                };
                (name.to_owned(), cell)
            })
            .collect();
        Self {
            source_url: source_url.to_owned(),
            cells,
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Value of a declared field, or of `source_url`.
    pub fn get(&self, name: &str) -> Option<&str> {
        if name == SOURCE_URL_FIELD {
            return Some(&self.source_url);
        }
        self.cell(name).map(|cell| cell.value.as_str())
    }

    pub fn state(&self, name: &str) -> Option<FieldState> {
        self.cell(name).map(|cell| cell.state)
    }

    fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, cell)| cell)
    }

    fn cell_mut(&mut self, name: &str) -> Option<&mut Cell> {
        self.cells
            .iter_mut()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, cell)| cell)
    }

    /// Declared fields in order; `source_url` is not included.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells
            .iter()
            .map(|(name, cell)| (name.as_str(), cell.value.as_str()))
    }

    /// Declared fields plus `source_url`.
    pub fn column_count(&self) -> usize {
        self.cells.len() + 1
    }

    pub fn error_count(&self) -> usize {
        self.count(FieldState::ErrorFinal)
    }

    fn count(&self, state: FieldState) -> usize {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.state == state)
            .count()
    }

    fn settle(&mut self, name: &str, outcome: &ExtractionOutcome) {
        let Some(cell) = self.cell_mut(name) else {
            return;
        };
        match outcome {
            ExtractionOutcome::Resolved(value) => {
                cell.value = value.clone();
                cell.state = FieldState::Resolved;
            }
            ExtractionOutcome::Unresolved(Unresolved::Transform(err)) => {
                tracing::warn!(
                    field = name,
                    expr = %err.expr,
                    message = %err.message,
                    "transform failed"
                );
            }
            ExtractionOutcome::Unresolved(Unresolved::InvalidPath(err)) => {
                tracing::warn!(field = name, "{err}");
            }
            ExtractionOutcome::Unresolved(reason) => {
                tracing::debug!(field = name, %reason, "field unresolved");
            }
        }
    }

    /// Fills a provisional `ERROR` cell. Resolved cells are never touched.
    fn fill(&mut self, name: &str, value: &str) -> bool {
        match self.cell_mut(name) {
            Some(cell) if cell.state == FieldState::ErrorFinal => {
                cell.value = value.to_owned();
                cell.state = FieldState::FilledByFallback;
                true
            }
            _ => false,
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.column_count()))?;
        map.serialize_entry(SOURCE_URL_FIELD, &self.source_url)?;
        for (name, value) in self.fields() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Produces one complete [`Record`] per document.
#[derive(Clone)]
pub struct RecordAssembler {
    media: MediaFieldResolver,
    fallback: Arc<dyn FallbackExtractor>,
    policy: FallbackPolicy,
    fallback_timeout: Duration,
}

impl RecordAssembler {
    pub fn new(media: MediaFieldResolver, fallback: Arc<dyn FallbackExtractor>) -> Self {
        Self {
            media,
            fallback,
            policy: FallbackPolicy::default(),
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub async fn assemble(&self, html: &str, config: &SiteConfig, url: &Url) -> Record {
        let mut record = Record::new(url.as_str(), config.fields.names());

        let candidates = {
            let document = Document::parse(html);
            for (name, rule) in config.fields.iter() {
                if !config.is_media_field(name) {
                    record.settle(name, &resolve_field(&document, rule));
                }
            }
            config
                .media_rule()
                .map(|rule| media_candidates(&document, rule, url))
        };

        if let Some(candidates) = candidates {
            let outcome = match candidates {
                Ok(candidates) => self.media.retrieve(candidates).await,
                Err(reason) => MediaOutcome::unresolved(reason),
            };
            record.settle(&config.media.urls, &outcome.urls);
            record.settle(&config.media.names, &outcome.names);
        }

        // The media pair never goes to the fallback: it can name remote URLs
        // but has no local copies to pair them with.
        let unresolved = record
            .cells
            .iter()
            .filter(|(name, cell)| {
                cell.state == FieldState::ErrorFinal && !config.is_media_field(name)
            })
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        if self.policy.should_invoke(unresolved.len()) {
            self.fill_from_fallback(&mut record, html, url, &unresolved)
                .await;
        } else if !unresolved.is_empty() {
            tracing::debug!(
                url = %url,
                unresolved = unresolved.len(),
                policy = %self.policy,
                "fallback skipped"
            );
        }

        tracing::info!(
            url = %url,
            resolved = record.count(FieldState::Resolved),
            filled = record.count(FieldState::FilledByFallback),
            errors = record.error_count(),
            "record assembled"
        );
        record
    }

    async fn fill_from_fallback(
        &self,
        record: &mut Record,
        html: &str,
        url: &Url,
        unresolved: &[String],
    ) {
        tracing::info!(url = %url, fields = ?unresolved, "requesting fallback values");
        let call = self.fallback.extract(html, url, unresolved);
        let answers = match tokio::time::timeout(self.fallback_timeout, call).await {
            Ok(Ok(answers)) => Ok(answers),
            Ok(Err(err)) => Err(FallbackError::Engine(format!("{err:#}"))),
            Err(_) => Err(FallbackError::Timeout(self.fallback_timeout)),
        };
        let answers = match answers {
            Ok(answers) => answers,
            Err(err) => {
                tracing::warn!(url = %url, fields = unresolved.len(), "{err}");
                return;
            }
        };

        let mut filled = 0usize;
        for name in unresolved {
            if let Some(Some(value)) = answers.get(name)
                && !value.trim().is_empty()
                && record.fill(name, value.trim())
            {
                filled += 1;
            }
        }
        tracing::debug!(url = %url, requested = unresolved.len(), filled, "fallback merged");
    }
}
