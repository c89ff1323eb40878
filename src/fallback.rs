use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use url::Url;

use crate::openai::ResponsesClient;

/// Longest HTML prefix sent to the model, in characters.
pub const MAX_HTML_CHARS: usize = 120_000;

/// Best-effort values for a batch of unresolved fields.
///
/// Keys outside `fields` are ignored by callers; a missing key means no value.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    async fn extract(
        &self,
        html: &str,
        url: &Url,
        fields: &[String],
    ) -> anyhow::Result<HashMap<String, Option<String>>>;
}

/// The batched call produced nothing usable; every requested field stays `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("fallback engine failed: {0}")]
    Engine(String),
}

/// When the batched fallback call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    Off,
    #[default]
    Any,
    AtLeast(usize),
}

impl FallbackPolicy {
    pub fn should_invoke(self, unresolved: usize) -> bool {
        match self {
            FallbackPolicy::Off => false,
            FallbackPolicy::Any => unresolved > 0,
            FallbackPolicy::AtLeast(min) => unresolved > 0 && unresolved >= min,
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "off" => Ok(FallbackPolicy::Off),
            "any" => Ok(FallbackPolicy::Any),
            other => {
                let Some(min) = other.strip_prefix("at-least:") else {
                    anyhow::bail!("unknown fallback policy `{other}` (expected off, any or at-least:N)");
                };
                let min = min
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("parse fallback threshold `{min}`"))?;
                Ok(FallbackPolicy::AtLeast(min))
            }
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackPolicy::Off => f.write_str("off"),
            FallbackPolicy::Any => f.write_str("any"),
            FallbackPolicy::AtLeast(min) => write!(f, "at-least:{min}"),
        }
    }
}

/// Never fills anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFallback;

#[async_trait]
impl FallbackExtractor for NoopFallback {
    async fn extract(
        &self,
        _html: &str,
        _url: &Url,
        _fields: &[String],
    ) -> anyhow::Result<HashMap<String, Option<String>>> {
        Ok(HashMap::new())
    }
}

pub struct OpenAiFallback {
    client: ResponsesClient,
}

impl OpenAiFallback {
    pub fn new(client: ResponsesClient) -> Self {
        Self { client }
    }
}

const INSTRUCTIONS: &str = "You extract fields from a real-estate listing page.\n\
\n\
Hard rules:\n\
- Read the HTML between BEGIN_HTML and END_HTML.\n\
- Fill the JSON object between BEGIN_FIELDS_JSON and END_FIELDS_JSON. Keep every key exactly as given.\n\
- Use null when the page does not state a value. Never guess.\n\
- Copy values as they appear on the page; do not translate them.\n\
\n\
Output:\n\
- Output ONLY the filled JSON object.\n";

#[async_trait]
impl FallbackExtractor for OpenAiFallback {
    async fn extract(
        &self,
        html: &str,
        url: &Url,
        fields: &[String],
    ) -> anyhow::Result<HashMap<String, Option<String>>> {
        let input = build_prompt(html, url, fields)?;
        tracing::debug!(
            engine = "openai",
            model = self.client.model(),
            url = %url,
            fields = fields.len(),
            "fallback extraction"
        );
        let text = self.client.complete(INSTRUCTIONS, &input).await?;
        parse_answers(&text)
    }
}

fn build_prompt(html: &str, url: &Url, fields: &[String]) -> anyhow::Result<String> {
    // Written by hand so keys keep the declared order.
    let entries = fields
        .iter()
        .map(|name| serde_json::to_string(name).map(|key| format!("  {key}: null")))
        .collect::<Result<Vec<_>, _>>()
        .context("serialize field names")?;
    let template = format!("{{\n{}\n}}", entries.join(",\n"));
    Ok(format!(
        "URL: {url}\n\nBEGIN_FIELDS_JSON\n{template}\nEND_FIELDS_JSON\n\nBEGIN_HTML\n{}\nEND_HTML\n",
        truncate_chars(html, MAX_HTML_CHARS)
    ))
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn parse_answers(text: &str) -> anyhow::Result<HashMap<String, Option<String>>> {
    let json = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(json).context("parse fallback JSON")?;
    let serde_json::Value::Object(object) = value else {
        anyhow::bail!("fallback answer is not a JSON object");
    };
    Ok(object
        .into_iter()
        .map(|(name, value)| (name, answer_text(value)))
        .collect())
}

fn answer_text(value: serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(text) => text,
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::Bool(flag) => flag.to_string(),
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(answer_text)
            .collect::<Vec<_>>()
            .join("\n"),
        object @ serde_json::Value::Object(_) => object.to_string(),
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("missing `{{`"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("missing `}}`"))?;
    if end <= start {
        anyhow::bail!("invalid json object span");
    }
    Ok(&text[start..=end])
}
