use std::time::Duration;

use anyhow::Context as _;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Minimal client for the Responses API: plain text in, plain text out.
#[derive(Debug, Clone)]
pub struct ResponsesClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ResponsesClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build openai http client")?;
        Ok(Self {
            client,
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
        })
    }

    /// Reads `OPENAI_API_KEY` from the environment.
    pub fn from_env(base_url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
        Self::new(base_url, api_key, model, timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn complete(&self, instructions: &str, input: &str) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "instructions": instructions,
            "input": input,
            "text": { "format": { "type": "text" } },
            "store": false,
        });

        // GPT-5 models reject sampling params.
        if !self.model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("temperature".to_owned(), serde_json::json!(self.temperature));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read OpenAI response body")?;
        if !status.is_success() {
            let message = error_message(&raw).unwrap_or(raw);
            anyhow::bail!("OpenAI API error ({status}): {message}");
        }

        let value: serde_json::Value = serde_json::from_str(&raw).context("parse OpenAI response")?;
        output_text(&value)
    }
}

pub fn responses_endpoint(base_url: &str) -> String {
    format!("{}/responses", base_url.trim_end_matches('/'))
}

fn error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    Some(value.get("error")?.get("message")?.as_str()?.to_owned())
}

/// Concatenates every `output_text` part of every `message` output item.
fn output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let text = output
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect::<String>();

    if text.trim().is_empty() {
        anyhow::bail!("OpenAI output text is empty");
    }
    Ok(text)
}
