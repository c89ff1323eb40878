use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

/// Answers field-extraction prompts from a fixed table; unknown fields get `null`.
pub struct OpenAiStub {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    requested: Arc<Mutex<Vec<Vec<String>>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(answers: HashMap<String, String>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");

        let calls = Arc::new(AtomicUsize::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_calls = Arc::clone(&calls);
        let thread_requested = Arc::clone(&requested);
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.method() != &tiny_http::Method::Post || request.url() != "/v1/responses"
                {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let output_text = match fields_response(&body, &answers) {
                    Ok((fields, text)) => {
                        thread_calls.fetch_add(1, Ordering::SeqCst);
                        thread_requested.lock().unwrap().push(fields);
                        text
                    }
                    Err(err) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string(format!("bad prompt: {err:#}"))
                                .with_status_code(400),
                        );
                        continue;
                    }
                };

                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ]
                });
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let _ = request.respond(
                    tiny_http::Response::from_string(response_body.to_string()).with_header(header),
                );
            }
        });

        Self {
            base_url,
            calls,
            requested,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<Vec<String>> {
        self.requested.lock().unwrap().clone()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}

fn fields_response(
    body: &str,
    answers: &HashMap<String, String>,
) -> anyhow::Result<(Vec<String>, String)> {
    let parsed: Value = serde_json::from_str(body).context("parse request json")?;
    let prompt = parsed
        .get("input")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing input"))?;
    if !prompt.contains("BEGIN_HTML\n") {
        anyhow::bail!("missing html markers");
    }
    let raw = extract_between(prompt, "BEGIN_FIELDS_JSON\n", "\nEND_FIELDS_JSON")
        .ok_or_else(|| anyhow::anyhow!("missing fields markers"))?;
    let template: serde_json::Map<String, Value> =
        serde_json::from_str(raw).context("parse fields json")?;

    let mut fields = Vec::new();
    let mut filled = serde_json::Map::new();
    for name in template.keys() {
        fields.push(name.clone());
        let value = answers
            .get(name)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null);
        filled.insert(name.clone(), value);
    }
    fields.sort();
    Ok((fields, format!("```json\n{}\n```", Value::Object(filled))))
}
