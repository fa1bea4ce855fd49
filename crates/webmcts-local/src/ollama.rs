use serde::{Deserialize, Serialize};
use webmcts_core::{ChatBackend, ChatMessage, ChatOptions, Error, Result};

use crate::usage::record_usage;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    label: String,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            client,
            label: format!("ollama:{model}"),
            base_url: base_url.into(),
            model,
        }
    }

    /// `WEBMCTS_OLLAMA_BASE_URL` falls back to the local daemon.
    pub fn from_env(client: reqwest::Client, model: &str) -> Result<Self> {
        let model = model.trim();
        if model.is_empty() {
            return Err(Error::NotConfigured("missing model for ollama".to_string()));
        }
        let base_url =
            env("WEBMCTS_OLLAMA_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        Ok(Self::new(client, base_url, model))
    }

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl ChatBackend for OllamaClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String> {
        // Ollama has no `name` field; fold few-shot speakers into the role.
        let messages = messages
            .iter()
            .map(|m| WireMessage {
                role: match m.name.as_deref() {
                    Some("example_user") => "user".to_string(),
                    Some("example_assistant") => "assistant".to_string(),
                    _ => m.role.clone(),
                },
                content: m.content.clone(),
            })
            .collect();
        let req = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format: opts.json_object.then_some("json"),
            options: WireOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
        };

        let resp = self
            .client
            .post(self.endpoint_chat())
            .timeout(std::time::Duration::from_millis(opts.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("ollama chat HTTP {status}")));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        record_usage(parsed.prompt_eval_count, parsed.eval_count);
        Ok(parsed.message.content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: WireMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}
