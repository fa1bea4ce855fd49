use serde::{Deserialize, Serialize};
use webmcts_core::{ChatBackend, ChatMessage, ChatOptions, Error, Result};

use crate::usage::record_usage;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Default endpoints for providers that have a well-known one.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "qwen" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        "siliconflow" => Some("https://api.siliconflow.cn/v1"),
        _ => None,
    }
}

fn env_prefix(provider: &str) -> String {
    format!("WEBMCTS_{}", provider.to_ascii_uppercase())
}

/// Chat client for any OpenAI-style `chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    label: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        provider: &str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            client,
            label: format!("{provider}:{model}"),
            base_url: base_url.into(),
            api_key,
            model,
        }
    }

    /// Reads `WEBMCTS_<PROVIDER>_BASE_URL` / `WEBMCTS_<PROVIDER>_API_KEY`.
    pub fn from_env(client: reqwest::Client, provider: &str, model: &str) -> Result<Self> {
        let prefix = env_prefix(provider);
        let base_url = env(&format!("{prefix}_BASE_URL"))
            .or_else(|| default_base_url(provider).map(str::to_string))
            .ok_or_else(|| Error::NotConfigured(format!("missing {prefix}_BASE_URL")))?;
        let api_key = env(&format!("{prefix}_API_KEY"));
        if model.trim().is_empty() {
            return Err(Error::NotConfigured(format!("missing model for {provider}")));
        }
        Ok(Self::new(client, provider, base_url, api_key, model.trim()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: &self.model,
            messages,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            response_format: opts.json_object.then(|| ResponseFormat {
                kind: "json_object",
            }),
            stream: false,
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(opts.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "{} chat.completions HTTP {status}",
                self.label
            )));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        if let Some(u) = &parsed.usage {
            record_usage(u.prompt_tokens, u.completion_tokens);
        }
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::token_usage;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn chat_returns_first_choice_and_counts_tokens() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let json_mode = body["response_format"]["type"] == "json_object";
                let named = body["messages"][0]["name"] == "example_user";
                Json(serde_json::json!({
                    "choices": [{"message": {"content": format!("json={json_mode} named={named}")}}],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 2}
                }))
            }),
        );
        let addr = serve(app).await;
        let c = OpenAiCompatClient::new(
            reqwest::Client::new(),
            "openai_compat",
            format!("http://{addr}"),
            Some("k".into()),
            "m",
        );
        assert_eq!(c.name(), "openai_compat:m");

        let before = token_usage();
        let opts = ChatOptions {
            json_object: true,
            timeout_ms: 5_000,
            ..ChatOptions::default()
        };
        let out = c
            .chat(&[ChatMessage::named_system("example_user", "hi")], &opts)
            .await
            .unwrap();
        assert_eq!(out, "json=true named=true");
        let after = token_usage();
        assert!(after.prompt_tokens >= before.prompt_tokens + 7);
    }

    #[tokio::test]
    async fn base_with_v1_is_not_doubled_and_errors_surface() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let addr = serve(app).await;
        let c = OpenAiCompatClient::new(
            reqwest::Client::new(),
            "qwen",
            format!("http://{addr}/v1/"),
            None,
            "m",
        );
        let opts = ChatOptions {
            timeout_ms: 5_000,
            ..ChatOptions::default()
        };
        let err = c.chat(&[ChatMessage::user("x")], &opts).await.unwrap_err();
        match err {
            Error::Llm(msg) => assert!(msg.contains("429"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn known_providers_have_default_urls() {
        let c = OpenAiCompatClient::from_env(reqwest::Client::new(), "deepseek", "deepseek-chat")
            .unwrap();
        assert!(c.base_url().starts_with("https://"));
        assert!(matches!(
            OpenAiCompatClient::from_env(reqwest::Client::new(), "nowhere", "m"),
            Err(Error::NotConfigured(_))
        ));
    }
}
