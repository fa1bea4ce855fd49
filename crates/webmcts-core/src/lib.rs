use serde::{Deserialize, Serialize};

pub mod action;

pub use action::{
    canonicalize, clean_action, format_response, parse_action_thinking, Action, ActionKind,
    CleanStatus, CleanedAction, FormatReason, ScrollDirection, STOP_PLACEHOLDER,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Action text could not be normalized (`bad_sample`).
    #[error("bad_sample: cannot normalize action {raw:?} ({reason})")]
    Format { raw: String, reason: FormatReason },
    /// Action references an element id that is absent from the current observation.
    #[error("unknown element [{0}] in current observation")]
    UnknownElement(String),
    #[error("oracle returned an empty response: {0}")]
    OracleEmptyResponse(String),
    #[error("oracle returned malformed output: {0}")]
    OracleMalformedJson(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("tree error: {0}")]
    Tree(String),
    #[error("task store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Optional speaker name (used for few-shot `example_user` / `example_assistant` turns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn named_system(name: &str, content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            name: Some(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Ask the provider for a JSON object response (`response_format`).
    pub json_object: bool,
    /// Timeout for a single request (network + processing).
    pub timeout_ms: u64,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: Some(4096),
            json_object: false,
            timeout_ms: 120_000,
        }
    }
}

/// A chat-completion provider. One implementation per wire protocol.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub intent: String,
    /// Accumulated step trace up to (and including) the current node.
    pub trace: String,
    /// Current observation (accessibility tree text).
    pub observation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRequest {
    pub intent: String,
    pub trace: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Score {
    pub value: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityVerdict {
    /// `"yes"` or `"no"`.
    pub similarity_binary: String,
    pub similarity_score: f64,
    #[serde(default)]
    pub analysis: String,
}

impl SimilarityVerdict {
    pub fn is_equivalent(&self) -> bool {
        self.similarity_binary.trim().eq_ignore_ascii_case("yes") && self.similarity_score >= 0.5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub intent: String,
    pub failed_action: String,
    pub last_state: String,
    pub current_state: String,
}

/// Proposes the next action. Returns the raw policy response (reasoning + action).
#[async_trait::async_trait]
pub trait PolicyOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn propose_action(&self, req: &PolicyRequest) -> Result<String>;
}

/// Simulates the browser: predicts the observation after `action` is applied to `state`.
#[async_trait::async_trait]
pub trait WorldOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn predict_next_state(&self, state: &str, action: &str) -> Result<String>;
}

/// Scores a trajectory. The returned value is not clamped.
#[async_trait::async_trait]
pub trait RewardOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn score_trajectory(&self, req: &RewardRequest) -> Result<Score>;
}

#[async_trait::async_trait]
pub trait SimilarityJudge: Send + Sync {
    fn name(&self) -> &str;
    async fn judge_similarity(&self, a: &str, b: &str) -> Result<SimilarityVerdict>;
}

#[async_trait::async_trait]
pub trait ReflectionOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn generate_reflection(&self, req: &ReflectionRequest) -> Result<String>;
}
