//! Oracles backed by a chat model, plus the parsers that wash their replies.

use regex::Regex;
use std::sync::{Arc, OnceLock};

use webmcts_core::{
    ChatBackend, ChatOptions, Error, PolicyOracle, PolicyRequest, ReflectionOracle,
    ReflectionRequest, Result, RewardOracle, RewardRequest, Score, SimilarityJudge,
    SimilarityVerdict, WorldOracle,
};

use crate::prompts;

fn a11y_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<a11y>(.*?)</a11y>").ok())
        .as_ref()
}

fn reward_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)Reason:\s*(.*?)\s*Score:\s*(\d+(?:\.\d+)?)").ok())
        .as_ref()
}

/// The predicted observation inside `<a11y>…</a11y>`.
pub fn extract_a11y(response: &str) -> Result<String> {
    a11y_re()
        .and_then(|re| re.captures(response))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches('\n').to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::OracleEmptyResponse("world model: no <a11y> block".to_string()))
}

/// `Reason: … Score: N`. The score is returned unclamped.
pub fn parse_reward(response: &str) -> Result<Score> {
    let caps = reward_re()
        .and_then(|re| re.captures(response))
        .ok_or_else(|| {
        Error::OracleMalformedJson(format!("reward: expected `Reason: … Score: N`, got {response:?}"))
    })?;
    let value = caps[2]
        .parse::<f64>()
        .map_err(|e| Error::OracleMalformedJson(format!("reward score: {e}")))?;
    Ok(Score {
        value,
        rationale: caps[1].trim().to_string(),
    })
}

fn strip_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Judge JSON; `similarity_score` may be a number or a numeric string.
pub fn parse_verdict(response: &str) -> Result<SimilarityVerdict> {
    let v: serde_json::Value = serde_json::from_str(strip_fences(response))
        .map_err(|e| Error::OracleMalformedJson(format!("judge: {e}")))?;
    let similarity_binary = v
        .get("similarity_binary")
        .and_then(|b| b.as_str())
        .ok_or_else(|| Error::OracleMalformedJson("judge: missing similarity_binary".to_string()))?
        .trim()
        .to_ascii_lowercase();
    let similarity_score = match v.get("similarity_score") {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::OracleMalformedJson("judge: bad similarity_score".to_string()))?;
    let analysis = v
        .get("analysis")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(SimilarityVerdict {
        similarity_binary,
        similarity_score,
        analysis,
    })
}

fn non_empty(call_site: &str, s: String) -> Result<String> {
    if s.trim().is_empty() {
        Err(Error::OracleEmptyResponse(call_site.to_string()))
    } else {
        Ok(s)
    }
}

pub struct LlmPolicy {
    backend: Arc<dyn ChatBackend>,
    opts: ChatOptions,
}

impl LlmPolicy {
    pub fn new(backend: Arc<dyn ChatBackend>, opts: ChatOptions) -> Self {
        Self { backend, opts }
    }
}

#[async_trait::async_trait]
impl PolicyOracle for LlmPolicy {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn propose_action(&self, req: &PolicyRequest) -> Result<String> {
        let out = self
            .backend
            .chat(&prompts::policy_messages(req), &self.opts)
            .await?;
        non_empty("policy", out)
    }
}

pub struct LlmWorld {
    backend: Arc<dyn ChatBackend>,
    opts: ChatOptions,
}

impl LlmWorld {
    pub fn new(backend: Arc<dyn ChatBackend>, opts: ChatOptions) -> Self {
        Self { backend, opts }
    }
}

#[async_trait::async_trait]
impl WorldOracle for LlmWorld {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn predict_next_state(&self, state: &str, action: &str) -> Result<String> {
        let out = self
            .backend
            .chat(&prompts::world_messages(state, action), &self.opts)
            .await?;
        extract_a11y(&out)
    }
}

pub struct LlmReward {
    backend: Arc<dyn ChatBackend>,
    opts: ChatOptions,
}

impl LlmReward {
    pub fn new(backend: Arc<dyn ChatBackend>, opts: ChatOptions) -> Self {
        Self { backend, opts }
    }
}

#[async_trait::async_trait]
impl RewardOracle for LlmReward {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn score_trajectory(&self, req: &RewardRequest) -> Result<Score> {
        let out = self
            .backend
            .chat(&prompts::reward_messages(req), &self.opts)
            .await?;
        parse_reward(&non_empty("reward", out)?)
    }
}

pub struct LlmJudge {
    backend: Arc<dyn ChatBackend>,
    opts: ChatOptions,
}

impl LlmJudge {
    /// Forces JSON-object responses regardless of `opts.json_object`.
    pub fn new(backend: Arc<dyn ChatBackend>, opts: ChatOptions) -> Self {
        Self {
            backend,
            opts: ChatOptions {
                json_object: true,
                ..opts
            },
        }
    }
}

#[async_trait::async_trait]
impl SimilarityJudge for LlmJudge {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn judge_similarity(&self, a: &str, b: &str) -> Result<SimilarityVerdict> {
        let out = self
            .backend
            .chat(&prompts::judge_messages(a, b), &self.opts)
            .await?;
        parse_verdict(&non_empty("judge", out)?)
    }
}

pub struct LlmReflection {
    backend: Arc<dyn ChatBackend>,
    opts: ChatOptions,
}

impl LlmReflection {
    pub fn new(backend: Arc<dyn ChatBackend>, opts: ChatOptions) -> Self {
        Self { backend, opts }
    }
}

#[async_trait::async_trait]
impl ReflectionOracle for LlmReflection {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn generate_reflection(&self, req: &ReflectionRequest) -> Result<String> {
        let out = self
            .backend
            .chat(&prompts::reflection_messages(req), &self.opts)
            .await?;
        Ok(non_empty("reflection", out)?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use webmcts_core::ChatMessage;

    /// Replies with a fixed string and records the last options it saw.
    struct Canned {
        reply: String,
        seen: Mutex<Option<ChatOptions>>,
    }

    impl Canned {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(None),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn chat(&self, _messages: &[ChatMessage], opts: &ChatOptions) -> Result<String> {
            *self.seen.lock().unwrap() = Some(opts.clone());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn a11y_block_is_extracted() {
        let out = extract_a11y("Sure.\n<a11y>\n[1] RootWebArea 'x'\n\t[2] link 'y'\n</a11y>\nDone").unwrap();
        assert_eq!(out, "[1] RootWebArea 'x'\n\t[2] link 'y'");
        assert!(matches!(
            extract_a11y("no block here"),
            Err(Error::OracleEmptyResponse(_))
        ));
        assert!(extract_a11y("<a11y>  </a11y>").is_err());
    }

    #[test]
    fn reward_needs_reason_and_score() {
        let s = parse_reward("Reason: found the price and stopped.\nScore: 5").unwrap();
        assert_eq!(s.value, 5.0);
        assert_eq!(s.rationale, "found the price and stopped.");
        assert_eq!(parse_reward("Reason: x Score: 7").unwrap().value, 7.0);
        assert!(matches!(
            parse_reward("Score: 4"),
            Err(Error::OracleMalformedJson(_))
        ));
        assert!(parse_reward("Reason: meh").is_err());
    }

    #[test]
    fn verdict_accepts_string_or_number_scores() {
        let v = parse_verdict(r#"{"similarity_binary": "Yes", "similarity_score": "0.8", "analysis": "same"}"#)
            .unwrap();
        assert_eq!(v.similarity_binary, "yes");
        assert_eq!(v.similarity_score, 0.8);
        assert!(v.is_equivalent());

        let v = parse_verdict("```json\n{\"similarity_binary\": \"no\", \"similarity_score\": 0.1}\n```").unwrap();
        assert!(!v.is_equivalent());
        assert_eq!(v.analysis, "");

        assert!(parse_verdict(r#"{"similarity_binary": "yes", "similarity_score": "high"}"#).is_err());
        assert!(parse_verdict("not json").is_err());
    }

    #[tokio::test]
    async fn empty_policy_reply_is_an_error() {
        let p = LlmPolicy::new(Canned::new("  "), ChatOptions::default());
        let req = PolicyRequest {
            intent: "i".into(),
            trace: String::new(),
            observation: String::new(),
        };
        assert!(matches!(
            p.propose_action(&req).await,
            Err(Error::OracleEmptyResponse(_))
        ));
    }

    #[tokio::test]
    async fn judge_forces_json_mode() {
        let backend = Canned::new(r#"{"similarity_binary": "yes", "similarity_score": 1}"#);
        let j = LlmJudge::new(backend.clone(), ChatOptions::default());
        let v = j.judge_similarity("a", "b").await.unwrap();
        assert!(v.is_equivalent());
        assert!(backend.seen.lock().unwrap().as_ref().unwrap().json_object);
    }

    #[tokio::test]
    async fn world_and_reward_wash_replies() {
        let w = LlmWorld::new(Canned::new("<a11y>[9] button 'ok'</a11y>"), ChatOptions::default());
        assert_eq!(w.predict_next_state("s", "click [1]").await.unwrap(), "[9] button 'ok'");
        let r = LlmReward::new(Canned::new("Reason: fine\nScore: 3"), ChatOptions::default());
        let req = RewardRequest {
            intent: "i".into(),
            trace: String::new(),
            state: String::new(),
        };
        assert_eq!(r.score_trajectory(&req).await.unwrap().value, 3.0);
        assert_eq!(r.name(), "canned");
    }
}
