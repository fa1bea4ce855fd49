//! Model identifier → chat backend resolution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use webmcts_core::{ChatBackend, Error, Result};

use crate::ollama::OllamaClient;
use crate::openai_compat::OpenAiCompatClient;

pub const DEFAULT_PROVIDER: &str = "openai_compat";

const PROVIDERS: [&str; 6] = [
    "openai_compat",
    "openai",
    "deepseek",
    "qwen",
    "siliconflow",
    "ollama",
];

/// Split `provider:model`. Unknown prefixes stay part of the model name
/// (`qwen2.5:3b` is a bare model, `ollama:qwen2.5:3b` is not).
pub fn split_model_id(id: &str) -> (&str, &str) {
    let id = id.trim();
    match id.split_once(':') {
        Some((p, m)) if PROVIDERS.contains(&p) => (p, m),
        _ => (DEFAULT_PROVIDER, id),
    }
}

/// Backends are built on first use and shared afterwards.
pub struct ModelRegistry {
    client: reqwest::Client,
    backends: Mutex<HashMap<String, Arc<dyn ChatBackend>>>,
}

impl ModelRegistry {
    pub fn from_env(client: reqwest::Client) -> Self {
        Self {
            client,
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self, model_id: &str) -> Result<Arc<dyn ChatBackend>> {
        let (provider, model) = split_model_id(model_id);
        if model.trim().is_empty() {
            return Err(Error::Config(format!("empty model name in {model_id:?}")));
        }
        let key = format!("{provider}:{model}");
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(b) = backends.get(&key) {
            return Ok(Arc::clone(b));
        }
        let backend: Arc<dyn ChatBackend> = match provider {
            "ollama" => Arc::new(OllamaClient::from_env(self.client.clone(), model)?),
            _ => Arc::new(OpenAiCompatClient::from_env(
                self.client.clone(),
                provider,
                model,
            )?),
        };
        tracing::debug!(model = %key, "resolved chat backend");
        backends.insert(key, Arc::clone(&backend));
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }

        fn unset(k: &'static str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::remove_var(k);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(v) => std::env::set_var(self.k, v),
                None => std::env::remove_var(self.k),
            }
        }
    }

    #[test]
    fn model_ids_split_on_known_providers_only() {
        assert_eq!(split_model_id("gpt-4o"), ("openai_compat", "gpt-4o"));
        assert_eq!(split_model_id("deepseek:deepseek-chat"), ("deepseek", "deepseek-chat"));
        assert_eq!(split_model_id("ollama:qwen2.5:3b"), ("ollama", "qwen2.5:3b"));
        assert_eq!(split_model_id("qwen2.5:3b"), ("openai_compat", "qwen2.5:3b"));
    }

    #[test]
    fn default_provider_needs_base_url() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::unset("WEBMCTS_OPENAI_COMPAT_BASE_URL");
        let r = ModelRegistry::from_env(reqwest::Client::new());
        assert!(matches!(r.backend("gpt-4o"), Err(Error::NotConfigured(_))));
    }

    #[test]
    fn backends_are_shared_per_model() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g = EnvGuard::set("WEBMCTS_OPENAI_COMPAT_BASE_URL", "http://127.0.0.1:9/v1");
        let r = ModelRegistry::from_env(reqwest::Client::new());
        let a = r.backend("gpt-4o").unwrap();
        let b = r.backend("openai_compat:gpt-4o").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "openai_compat:gpt-4o");
        let o = r.backend("ollama:llama3").unwrap();
        assert_eq!(o.name(), "ollama:llama3");
        assert!(matches!(r.backend("ollama:"), Err(Error::Config(_))));
    }
}
