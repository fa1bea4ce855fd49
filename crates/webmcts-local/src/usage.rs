use serde::Serialize;
use std::sync::{Mutex, OnceLock};

/// Process-wide token accounting across all chat backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

fn usage() -> &'static Mutex<TokenUsage> {
    static USAGE: OnceLock<Mutex<TokenUsage>> = OnceLock::new();
    USAGE.get_or_init(|| Mutex::new(TokenUsage::default()))
}

pub fn record_usage(prompt_tokens: u64, completion_tokens: u64) {
    let mut u = usage().lock().unwrap_or_else(|e| e.into_inner());
    u.calls += 1;
    u.prompt_tokens += prompt_tokens;
    u.completion_tokens += completion_tokens;
}

pub fn token_usage() -> TokenUsage {
    *usage().lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = token_usage();
        record_usage(10, 3);
        record_usage(1, 1);
        let after = token_usage();
        assert!(after.calls >= before.calls + 2);
        assert!(after.prompt_tokens >= before.prompt_tokens + 11);
        assert!(after.completion_tokens >= before.completion_tokens + 4);
    }
}
