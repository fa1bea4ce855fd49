//! Fuzzy action equivalence with a persistent, symmetric verdict cache.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use webmcts_core::{clean_action, Action, ActionKind, Error, Result, SimilarityJudge};

use crate::retry::with_retries;

const KEY_SEP: &str = "|||";

/// Judge attempts per uncached pair.
pub const JUDGE_RETRIES: usize = 3;

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Pair-keyed verdict map, optionally backed by a JSON file of `"a|||b": bool`.
#[derive(Debug, Default)]
pub struct FuzzyCache {
    path: Option<PathBuf>,
    entries: HashMap<(String, String), bool>,
}

impl FuzzyCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path` if it exists; a missing file starts an empty cache bound to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let bytes = fs::read(&path).map_err(|e| Error::Cache(e.to_string()))?;
            let raw: BTreeMap<String, bool> =
                serde_json::from_slice(&bytes).map_err(|e| Error::Cache(e.to_string()))?;
            for (k, v) in raw {
                match k.split_once(KEY_SEP) {
                    Some((a, b)) if !b.contains(KEY_SEP) => {
                        entries.insert(pair_key(a, b), v);
                    }
                    _ => tracing::warn!(key = %k, "skipping fuzzy cache key without exactly one separator"),
                }
            }
            tracing::info!(path = %path.display(), entries = entries.len(), "loaded fuzzy cache");
        }
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn get(&self, a: &str, b: &str) -> Option<bool> {
        self.entries.get(&pair_key(a, b)).copied()
    }

    pub fn insert(&mut self, a: &str, b: &str, verdict: bool) {
        self.entries.insert(pair_key(a, b), verdict);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite the backing file. No-op for in-memory caches.
    ///
    /// Pairs whose payloads contain the key separator stay in memory only.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut out = BTreeMap::new();
        let mut unkeyable = 0usize;
        for ((a, b), v) in &self.entries {
            if a.contains(KEY_SEP) || b.contains(KEY_SEP) {
                unkeyable += 1;
                continue;
            }
            out.insert(format!("{a}{KEY_SEP}{b}"), *v);
        }
        if unkeyable > 0 {
            tracing::warn!(count = unkeyable, "fuzzy cache pairs containing the key separator were not persisted");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let bytes = serde_json::to_vec_pretty(&out).map_err(|e| Error::Cache(e.to_string()))?;
        fs::write(path, bytes).map_err(|e| Error::Cache(e.to_string()))?;
        tracing::info!(path = %path.display(), entries = out.len(), "flushed fuzzy cache");
        Ok(())
    }
}

/// Payload compared for `stop`/`type` actions; the whole string when it does not parse.
fn payload(raw: &str) -> String {
    match clean_action(raw).map(|c| c.action) {
        Ok(Action::Stop { answer }) => answer,
        Ok(Action::Type { content, .. }) => content,
        _ => raw.to_string(),
    }
}

/// Decides whether two action strings mean the same thing.
pub struct ActionMatcher {
    judge: Option<Arc<dyn SimilarityJudge>>,
    cache: Mutex<FuzzyCache>,
    retries: usize,
    judge_calls: AtomicUsize,
}

impl ActionMatcher {
    pub fn new(judge: Option<Arc<dyn SimilarityJudge>>, cache: FuzzyCache) -> Self {
        Self {
            judge,
            cache: Mutex::new(cache),
            retries: JUDGE_RETRIES,
            judge_calls: AtomicUsize::new(0),
        }
    }

    /// Exact and payload comparison only.
    pub fn offline() -> Self {
        Self::new(None, FuzzyCache::in_memory())
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Number of judge requests issued so far (including failed attempts).
    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, FuzzyCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cache_len(&self) -> usize {
        self.cache().len()
    }

    pub fn flush(&self) -> Result<()> {
        self.cache().flush()
    }

    pub async fn is_same_action(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        match (ActionKind::of(a), ActionKind::of(b)) {
            (Some(ActionKind::Stop), Some(ActionKind::Stop))
            | (Some(ActionKind::Type), Some(ActionKind::Type)) => {}
            _ => return false,
        }

        let (pa, pb) = (payload(a), payload(b));
        if pa == pb {
            return true;
        }
        if let Some(v) = self.cache().get(&pa, &pb) {
            tracing::debug!(a = %pa, b = %pb, verdict = v, "fuzzy cache hit");
            return v;
        }
        tracing::debug!(a = %pa, b = %pb, "fuzzy cache miss");

        let Some(judge) = self.judge.as_ref() else {
            return false;
        };
        let (first, second) = pair_key(&pa, &pb);
        let verdict = with_retries("judge_similarity", self.retries, || {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            judge.judge_similarity(&first, &second)
        })
        .await;
        match verdict {
            Some(v) => {
                let same = v.is_equivalent();
                self.cache().insert(&pa, &pb, same);
                same
            }
            None => false,
        }
    }
}
