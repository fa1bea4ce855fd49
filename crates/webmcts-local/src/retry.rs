use std::future::Future;
use webmcts_core::Result;

/// Default attempts per oracle call site.
pub const ORACLE_RETRIES: usize = 2;

/// Run `f` up to `attempts` times (at least once).
///
/// Every failure is logged; exhaustion yields `None` instead of the last error,
/// so callers pick their own safe default.
pub async fn with_retries<T, F, Fut>(call_site: &str, attempts: usize, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match f().await {
            Ok(v) => return Some(v),
            Err(e) => {
                tracing::warn!(call_site, attempt, attempts, error = %e, "oracle call failed");
            }
        }
    }
    None
}
