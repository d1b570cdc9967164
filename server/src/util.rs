use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Prefix of `s` holding at most `max_chars` characters, never splitting a code point
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Run `fut` under a deadline, surfacing expiry as `AppError::Timeout`
pub async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!("{what} after {:?}", limit))),
    }
}
