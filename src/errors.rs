use std::future::Future;
use std::time::Duration;

/// Orchestration-level error returned by task loops (`main.rs`'s `JoinHandle`s).
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("chat transport error: {0}")]
    Chat(String),
    #[error("invalid state transition: {0} -> {1}")]
    InvalidTransition(&'static str, &'static str),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Exchange-specific error taxonomy, generalized from the teacher's `BybitError`: the same
/// three-way split drives `with_retry` regardless of which exchange method raised it.
#[derive(Debug)]
pub enum ExchangeError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    RateLimit { retry_after: u64 },
    /// Transient error: network, timeout, HTTP 5xx, server overload (retCode=10016).
    Transient(String),
    /// Permanent error: invalid params, insufficient balance, HTTP 4xx.
    Permanent(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::RateLimit { retry_after } => {
                write!(f, "rate limited (retry after {}s)", retry_after)
            }
            ExchangeError::Transient(msg) => write!(f, "transient error: {}", msg),
            ExchangeError::Permanent(msg) => write!(f, "permanent error: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Classify a Bybit retCode + HTTP status into an `ExchangeError`.
pub fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => ExchangeError::Transient(msg.to_string()),
        _ => ExchangeError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Generic retry wrapper with exponential backoff, same shape as the teacher's
/// `bybit_api::with_retry`.
pub async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(ExchangeError::RateLimit { retry_after }) => {
                if retries >= max_retries {
                    return Err(ExchangeError::RateLimit { retry_after });
                }
                log::warn!(
                    "rate limited — sleeping {}s (attempt {}/{})",
                    retry_after,
                    retries + 1,
                    max_retries
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(ExchangeError::Transient(msg)) => {
                if retries >= max_retries {
                    return Err(ExchangeError::Transient(msg));
                }
                log::warn!(
                    "transient error: {} — retry in {}s ({}/{})",
                    msg,
                    delay,
                    retries + 1,
                    max_retries
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
                retries += 1;
            }
            Err(e @ ExchangeError::Permanent(_)) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit() {
        assert!(matches!(
            classify_error(10006, 200, "x"),
            ExchangeError::RateLimit { .. }
        ));
        assert!(matches!(
            classify_error(0, 429, "x"),
            ExchangeError::RateLimit { .. }
        ));
    }

    #[test]
    fn classify_transient_on_5xx() {
        assert!(matches!(
            classify_error(0, 503, "x"),
            ExchangeError::Transient(_)
        ));
    }

    #[test]
    fn classify_permanent_otherwise() {
        assert!(matches!(
            classify_error(110007, 200, "insufficient balance"),
            ExchangeError::Permanent(_)
        ));
    }
}
