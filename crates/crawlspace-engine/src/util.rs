//! Small shared helpers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Generates an opaque URL-safe token (lease holders, run tokens).
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Backoff before the single retry of a transient failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Runs an operation, retrying exactly once (after a short backoff) when it
/// fails with a transient dependency error. Anything else propagates
/// unchanged.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            tracing::debug!(error = %e, "transient failure; retrying once");
            tokio::time::sleep(RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_transient_failures_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::dependency("blip"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_domain_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Validation("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
