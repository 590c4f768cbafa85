use crate::constants::{REFRESH_LEAD_MS, REFRESH_RETRY_MS};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

// Far-off expiries are slept through in bounded chunks; a single sleep to
// the deadline could overflow the timer for effectively-infinite tokens.
const MAX_SLEEP_CHUNK_MS: u64 = 86_400_000;

/// Schedules the pre-expiry refresh for one account. The timer fires ten
/// minutes before `expiry_ms` (floored at zero) and invokes the injected
/// refresh callable; on failure it re-arms after a fixed backoff. The caller
/// owns the returned handle and must abort any previous timer before
/// installing a new one.
pub fn schedule_refresh<F>(account_key: String, expiry_ms: i64, refresh: F) -> AbortHandle
where
    F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            let remaining = expiry_ms.saturating_sub(REFRESH_LEAD_MS).saturating_sub(now);
            let remaining = remaining.max(0) as u64;
            if remaining > MAX_SLEEP_CHUNK_MS {
                tokio::time::sleep(Duration::from_millis(MAX_SLEEP_CHUNK_MS)).await;
                continue;
            }
            tokio::time::sleep(Duration::from_millis(remaining)).await;

            match refresh().await {
                Ok(()) => {
                    // A successful refresh re-schedules itself with the new
                    // expiry; this timer is done.
                    debug!("Scheduled refresh completed for {}", account_key);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Scheduled refresh failed for {}: {} (retrying in {}s)",
                        account_key,
                        e,
                        REFRESH_RETRY_MS / 1000
                    );
                    tokio::time::sleep(Duration::from_millis(REFRESH_RETRY_MS)).await;
                }
            }
        }
    });
    task.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_when_already_past_lead() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _handle = schedule_refresh("a@x.com".to_string(), 0, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _handle = schedule_refresh("a@x.com".to_string(), 0, move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("refresh endpoint down".to_string())
                } else {
                    Ok(())
                }
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(REFRESH_RETRY_MS + 100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_a_pending_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let future_expiry = chrono::Utc::now().timestamp_millis() + REFRESH_LEAD_MS + 60_000;
        let handle = schedule_refresh("a@x.com".to_string(), future_expiry, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        handle.abort();
        tokio::time::sleep(Duration::from_millis(120_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
