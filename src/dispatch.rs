use crate::auth::{AuthManager, Credentials, Group};
use crate::constants::COOLDOWN_WAIT_THRESHOLD_MS;
use crate::error::{AppError, AppResult};
use crate::quota::{CachedError, PickContext, QuotaTracker, Selection};
use crate::upstream::{retry, UpstreamClient};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hint at or below this is worth sleeping through on a single-account pool.
const SHORT_HINT_MS: u64 = 5_000;

pub struct UpstreamCall<'a> {
    pub method: &'a str,
    pub group: Group,
    /// Mapped upstream model id; None skips quota-aware selection and falls
    /// back to plain per-group round-robin.
    pub model: Option<&'a str>,
    pub query: Option<&'a str>,
    pub headers: HashMap<String, String>,
}

/// Either a live upstream response to pass through, or a locally answered
/// 429 (its body was consumed for the retry decision, or it was synthesized
/// from the quota cache).
pub enum UpstreamOutcome {
    Response(reqwest::Response),
    RateLimited(CachedError),
}

pub struct Orchestrator {
    pub auth: Arc<AuthManager>,
    pub quota: Arc<QuotaTracker>,
    pub client: Arc<UpstreamClient>,
    pub retry_delay_ms: u64,
}

impl Orchestrator {
    pub fn new(
        auth: Arc<AuthManager>,
        quota: Arc<QuotaTracker>,
        client: Arc<UpstreamClient>,
        retry_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth,
            quota,
            client,
            retry_delay_ms,
        })
    }

    /// Runs one logical request through account selection, credential
    /// acquisition, the rate gate, and the upstream POST, rotating on 429s
    /// and transport errors. `build_body` is invoked afresh per attempt
    /// because the project id differs by account (and each attempt carries a
    /// new requestId).
    pub async fn call_v1_internal<F>(
        &self,
        call: UpstreamCall<'_>,
        build_body: F,
    ) -> AppResult<UpstreamOutcome>
    where
        F: Fn(&str) -> Value,
    {
        let pool_size = self.auth.pool_len().await;
        if pool_size == 0 {
            return Err(AppError::Account("no accounts loaded".to_string()));
        }

        let attempts = pool_size.max(1);
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_429: Option<CachedError> = None;
        let mut retried_same_account = false;
        let mut retried_transport = false;

        let mut attempt = 0;
        while attempt < attempts {
            attempt += 1;

            let credentials = match self.select_account(&call, &excluded).await? {
                Selected::Credentials(credentials) => credentials,
                Selected::RateLimited(error) => return Ok(UpstreamOutcome::RateLimited(error)),
            };

            let body = build_body(&credentials.project_id);
            let response = self
                .client
                .call_v1_internal(
                    call.method,
                    &credentials.access_token,
                    &body,
                    call.query,
                    &call.headers,
                )
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Transport error on {} via {}: {}",
                        call.method, credentials.key, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
                    if pool_size > 1 {
                        excluded.insert(credentials.key);
                        self.auth.rotate(call.group).await;
                    } else if !retried_transport {
                        retried_transport = true;
                        attempt -= 1;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() != 429 {
                // 2xx and non-429 errors are the caller's to see verbatim; no
                // rotation on a model or request problem.
                return Ok(UpstreamOutcome::Response(response));
            }

            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|value| (k.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body_text = response.text().await.unwrap_or_default();
            let hint_ms = retry::parse_retry_delay(&body_text);
            let error = CachedError {
                status: 429,
                headers,
                body: body_text,
            };

            let now_ms = chrono::Utc::now().timestamp_millis();
            if let Some(model) = call.model {
                self.quota.note_rate_limited(
                    model,
                    &credentials.key,
                    now_ms,
                    hint_ms,
                    self.retry_delay_ms,
                    error.clone(),
                );
            }

            info!(
                "429 from upstream on {} via {} (hint: {:?}ms)",
                call.method, credentials.key, hint_ms
            );

            if pool_size == 1 {
                match hint_ms {
                    Some(hint) if hint <= SHORT_HINT_MS && !retried_same_account => {
                        retried_same_account = true;
                        tokio::time::sleep(Duration::from_millis(hint + 200)).await;
                        last_429 = Some(error);
                        attempt -= 1;
                        continue;
                    }
                    _ => return Ok(UpstreamOutcome::RateLimited(error)),
                }
            }

            // Multi-account pool: a long hint means this account is useless
            // right now, rotate at once; otherwise give the upstream a beat.
            match hint_ms {
                Some(hint) if hint > SHORT_HINT_MS => {}
                _ => tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await,
            }
            excluded.insert(credentials.key);
            self.auth.rotate(call.group).await;
            last_429 = Some(error);
        }

        if let Some(error) = last_429 {
            return Ok(UpstreamOutcome::RateLimited(error));
        }
        if let Some(model) = call.model {
            if let Some(error) = self.quota.last_error_for(model) {
                return Ok(UpstreamOutcome::RateLimited(error));
            }
        }
        Err(AppError::Internal(
            "all accounts failed without a retryable response".to_string(),
        ))
    }

    async fn select_account(
        &self,
        call: &UpstreamCall<'_>,
        excluded: &HashSet<String>,
    ) -> AppResult<Selected> {
        let Some(model) = call.model else {
            return Ok(Selected::Credentials(
                self.auth.get_credentials(call.group).await?,
            ));
        };

        self.quota.wait_initial(Duration::from_secs(3)).await;
        let accounts = self.auth.account_keys().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ctx = PickContext {
            now_ms,
            excluded,
            cooldown_wait_threshold_ms: COOLDOWN_WAIT_THRESHOLD_MS,
        };

        let mut selection = self.quota.pick(model, &accounts, &ctx);
        if let Selection::Wait { wait_ms } = selection {
            debug!("All candidates cooling for {}; waiting {}ms", model, wait_ms);
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            let ctx = PickContext {
                now_ms: chrono::Utc::now().timestamp_millis(),
                excluded,
                cooldown_wait_threshold_ms: COOLDOWN_WAIT_THRESHOLD_MS,
            };
            selection = self.quota.pick(model, &accounts, &ctx);
        }

        match selection {
            Selection::Pick { account_index } => {
                let credentials = self.auth.get_credentials_at(account_index).await?;
                Ok(Selected::Credentials(credentials))
            }
            // A second wait counts as exhaustion: answer from the cache.
            Selection::Wait { .. } => {
                Ok(Selected::RateLimited(self.quota.fast_fail_response(model)))
            }
            Selection::FastFail(error) => Ok(Selected::RateLimited(error)),
        }
    }
}

enum Selected {
    Credentials(Credentials),
    RateLimited(CachedError),
}
