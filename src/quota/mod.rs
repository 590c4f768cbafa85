use crate::auth::AuthManager;
use crate::upstream::UpstreamClient;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Latest known quota state for one (model, account) pair.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub remaining_percent: Option<u8>,
    pub reset_time_ms: Option<i64>,
    pub updated_at_ms: i64,
    pub cooldown_until_ms: i64,
}

/// A 429 retained verbatim so exhaustion can be answered without an
/// upstream round-trip.
#[derive(Debug, Clone)]
pub struct CachedError {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedError {
    pub fn synthesized_429() -> Self {
        Self {
            status: 429,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: json!({
                "error": {
                    "message": "All accounts are rate limited or out of quota for this model",
                    "status": "RESOURCE_EXHAUSTED",
                    "code": 429
                }
            })
            .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Selection {
    Pick { account_index: usize },
    Wait { wait_ms: u64 },
    FastFail(CachedError),
}

pub struct PickContext<'a> {
    pub now_ms: i64,
    pub excluded: &'a HashSet<String>,
    pub cooldown_wait_threshold_ms: u64,
}

pub struct QuotaTracker {
    per_model: DashMap<String, HashMap<String, Snapshot>>,
    last_error: DashMap<String, CachedError>,
    next_start: DashMap<String, usize>,
    initial_tx: watch::Sender<bool>,
    initial_rx: watch::Receiver<bool>,
}

impl QuotaTracker {
    pub fn new() -> Arc<Self> {
        let (initial_tx, initial_rx) = watch::channel(false);
        Arc::new(Self {
            per_model: DashMap::new(),
            last_error: DashMap::new(),
            next_start: DashMap::new(),
            initial_tx,
            initial_rx,
        })
    }

    /// Blocks (bounded) until the first snapshot pass finished. Serving never
    /// waits longer than the given timeout.
    pub async fn wait_initial(&self, timeout: Duration) {
        let mut rx = self.initial_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    break;
                }
            }
        })
        .await;
    }

    #[cfg(test)]
    pub(crate) fn mark_initial_complete(&self) {
        let _ = self.initial_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn set_snapshot_for_test(
        &self,
        model: &str,
        account_key: &str,
        snapshot: Snapshot,
    ) {
        self.per_model
            .entry(model.to_string())
            .or_default()
            .insert(account_key.to_string(), snapshot);
    }

    pub fn snapshot_for(&self, model: &str, account_key: &str) -> Option<Snapshot> {
        self.per_model
            .get(model)
            .and_then(|m| m.get(account_key).cloned())
    }

    pub fn last_error_for(&self, model: &str) -> Option<CachedError> {
        self.last_error.get(model).map(|e| e.clone())
    }

    /// Records a 429 for (model, account): the body becomes the model's
    /// cached error and the account enters cooldown for
    /// `max(0, hint ?? fixed_delay)`.
    pub fn note_rate_limited(
        &self,
        model: &str,
        account_key: &str,
        now_ms: i64,
        hint_ms: Option<u64>,
        fixed_delay_ms: u64,
        error: CachedError,
    ) {
        let cooldown_ms = hint_ms.unwrap_or(fixed_delay_ms);
        let mut models = self.per_model.entry(model.to_string()).or_default();
        let snapshot = models.entry(account_key.to_string()).or_default();
        snapshot.cooldown_until_ms = now_ms + cooldown_ms as i64;
        drop(models);

        self.last_error.insert(model.to_string(), error);
        debug!(
            "Cooldown for ({}, {}) until now+{}ms",
            model, account_key, cooldown_ms
        );
    }

    /// Ingests one account's fetchAvailableModels payload.
    pub fn apply_models_payload(&self, account_key: &str, payload: &Value, now_ms: i64) {
        let Some(models) = payload.get("models").and_then(|m| m.as_array()) else {
            return;
        };

        for model in models {
            let Some(id) = model
                .get("name")
                .or_else(|| model.get("id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let id = id.strip_prefix("models/").unwrap_or(id);

            let Some(quota_info) = model.get("quotaInfo") else {
                continue;
            };

            let remaining_percent = quota_info
                .get("remainingFraction")
                .and_then(|v| v.as_f64())
                .map(|fraction| (fraction * 100.0).round().clamp(0.0, 100.0) as u8);
            let reset_time_ms = quota_info
                .get("resetTime")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp_millis());

            let mut models_map = self.per_model.entry(id.to_string()).or_default();
            let snapshot = models_map.entry(account_key.to_string()).or_default();
            snapshot.remaining_percent = remaining_percent;
            snapshot.reset_time_ms = reset_time_ms;
            snapshot.updated_at_ms = now_ms;
        }
    }

    /// Selects exactly one of pick / wait / fast-fail for the model given
    /// the pool's (index, key) pairs in rotation order.
    pub fn pick(
        &self,
        model: &str,
        accounts: &[(usize, String)],
        ctx: &PickContext<'_>,
    ) -> Selection {
        let snapshots = self
            .per_model
            .get(model)
            .map(|m| m.clone())
            .unwrap_or_default();

        if !accounts.is_empty() {
            let all_exhausted = accounts.iter().all(|(_, key)| {
                snapshots
                    .get(key)
                    .and_then(|s| s.remaining_percent)
                    .is_some_and(|p| p == 0)
            });
            if all_exhausted {
                return Selection::FastFail(self.fast_fail_response(model));
            }
        }

        let candidates: Vec<&(usize, String)> = accounts
            .iter()
            .filter(|(_, key)| !ctx.excluded.contains(key))
            .collect();
        if candidates.is_empty() {
            return Selection::FastFail(self.fast_fail_response(model));
        }

        let mut eligible = Vec::new();
        let mut nearest_cooldown_end: Option<i64> = None;
        for entry in &candidates {
            let snapshot = snapshots.get(&entry.1);
            let exhausted = snapshot
                .and_then(|s| s.remaining_percent)
                .is_some_and(|p| p == 0);
            if exhausted {
                continue;
            }
            let cooldown_until = snapshot.map(|s| s.cooldown_until_ms).unwrap_or(0);
            if cooldown_until > ctx.now_ms {
                nearest_cooldown_end = Some(match nearest_cooldown_end {
                    Some(current) => current.min(cooldown_until),
                    None => cooldown_until,
                });
                continue;
            }
            eligible.push((entry.0, entry.1.as_str(), snapshot.cloned()));
        }

        if eligible.is_empty() {
            if let Some(end) = nearest_cooldown_end {
                let wait_ms = (end - ctx.now_ms).max(0) as u64;
                if wait_ms <= ctx.cooldown_wait_threshold_ms {
                    return Selection::Wait { wait_ms };
                }
            }
            return Selection::FastFail(self.fast_fail_response(model));
        }

        // Prefer accounts with known positive remaining quota; among them the
        // maximum wins. Unknown-quota accounts are the fallback tier.
        let best_known = eligible
            .iter()
            .filter_map(|(_, _, s)| s.as_ref().and_then(|s| s.remaining_percent))
            .filter(|p| *p > 0)
            .max();

        let finalists: Vec<usize> = match best_known {
            Some(best) => eligible
                .iter()
                .filter(|(_, _, s)| {
                    s.as_ref().and_then(|s| s.remaining_percent) == Some(best)
                })
                .map(|(idx, _, _)| *idx)
                .collect(),
            None => eligible
                .iter()
                .filter(|(_, _, s)| s.as_ref().and_then(|s| s.remaining_percent).is_none())
                .map(|(idx, _, _)| *idx)
                .collect(),
        };

        if finalists.is_empty() {
            return Selection::FastFail(self.fast_fail_response(model));
        }

        // Round-robin among finalists starting at the model's cursor.
        let cursor = self.next_start.get(model).map(|c| *c).unwrap_or(0);
        let chosen = finalists
            .iter()
            .copied()
            .find(|idx| *idx >= cursor)
            .unwrap_or(finalists[0]);
        self.next_start.insert(model.to_string(), chosen + 1);

        Selection::Pick {
            account_index: chosen,
        }
    }

    pub fn fast_fail_response(&self, model: &str) -> CachedError {
        self.last_error_for(model)
            .unwrap_or_else(CachedError::synthesized_429)
    }

    /// Background snapshot loop: waits briefly for accounts to load, runs an
    /// initial pass, then refreshes every `interval_s`. Passes never overlap
    /// and serving never blocks on them.
    pub fn start_refresher(
        self: &Arc<Self>,
        auth: Arc<AuthManager>,
        client: Arc<UpstreamClient>,
        interval_s: u64,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            while auth.pool_len().await == 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            tracker.refresh_all(&auth, &client).await;
            let _ = tracker.initial_tx.send(true);
            info!("Initial quota snapshot pass completed");

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.refresh_all(&auth, &client).await;
            }
        });
    }

    async fn refresh_all(&self, auth: &Arc<AuthManager>, client: &Arc<UpstreamClient>) {
        let keys = auth.account_keys().await;
        if keys.is_empty() {
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let tasks = keys.into_iter().map(|(idx, key)| {
            let auth = auth.clone();
            let client = client.clone();
            async move {
                let (token, key) = match auth.access_token_at(idx).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Quota refresh skipped for {}: {}", key, e);
                        return None;
                    }
                };
                match client.list_models(&token).await {
                    Ok(payload) => Some((key, payload)),
                    Err(e) => {
                        warn!("fetchAvailableModels failed for {}: {}", key, e);
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(tasks).await;
        let mut updated = 0usize;
        for (key, payload) in results.into_iter().flatten() {
            self.apply_models_payload(&key, &payload, now_ms);
            updated += 1;
        }
        debug!("Quota snapshots updated for {} account(s)", updated);
    }
}
