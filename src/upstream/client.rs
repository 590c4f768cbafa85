use crate::config::AppConfig;
use crate::constants::{
    DEFAULT_OAUTH_CLIENT_ID, DEFAULT_OAUTH_CLIENT_SECRET, OAUTH_TOKEN_URL,
    TOKEN_EXPIRY_SAFETY_MS, UPSTREAM_MIN_GAP_MS, USERINFO_URL, USER_AGENT, V1_INTERNAL_BASE_URL,
};
use crate::error::{AppError, AppResult};
use crate::upstream::gate::RateGate;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry with a safety margin shaved off the advertised
    /// lifetime.
    pub fn expiry_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.expires_in * 1_000 - TOKEN_EXPIRY_SAFETY_MS
    }
}

#[derive(Debug, Clone)]
pub struct ProjectLookup {
    pub project_id: Option<String>,
    pub raw_body: String,
}

pub struct UpstreamClient {
    http: Client,
    gate: RateGate,
    base_url: String,
    oauth_client_id: String,
    oauth_client_secret: String,
}

impl UpstreamClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(USER_AGENT.as_str());

        if config.proxy_enabled && !config.proxy_url.is_empty() {
            match reqwest::Proxy::all(&config.proxy_url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    info!("Outbound proxy enabled: {}", config.proxy_url);
                }
                Err(e) => warn!("Ignoring invalid proxy URL {}: {}", config.proxy_url, e),
            }
        }

        let oauth_client_id = std::env::var("GOOGLE_OAUTH_CLIENT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OAUTH_CLIENT_ID.to_string());
        let oauth_client_secret = std::env::var("GOOGLE_OAUTH_CLIENT_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OAUTH_CLIENT_SECRET.to_string());

        Ok(Self {
            http: builder.build()?,
            gate: RateGate::new(UPSTREAM_MIN_GAP_MS),
            base_url: V1_INTERNAL_BASE_URL.to_string(),
            oauth_client_id,
            oauth_client_secret,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base_url: &str, min_gap_ms: u64) -> Self {
        Self {
            http: Client::new(),
            gate: RateGate::new(min_gap_ms),
            base_url: base_url.to_string(),
            oauth_client_id: DEFAULT_OAUTH_CLIENT_ID.to_string(),
            oauth_client_secret: DEFAULT_OAUTH_CLIENT_SECRET.to_string(),
        }
    }

    fn build_url(&self, method: &str, query: Option<&str>) -> String {
        match query {
            Some(qs) => format!("{}:{}?{}", self.base_url, method, qs),
            None => format!("{}:{}", self.base_url, method),
        }
    }

    /// Raw bearer-authenticated POST against the v1internal surface. The
    /// response is returned untouched; classification happens in the caller.
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> AppResult<Response> {
        self.gate.wait().await;

        let url = self.build_url(method, query);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .header("Accept-Encoding", "gzip")
            .json(body);
        for (key, value) in extra_headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        debug!("Upstream {} returned {}", method, response.status());
        Ok(response)
    }

    /// Fetches the account's cloudaicompanionProject through loadCodeAssist.
    /// A 200 body without a project id is not an error; the caller may fall
    /// back to synthesizing one.
    pub async fn load_project_id(&self, access_token: &str) -> AppResult<ProjectLookup> {
        let body = json!({ "metadata": { "ideType": "ANTIGRAVITY" } });
        let response = self
            .call_v1_internal("loadCodeAssist", access_token, &body, None, &HashMap::new())
            .await?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::Upstream {
                status: status.as_u16(),
                body: raw_body,
            });
        }

        let project_id = serde_json::from_str::<Value>(&raw_body)
            .ok()
            .and_then(|v| {
                v.get("cloudaicompanionProject")
                    .and_then(|p| p.as_str())
                    .map(|s| s.to_string())
            });

        Ok(ProjectLookup {
            project_id,
            raw_body,
        })
    }

    /// Model list with per-model quota info. Called in parallel for every
    /// account by the quota refresher, so it deliberately bypasses the
    /// serving lane.
    pub async fn list_models(&self, access_token: &str) -> AppResult<Value> {
        let url = self.build_url("fetchAvailableModels", None);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .header("Accept-Encoding", "gzip")
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn user_info(&self, access_token: &str) -> AppResult<Option<String>> {
        self.gate.wait().await;
        let response = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "userinfo returned {}: {}",
                status, body
            )));
        }

        let data: Value = response.json().await?;
        Ok(data
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    pub async fn exchange_auth_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> AppResult<TokenResponse> {
        self.gate.wait().await;
        let params = [
            ("client_id", self.oauth_client_id.as_str()),
            ("client_secret", self.oauth_client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];
        self.token_request(&params).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        self.gate.wait().await;
        let params = [
            ("client_id", self.oauth_client_id.as_str()),
            ("client_secret", self.oauth_client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> AppResult<TokenResponse> {
        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_with_and_without_query() {
        let config = AppConfig::default();
        let client = UpstreamClient::new(&config).expect("client");
        assert_eq!(
            client.build_url("generateContent", None),
            format!("{}:generateContent", V1_INTERNAL_BASE_URL)
        );
        assert_eq!(
            client.build_url("streamGenerateContent", Some("alt=sse")),
            format!("{}:streamGenerateContent?alt=sse", V1_INTERNAL_BASE_URL)
        );
    }

    #[test]
    fn token_expiry_applies_safety_margin() {
        let token = TokenResponse {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_in: 3600,
            token_type: Some("Bearer".to_string()),
            scope: None,
        };
        let now = chrono::Utc::now().timestamp_millis();
        let expiry = token.expiry_ms();
        let expected = now + 3_600_000 - TOKEN_EXPIRY_SAFETY_MS;
        assert!((expiry - expected).abs() < 2_000);
    }
}
