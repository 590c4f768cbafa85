pub mod handlers;
pub mod middleware;

use crate::auth::AuthManager;
use crate::config::AppConfig;
use crate::dispatch::Orchestrator;
use crate::error::{AppError, AppResult};
use crate::quota::QuotaTracker;
use axum::{
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthManager>,
    pub quota: Arc<QuotaTracker>,
    pub orchestrator: Arc<Orchestrator>,
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        // Anthropic surface
        .route("/v1/models", get(handlers::claude::handle_list_models))
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude::handle_count_tokens),
        )
        // Google surface
        .route("/v1beta/models", get(handlers::gemini::handle_list_models))
        .route(
            "/v1beta/models/:model",
            get(handlers::gemini::handle_get_model).post(handlers::gemini::handle_generate),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::api_key_middleware,
        ))
        .layer(middleware::cors_layer())
        .with_state(state)
}

pub async fn serve(state: AppState) -> AppResult<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Config(format!("failed to bind {}: {}", addr, e)))?;

    info!("Gateway listening on http://{}", addr);
    axum::serve(listener, build_router(state))
        .await
        .map_err(AppError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamClient;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state(api_keys: Vec<String>) -> AppState {
        let config = Arc::new(AppConfig {
            api_keys,
            ..AppConfig::default()
        });
        let client = Arc::new(UpstreamClient::new(&config).expect("client"));
        let auth = AuthManager::new(client.clone(), "auths-test-unused");
        let quota = QuotaTracker::new();
        let orchestrator = Orchestrator::new(auth.clone(), quota.clone(), client, 1200);
        AppState {
            config,
            auth,
            quota,
            orchestrator,
        }
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn healthz_is_open_even_with_keys_configured() {
        let app = build_router(test_state(vec!["sk-secret".to_string()]));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_yields_401_with_the_documented_body() {
        let app = build_router(test_state(vec!["sk-secret".to_string()]));
        let response = app
            .oneshot(
                Request::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_string(response).await,
            r#"{"error":{"message":"Invalid API Key"}}"#
        );
    }

    #[tokio::test]
    async fn wrong_key_is_rejected_and_right_key_is_accepted() {
        let state = test_state(vec!["sk-secret".to_string()]);

        let response = build_router(state.clone())
            .oneshot(
                Request::get("/v1/models")
                    .header("x-api-key", "sk-wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = build_router(state)
            .oneshot(
                Request::get("/v1/models")
                    .header("x-goog-api-key", "sk-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_configured_keys_means_open_access() {
        let app = build_router(test_state(vec![]));
        let response = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_json_body_yields_400() {
        let app = build_router(test_state(vec![]));
        let response = app
            .oneshot(
                Request::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Invalid JSON body"));
    }

    #[tokio::test]
    async fn cors_preflight_passes_without_a_key() {
        let app = build_router(test_state(vec!["sk-secret".to_string()]));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/messages")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn model_lists_have_the_expected_shapes() {
        let app = build_router(test_state(vec![]));
        let response = app
            .clone()
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).expect("json");
        assert!(body["data"].as_array().unwrap().len() >= 2);
        assert_eq!(body["data"][0]["type"], "model");

        let response = app
            .oneshot(Request::get("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).expect("json");
        let models = body["models"].as_array().unwrap();
        assert!(models
            .iter()
            .all(|m| m["name"].as_str().unwrap().contains("gemini")));
    }

    #[tokio::test]
    async fn gemini_model_detail_and_unknown_model_404() {
        let app = build_router(test_state(vec![]));
        let response = app
            .clone()
            .oneshot(
                Request::get("/v1beta/models/gemini-2.5-flash")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/v1beta/models/unknown-model")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn happy_path_single_account_claude_message() {
        use crate::auth::CredentialRecord;
        use axum::{extract::State as AxState, routing::post};

        #[derive(Clone)]
        struct Mock;
        async fn upstream_handler(
            AxState(_): AxState<Mock>,
            Json(_body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            Json(serde_json::json!({
                "response": {
                    "candidates": [{
                        "content": { "role": "model", "parts": [{ "text": "hello" }] },
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": { "promptTokenCount": 3, "totalTokenCount": 5 },
                    "responseId": "r1",
                    "modelVersion": "claude-sonnet-4-5"
                }
            }))
        }

        let mock = Router::new()
            .route("/v1internal:generateContent", post(upstream_handler))
            .with_state(Mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1internal", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, mock).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let record = CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expiry_ms: i64::MAX,
            token_type: Some("Bearer".to_string()),
            email: Some("solo@x.com".to_string()),
            project_id: Some("proj-1".to_string()),
            ..Default::default()
        };
        std::fs::write(
            dir.path().join(record.derived_file_name()),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let config = Arc::new(AppConfig::default());
        let client = Arc::new(UpstreamClient::new_for_test(&base_url, 0));
        let auth = AuthManager::new(client.clone(), dir.path());
        auth.load_accounts().await.unwrap();
        let quota = QuotaTracker::new();
        quota.mark_initial_complete();
        let orchestrator = Orchestrator::new(auth.clone(), quota.clone(), client, 10);
        let app = build_router(AppState {
            config,
            auth,
            quota,
            orchestrator,
        });

        let request_body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": false
        });
        let response = app
            .oneshot(
                Request::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).expect("json");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["content"][0]["type"], "text");
        assert_eq!(body["content"][0]["text"], "hello");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 3);
        assert_eq!(body["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(test_state(vec![]));
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
