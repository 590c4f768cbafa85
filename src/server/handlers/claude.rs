use crate::dispatch::{UpstreamCall, UpstreamOutcome};
use crate::mappers::claude::{
    create_claude_sse_stream, transform_claude_request, transform_response, ClaudeRequest,
    GeminiResponse,
};
use crate::mappers::gemini::{unwrap_response, wrap_envelope};
use crate::mappers::models::{model_group, CLAUDE_PUBLIC_MODELS};
use crate::server::handlers::{
    internal_error_response, invalid_json_response, passthrough_response, rate_limited_response,
    sse_response,
};
use crate::server::AppState;
use axum::{
    body::{Body, Bytes},
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// POST /v1/messages
pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected /v1/messages body: {}", e);
            return invalid_json_response();
        }
    };

    let transformed = match transform_claude_request(&request) {
        Ok(transformed) => transformed,
        Err(e) => return internal_error_response(&e.to_string()),
    };

    let trace_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let stream = request.stream;
    info!(
        "[{}] /v1/messages model={} -> {} stream={}",
        trace_id, request.model, transformed.model, stream
    );

    let (method, query) = if stream {
        ("streamGenerateContent", Some("alt=sse"))
    } else {
        ("generateContent", None)
    };

    let call = UpstreamCall {
        method,
        group: model_group(&transformed.model),
        model: Some(&transformed.model),
        query,
        headers: HashMap::new(),
    };

    let inner = transformed.request.clone();
    let model = transformed.model.clone();
    let request_type = transformed.request_type.clone();
    let outcome = state
        .orchestrator
        .call_v1_internal(call, move |project_id| {
            wrap_envelope(inner.clone(), project_id, &model, &request_type)
        })
        .await;

    match outcome {
        Err(e) => internal_error_response(&e.to_string()),
        Ok(UpstreamOutcome::RateLimited(error)) => rate_limited_response(error),
        Ok(UpstreamOutcome::Response(response)) if !response.status().is_success() => {
            passthrough_response(response)
        }
        Ok(UpstreamOutcome::Response(response)) if stream => {
            let upstream = Box::pin(response.bytes_stream());
            let claude_stream = create_claude_sse_stream(upstream, trace_id);
            sse_response(Body::from_stream(claude_stream))
        }
        Ok(UpstreamOutcome::Response(response)) => {
            let value: serde_json::Value = match response.json().await {
                Ok(value) => value,
                Err(e) => return internal_error_response(&format!("bad upstream body: {}", e)),
            };
            let unwrapped = unwrap_response(&value);
            match serde_json::from_value::<GeminiResponse>(unwrapped) {
                Ok(gemini) => Json(transform_response(&gemini)).into_response(),
                Err(e) => internal_error_response(&format!("bad upstream shape: {}", e)),
            }
        }
    }
}

/// POST /v1/messages/count_tokens
pub async fn handle_count_tokens(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected /v1/messages/count_tokens body: {}", e);
            return invalid_json_response();
        }
    };

    let transformed = match transform_claude_request(&request) {
        Ok(transformed) => transformed,
        Err(e) => return internal_error_response(&e.to_string()),
    };

    let call = UpstreamCall {
        method: "countTokens",
        group: model_group(&transformed.model),
        model: Some(&transformed.model),
        query: None,
        headers: HashMap::new(),
    };

    let inner = transformed.request.clone();
    let model = transformed.model.clone();
    let outcome = state
        .orchestrator
        .call_v1_internal(call, move |project_id| {
            // countTokens takes the bare inner request inside the envelope.
            wrap_envelope(
                json!({ "contents": inner["contents"].clone() }),
                project_id,
                &model,
                "agent",
            )
        })
        .await;

    match outcome {
        Err(e) => internal_error_response(&e.to_string()),
        Ok(UpstreamOutcome::RateLimited(error)) => rate_limited_response(error),
        Ok(UpstreamOutcome::Response(response)) if !response.status().is_success() => {
            passthrough_response(response)
        }
        Ok(UpstreamOutcome::Response(response)) => {
            let value: serde_json::Value = match response.json().await {
                Ok(value) => value,
                Err(e) => return internal_error_response(&format!("bad upstream body: {}", e)),
            };
            let unwrapped = unwrap_response(&value);
            let total = unwrapped
                .get("totalTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Json(json!({ "input_tokens": total })).into_response()
        }
    }
}

/// GET /v1/models
pub async fn handle_list_models() -> Response {
    let data: Vec<_> = CLAUDE_PUBLIC_MODELS
        .iter()
        .map(|id| {
            json!({
                "type": "model",
                "id": id,
                "display_name": id,
                "created_at": "2025-09-29T00:00:00Z"
            })
        })
        .collect();

    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": CLAUDE_PUBLIC_MODELS.first(),
        "last_id": CLAUDE_PUBLIC_MODELS.last()
    }))
    .into_response()
}
