use crate::dispatch::{UpstreamCall, UpstreamOutcome};
use crate::mappers::gemini::{
    aggregate_sse_to_json, unwrap_response, unwrap_sse_stream, wrap_envelope,
};
use crate::mappers::models::{is_pro_variant, model_group, GEMINI_PUBLIC_MODELS};
use crate::server::handlers::{
    internal_error_response, invalid_json_response, passthrough_response, rate_limited_response,
    sse_response,
};
use crate::server::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

fn model_entry(id: &str) -> Value {
    json!({
        "name": format!("models/{}", id),
        "displayName": id,
        "supportedGenerationMethods": ["generateContent", "streamGenerateContent", "countTokens"],
        "inputTokenLimit": 1_048_576,
        "outputTokenLimit": 65_536
    })
}

/// GET /v1beta/models, filtered to the Gemini family.
pub async fn handle_list_models() -> Response {
    let models: Vec<Value> = GEMINI_PUBLIC_MODELS
        .iter()
        .filter(|id| id.contains("gemini"))
        .map(|id| model_entry(id))
        .collect();
    Json(json!({ "models": models })).into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [("Content-Type", "application/json")],
        json!({ "error": { "message": message, "code": 404 } }).to_string(),
    )
        .into_response()
}

/// GET /v1beta/models/:name model detail.
pub async fn handle_get_model(Path(name): Path<String>) -> Response {
    let id = name.strip_prefix("models/").unwrap_or(&name);
    if id.contains("gemini") && GEMINI_PUBLIC_MODELS.contains(&id) {
        Json(model_entry(id)).into_response()
    } else {
        not_found(&format!("Model {} not found", name))
    }
}

/// POST /v1beta/models/:name:{generateContent|streamGenerateContent|countTokens}
///
/// Axum captures the whole `name:action` segment as one parameter; the colon
/// split happens here.
pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return not_found("Missing model action");
    };
    let model = model.strip_prefix("models/").unwrap_or(model).to_string();

    let client_body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Rejected /v1beta body: {}", e);
            return invalid_json_response();
        }
    };

    let trace_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    info!("[{}] /v1beta {}:{}", trace_id, model, action);

    match action {
        "generateContent" => {
            if is_pro_variant(&model) {
                // Pro variants only answer on the streaming surface; collect
                // the SSE into the single JSON reply the client asked for.
                generate_via_stream_aggregation(state, model, client_body).await
            } else {
                generate_plain(state, model, client_body, "generateContent", None).await
            }
        }
        "streamGenerateContent" => {
            match call_upstream(
                &state,
                &model,
                client_body,
                "streamGenerateContent",
                Some("alt=sse"),
            )
            .await
            {
                Err(response) => response,
                Ok(upstream) => {
                    let stream = unwrap_sse_stream(Box::pin(upstream.bytes_stream()));
                    sse_response(Body::from_stream(stream))
                }
            }
        }
        "countTokens" => generate_plain(state, model, client_body, "countTokens", None).await,
        other => not_found(&format!("Unsupported method {}", other)),
    }
}

/// Issues the upstream call; an Err is a ready client response (rate limit,
/// pass-through error, or internal failure).
async fn call_upstream(
    state: &AppState,
    model: &str,
    client_body: Value,
    method: &str,
    query: Option<&str>,
) -> Result<reqwest::Response, Response> {
    let call = UpstreamCall {
        method,
        group: model_group(model),
        model: Some(model),
        query,
        headers: HashMap::new(),
    };

    let model_owned = model.to_string();
    let outcome = state
        .orchestrator
        .call_v1_internal(call, move |project_id| {
            wrap_envelope(client_body.clone(), project_id, &model_owned, "agent")
        })
        .await;

    match outcome {
        Err(e) => Err(internal_error_response(&e.to_string())),
        Ok(UpstreamOutcome::RateLimited(error)) => Err(rate_limited_response(error)),
        Ok(UpstreamOutcome::Response(response)) if !response.status().is_success() => {
            Err(passthrough_response(response))
        }
        Ok(UpstreamOutcome::Response(response)) => Ok(response),
    }
}

async fn generate_plain(
    state: AppState,
    model: String,
    client_body: Value,
    method: &str,
    query: Option<&str>,
) -> Response {
    match call_upstream(&state, &model, client_body, method, query).await {
        Err(response) => response,
        Ok(upstream) => {
            let value: Value = match upstream.json().await {
                Ok(value) => value,
                Err(e) => return internal_error_response(&format!("bad upstream body: {}", e)),
            };
            Json(unwrap_response(&value)).into_response()
        }
    }
}

async fn generate_via_stream_aggregation(
    state: AppState,
    model: String,
    client_body: Value,
) -> Response {
    match call_upstream(
        &state,
        &model,
        client_body,
        "streamGenerateContent",
        Some("alt=sse"),
    )
    .await
    {
        Err(response) => response,
        Ok(upstream) => {
            match aggregate_sse_to_json(Box::pin(upstream.bytes_stream())).await {
                Ok(merged) => Json(merged).into_response(),
                Err(e) => internal_error_response(&format!("stream aggregation failed: {}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_entries_use_the_models_prefix() {
        let entry = model_entry("gemini-2.5-flash");
        assert_eq!(entry["name"], "models/gemini-2.5-flash");
    }

    #[test]
    fn action_split_uses_the_first_colon() {
        let segment = "gemini-2.5-pro:streamGenerateContent";
        let (model, action) = segment.split_once(':').unwrap();
        assert_eq!(model, "gemini-2.5-pro");
        assert_eq!(action, "streamGenerateContent");
    }
}
