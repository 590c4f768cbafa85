pub mod claude;
pub mod gemini;

use crate::quota::CachedError;
use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Hop-by-hop and length/encoding headers that must not be forwarded: the
/// body reaching the client has already been decoded and re-framed.
fn is_dropped_header(name: &str) -> bool {
    matches!(
        name,
        "content-length" | "content-encoding" | "transfer-encoding" | "connection"
    )
}

/// Streams an upstream response back to the client with identical status,
/// headers, and body.
pub fn passthrough_response(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_dropped_header(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Answers a locally decided 429 (consumed upstream body, cached error, or
/// synthesized payload) with its original status and headers.
pub fn rate_limited_response(error: CachedError) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(error.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS));
    let mut has_content_type = false;
    for (name, value) in &error.headers {
        if is_dropped_header(name.as_str()) {
            continue;
        }
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_content_type {
        builder = builder.header("Content-Type", "application/json");
    }
    builder
        .body(Body::from(error.body))
        .unwrap_or_else(|_| StatusCode::TOO_MANY_REQUESTS.into_response())
}

pub fn invalid_json_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        [("Content-Type", "application/json")],
        r#"{"error":{"message":"Invalid JSON body"}}"#,
    )
        .into_response()
}

pub fn internal_error_response(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [("Content-Type", "application/json")],
        serde_json::json!({ "error": { "message": message } }).to_string(),
    )
        .into_response()
}

pub fn sse_response(body: Body) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
