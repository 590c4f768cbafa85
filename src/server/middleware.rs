use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};

/// Key comparison that scans the full length of the longer input, so timing
/// reveals nothing about where a mismatch sits.
fn keys_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    let scan_len = expected.len().max(provided.len());

    let mismatch = (0..scan_len).fold(expected.len() ^ provided.len(), |acc, i| {
        let e = expected.get(i).copied().unwrap_or(0);
        let p = provided.get(i).copied().unwrap_or(0);
        acc | usize::from(e ^ p)
    });
    mismatch == 0
}

/// First credential found wins; the four accepted header spellings cover the
/// Anthropic and Google client families.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        return Some(value.strip_prefix("Bearer ").unwrap_or(value));
    }
    for name in ["x-api-key", "anthropic-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name).and_then(|h| h.to_str().ok()) {
            return Some(value);
        }
    }
    None
}

fn is_gated_path(path: &str) -> bool {
    path.starts_with("/v1/") || path.starts_with("/v1beta/")
}

pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if state.config.api_keys.is_empty() || !is_gated_path(request.uri().path()) {
        return next.run(request).await;
    }

    let authorized = extract_api_key(request.headers())
        .map(|provided| {
            state
                .config
                .api_keys
                .iter()
                .any(|key| keys_match(key, provided))
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"error":{"message":"Invalid API Key"}}"#))
            .expect("static 401 response")
    }
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-api-key"),
            header::HeaderName::from_static("x-goog-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_precedence_is_authorization_first() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-x".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer from-auth".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("from-auth"));
    }

    #[test]
    fn each_header_spelling_is_accepted() {
        for name in ["x-api-key", "anthropic-api-key", "x-goog-api-key"] {
            let mut headers = HeaderMap::new();
            headers.insert(name, "k1".parse().unwrap());
            assert_eq!(extract_api_key(&headers), Some("k1"), "header {}", name);
        }
    }

    #[test]
    fn bare_authorization_value_works_without_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "raw-key".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("raw-key"));
    }

    #[test]
    fn gating_applies_only_to_public_surfaces() {
        assert!(is_gated_path("/v1/messages"));
        assert!(is_gated_path("/v1beta/models"));
        assert!(!is_gated_path("/healthz"));
    }

    #[test]
    fn key_comparison_handles_length_mismatch() {
        assert!(keys_match("abc", "abc"));
        assert!(!keys_match("abc", "abd"));
        assert!(!keys_match("abc", "abcd"));
        assert!(!keys_match("", "a"));
    }
}
