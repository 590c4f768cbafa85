use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;

pub type UpstreamByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Wraps an inner request into the v1internal envelope. Called once per
/// attempt so every attempt carries a fresh requestId and the selected
/// account's project.
pub fn wrap_envelope(request: Value, project_id: &str, model: &str, request_type: &str) -> Value {
    json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": request,
        "model": model,
        "userAgent": "antigravity",
        "requestType": request_type,
    })
}

/// The upstream nests the native payload under `response`; bare chunks pass
/// through unchanged.
pub fn unwrap_response(value: &Value) -> Value {
    value.get("response").unwrap_or(value).clone()
}

/// Rewrites the upstream SSE stream for the Google-compatible surface:
/// each `data:` line is unwrapped so clients see native chunks.
pub fn unwrap_sse_stream(
    mut upstream: UpstreamByteStream,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use async_stream::stream;
    use futures::StreamExt;

    Box::pin(stream! {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                            continue;
                        };
                        let line = line_str.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Some(data) = line.strip_prefix("data: ") else {
                            yield Ok(Bytes::from(format!("{}\n\n", line)));
                            continue;
                        };
                        match serde_json::from_str::<Value>(data) {
                            Ok(value) => {
                                let unwrapped = unwrap_response(&value);
                                yield Ok(Bytes::from(format!("data: {}\n\n", unwrapped)));
                            }
                            Err(_) => {
                                yield Ok(Bytes::from(format!("data: {}\n\n", data)));
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(format!("Stream error: {}", e));
                    break;
                }
            }
        }
    })
}

/// Collapses an upstream SSE stream into one native JSON reply, for pro
/// variants where the upstream must stream but the client asked for a
/// non-streaming method. Within the merged candidate, consecutive plain-text
/// parts fuse into one and consecutive thought parts fuse into one, keeping
/// the latest non-empty signature.
pub async fn aggregate_sse_to_json(mut upstream: UpstreamByteStream) -> Result<Value, String> {
    use futures::StreamExt;

    let mut buffer = BytesMut::new();
    let mut merged_parts: Vec<Value> = Vec::new();
    let mut finish_reason: Option<Value> = None;
    let mut usage_metadata: Option<Value> = None;
    let mut response_id: Option<Value> = None;
    let mut model_version: Option<Value> = None;

    let mut ingest = |data: &str,
                      merged_parts: &mut Vec<Value>,
                      finish_reason: &mut Option<Value>,
                      usage_metadata: &mut Option<Value>,
                      response_id: &mut Option<Value>,
                      model_version: &mut Option<Value>| {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let chunk = unwrap_response(&value);

        if response_id.is_none() {
            *response_id = chunk.get("responseId").cloned();
        }
        if model_version.is_none() {
            *model_version = chunk.get("modelVersion").cloned();
        }
        if let Some(usage) = chunk.get("usageMetadata") {
            *usage_metadata = Some(usage.clone());
        }

        let Some(candidate) = chunk.get("candidates").and_then(|c| c.get(0)) else {
            return;
        };
        if let Some(reason) = candidate.get("finishReason").filter(|r| !r.is_null()) {
            *finish_reason = Some(reason.clone());
        }
        let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        else {
            return;
        };

        for part in parts {
            merge_part(merged_parts, part);
        }
    };

    while let Some(chunk) = upstream.next().await {
        let chunk = chunk.map_err(|e| format!("Stream error: {}", e))?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line_raw = buffer.split_to(pos + 1);
            let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                continue;
            };
            let line = line_str.trim();
            if let Some(data) = line.strip_prefix("data: ") {
                ingest(
                    data,
                    &mut merged_parts,
                    &mut finish_reason,
                    &mut usage_metadata,
                    &mut response_id,
                    &mut model_version,
                );
            }
        }
    }

    let mut candidate = json!({
        "content": { "role": "model", "parts": merged_parts },
        "index": 0
    });
    if let Some(reason) = finish_reason {
        candidate["finishReason"] = reason;
    }

    let mut result = json!({ "candidates": [candidate] });
    if let Some(usage) = usage_metadata {
        result["usageMetadata"] = usage;
    }
    if let Some(id) = response_id {
        result["responseId"] = id;
    }
    if let Some(model) = model_version {
        result["modelVersion"] = model;
    }
    Ok(result)
}

fn merge_part(merged: &mut Vec<Value>, part: &Value) {
    let is_thought = part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false);
    let text = part.get("text").and_then(|t| t.as_str());
    let is_plain_text = text.is_some()
        && !is_thought
        && part.get("functionCall").is_none()
        && part.get("inlineData").is_none();
    let is_thought_text = text.is_some() && is_thought;

    if let Some(last) = merged.last_mut() {
        let last_is_thought = last
            .get("thought")
            .and_then(|t| t.as_bool())
            .unwrap_or(false);
        let last_is_plain = last.get("text").is_some()
            && !last_is_thought
            && last.get("functionCall").is_none()
            && last.get("inlineData").is_none();

        if is_plain_text && last_is_plain {
            let combined = format!(
                "{}{}",
                last.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                text.unwrap_or("")
            );
            last["text"] = json!(combined);
            return;
        }

        if is_thought_text && last_is_thought && last.get("text").is_some() {
            let combined = format!(
                "{}{}",
                last.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                text.unwrap_or("")
            );
            last["text"] = json!(combined);
            if let Some(signature) = part
                .get("thoughtSignature")
                .and_then(|s| s.as_str())
                .filter(|s| !s.is_empty())
            {
                last["thoughtSignature"] = json!(signature);
            }
            return;
        }
    }

    merged.push(part.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn envelope_carries_project_and_fresh_request_id() {
        let inner = json!({ "contents": [] });
        let first = wrap_envelope(inner.clone(), "proj-1", "gemini-2.5-pro", "agent");
        let second = wrap_envelope(inner, "proj-1", "gemini-2.5-pro", "agent");

        assert_eq!(first["project"], "proj-1");
        assert_eq!(first["model"], "gemini-2.5-pro");
        assert_eq!(first["userAgent"], "antigravity");
        assert_eq!(first["requestType"], "agent");
        assert!(first["requestId"].as_str().unwrap().starts_with("agent-"));
        assert_ne!(first["requestId"], second["requestId"]);
    }

    #[test]
    fn unwrap_prefers_the_nested_response() {
        let wrapped = json!({ "response": { "candidates": [] } });
        assert!(unwrap_response(&wrapped).get("candidates").is_some());

        let bare = json!({ "candidates": [] });
        assert_eq!(unwrap_response(&bare), bare);
    }

    fn sse(chunks: Vec<Value>) -> UpstreamByteStream {
        Box::pin(futures::stream::iter(chunks.into_iter().map(|c| {
            Ok::<Bytes, reqwest::Error>(Bytes::from(format!("data: {}\n\n", c)))
        })))
    }

    #[tokio::test]
    async fn sse_lines_are_unwrapped_in_place() {
        let stream = sse(vec![json!({
            "response": { "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }] }
        })]);
        let mut out = unwrap_sse_stream(stream);
        let chunk = out.next().await.expect("chunk").expect("bytes");
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("data: {"));
        assert!(!text.contains("\"response\""));
        assert!(text.contains("\"hi\""));
    }

    #[tokio::test]
    async fn aggregation_merges_consecutive_text_parts() {
        let stream = sse(vec![
            json!({ "response": {
                "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }],
                "responseId": "r1", "modelVersion": "gemini-2.5-pro"
            }}),
            json!({ "response": {
                "candidates": [{
                    "content": { "parts": [{ "text": "lo" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 1, "totalTokenCount": 4 }
            }}),
        ]);

        let merged = aggregate_sse_to_json(stream).await.expect("aggregate");
        let parts = merged["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "Hello");
        assert_eq!(merged["candidates"][0]["finishReason"], "STOP");
        assert_eq!(merged["responseId"], "r1");
        assert_eq!(merged["usageMetadata"]["totalTokenCount"], 4);
    }

    #[tokio::test]
    async fn aggregation_merges_thoughts_keeping_latest_signature() {
        let stream = sse(vec![
            json!({ "candidates": [{ "content": { "parts": [
                { "text": "think ", "thought": true, "thoughtSignature": "OLD" }
            ]}}]}),
            json!({ "candidates": [{ "content": { "parts": [
                { "text": "more", "thought": true, "thoughtSignature": "NEW" }
            ]}}]}),
            json!({ "candidates": [{ "content": { "parts": [
                { "text": "done", "thought": true, "thoughtSignature": "" }
            ]}}]}),
        ]);

        let merged = aggregate_sse_to_json(stream).await.expect("aggregate");
        let parts = merged["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "think moredone");
        assert_eq!(parts[0]["thoughtSignature"], "NEW");
    }

    #[tokio::test]
    async fn aggregation_keeps_text_and_thought_runs_separate() {
        let stream = sse(vec![json!({ "candidates": [{ "content": { "parts": [
            { "text": "think", "thought": true },
            { "text": "say" },
            { "functionCall": { "name": "f", "args": {} } },
            { "text": "after" }
        ]}}]})]);

        let merged = aggregate_sse_to_json(stream).await.expect("aggregate");
        let parts = merged["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[1]["text"], "say");
        assert!(parts[2].get("functionCall").is_some());
        assert_eq!(parts[3]["text"], "after");
    }
}
