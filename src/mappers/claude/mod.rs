pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::*;
pub use request::{transform_claude_request, TransformedRequest};
pub use response::transform_response;
pub use streaming::{PartProcessor, StreamingState};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

pub type UpstreamByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Translates the upstream SSE byte stream into Anthropic
/// `message_start` / `content_block_*` / `message_stop` events. Idle gaps
/// surface as comment heartbeats; a truncated upstream still produces a
/// well-formed tail.
pub fn create_claude_sse_stream(
    mut upstream: UpstreamByteStream,
    trace_id: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use async_stream::stream;
    use futures::StreamExt;

    Box::pin(stream! {
        let mut state = StreamingState::new();
        let mut buffer = BytesMut::new();

        loop {
            let next_chunk =
                tokio::time::timeout(Duration::from_secs(30), upstream.next()).await;

            match next_chunk {
                Ok(Some(Ok(chunk))) => {
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
                        if let Some(chunks) = process_sse_line(line, &mut state, &trace_id) {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("[{}] Upstream stream error: {}", trace_id, e);
                    yield Err(format!("Stream error: {}", e));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }

        for chunk in emit_force_stop(&mut state) {
            yield Ok(chunk);
        }
    })
}

fn process_sse_line(line: &str, state: &mut StreamingState, trace_id: &str) -> Option<Vec<Bytes>> {
    let data_str = line.strip_prefix("data: ")?.trim();
    if data_str.is_empty() {
        return None;
    }
    if data_str == "[DONE]" {
        let chunks = emit_force_stop(state);
        return (!chunks.is_empty()).then_some(chunks);
    }

    let json_value: serde_json::Value = serde_json::from_str(data_str).ok()?;
    let raw = json_value.get("response").unwrap_or(&json_value);

    let mut chunks = Vec::new();
    if !state.message_start_sent {
        chunks.push(state.emit_message_start(raw));
    }

    if let Some(parts) = raw
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part_value in parts {
            if let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) {
                let mut processor = PartProcessor::new(state);
                chunks.extend(processor.process(&part));
            }
        }
    }

    if let Some(finish_reason) = raw
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(|f| f.as_str())
    {
        let usage = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok());
        if let Some(ref u) = usage {
            tracing::info!(
                "[{}] Stream completed | in: {} tokens | out: {} tokens",
                trace_id,
                u.prompt_token_count.unwrap_or(0),
                u.candidates_token_count.unwrap_or(0)
            );
        }
        chunks.extend(state.emit_finish(Some(finish_reason), usage.as_ref()));
    }

    (!chunks.is_empty()).then_some(chunks)
}

fn emit_force_stop(state: &mut StreamingState) -> Vec<Bytes> {
    if !state.message_stop_sent {
        let chunks = state.emit_finish(None, None);
        if !chunks.is_empty() {
            return chunks;
        }
    }
    vec![]
}
