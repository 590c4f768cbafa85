use crate::mappers::claude::models::{FunctionCall, GeminiPart, UsageMetadata};
use crate::mappers::claude::response::to_claude_usage;
use bytes::Bytes;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    Function,
}

/// Holds the signature captured from the current thinking block until the
/// block closes, when it is emitted as a `signature_delta`.
struct SignatureManager {
    pending: Option<String>,
}

impl SignatureManager {
    fn new() -> Self {
        Self { pending: None }
    }

    fn store(&mut self, signature: Option<String>) {
        if signature.is_some() {
            self.pending = signature;
        }
    }

    fn consume(&mut self) -> Option<String> {
        self.pending.take()
    }

    fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

pub struct StreamingState {
    block_type: BlockType,
    block_index: usize,
    pub message_start_sent: bool,
    pub message_stop_sent: bool,
    used_tool: bool,
    signatures: SignatureManager,
    trailing_signature: Option<String>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            signatures: SignatureManager::new(),
            trailing_signature: None,
        }
    }

    pub fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    pub fn emit_message_start(&mut self, raw: &Value) -> Bytes {
        if self.message_start_sent {
            return Bytes::new();
        }

        let usage = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
            .map(|u| to_claude_usage(&u));

        let mut message = json!({
            "id": raw.get("responseId").and_then(|v| v.as_str()).unwrap_or("msg_unknown"),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": raw.get("modelVersion").and_then(|v| v.as_str()).unwrap_or(""),
            "stop_reason": null,
            "stop_sequence": null,
        });
        if let Some(usage) = usage {
            message["usage"] = json!(usage);
        }

        let chunk = self.emit(
            "message_start",
            json!({ "type": "message_start", "message": message }),
        );
        self.message_start_sent = true;
        chunk
    }

    pub fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }

        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        chunks
    }

    pub fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }

        let mut chunks = Vec::new();
        if self.block_type == BlockType::Thinking && self.signatures.has_pending() {
            if let Some(signature) = self.signatures.consume() {
                chunks.push(self.emit_delta("signature_delta", json!({ "signature": signature })));
            }
        }

        chunks.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block_index += 1;
        self.block_type = BlockType::None;
        chunks
    }

    pub fn emit_delta(&self, delta_type: &str, delta_content: Value) -> Bytes {
        let mut delta = json!({ "type": delta_type });
        if let Value::Object(map) = delta_content {
            for (k, v) in map {
                delta[k] = v;
            }
        }

        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    pub fn emit_finish(
        &mut self,
        finish_reason: Option<&str>,
        usage_metadata: Option<&UsageMetadata>,
    ) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        chunks.extend(self.end_block());
        chunks.extend(self.flush_trailing_signature());

        let stop_reason = if self.used_tool {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        let usage = usage_metadata.map(to_claude_usage).unwrap_or_default();
        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": usage
            }),
        ));

        if !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }

    /// Emits the stashed trailing signature as a standalone empty thinking
    /// block, closing whatever block is open first.
    fn flush_trailing_signature(&mut self) -> Vec<Bytes> {
        let Some(signature) = self.trailing_signature.take() else {
            return vec![];
        };

        let mut chunks = Vec::new();
        chunks.extend(self.end_block());
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": { "type": "thinking", "thinking": "" }
            }),
        ));
        chunks.push(self.emit_delta("thinking_delta", json!({ "thinking": "" })));
        chunks.push(self.emit_delta("signature_delta", json!({ "signature": signature })));
        self.block_type = BlockType::Thinking;
        chunks.extend(self.end_block());
        chunks
    }

    pub fn mark_tool_used(&mut self) {
        self.used_tool = true;
    }

    pub fn current_block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn current_block_index(&self) -> usize {
        self.block_index
    }

    pub fn store_signature(&mut self, signature: Option<String>) {
        self.signatures.store(signature);
    }

    pub fn set_trailing_signature(&mut self, signature: Option<String>) {
        if signature.is_some() {
            self.trailing_signature = signature;
        }
    }

    pub fn has_trailing_signature(&self) -> bool {
        self.trailing_signature.is_some()
    }
}

pub struct PartProcessor<'a> {
    state: &'a mut StreamingState,
}

impl<'a> PartProcessor<'a> {
    pub fn new(state: &'a mut StreamingState) -> Self {
        Self { state }
    }

    pub fn process(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let signature = part.thought_signature.clone();

        if let Some(fc) = &part.function_call {
            if self.state.has_trailing_signature() {
                chunks.extend(self.state.end_block());
                chunks.extend(self.state.flush_trailing_signature());
            }
            chunks.extend(self.process_function_call(fc, signature));
            return chunks;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                chunks.extend(self.process_thinking(text, signature));
            } else {
                chunks.extend(self.process_text(text, signature));
            }
            return chunks;
        }

        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                let markdown = format!("![image](data:{};base64,{})", img.mime_type, img.data);
                chunks.extend(self.process_text(&markdown, None));
            }
        }
        chunks
    }

    fn process_thinking(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.state.has_trailing_signature() {
            chunks.extend(self.state.end_block());
            chunks.extend(self.state.flush_trailing_signature());
        }

        if self.state.current_block_type() != BlockType::Thinking {
            chunks.extend(self.state.start_block(
                BlockType::Thinking,
                json!({ "type": "thinking", "thinking": "" }),
            ));
        }

        if !text.is_empty() {
            chunks.push(
                self.state
                    .emit_delta("thinking_delta", json!({ "thinking": text })),
            );
        }
        self.state.store_signature(signature);
        chunks
    }

    fn process_text(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if text.is_empty() {
            // A bare signature on empty text waits for the next boundary.
            self.state.set_trailing_signature(signature);
            return chunks;
        }

        if self.state.has_trailing_signature() {
            chunks.extend(self.state.end_block());
            chunks.extend(self.state.flush_trailing_signature());
        }

        if let Some(sig) = signature {
            // Non-empty plain text carrying a signature: the text gets its
            // own closed block, then a dedicated empty thinking block holds
            // the signature in place.
            chunks.extend(
                self.state
                    .start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
            );
            chunks.push(self.state.emit_delta("text_delta", json!({ "text": text })));
            chunks.extend(self.state.end_block());
            self.state.set_trailing_signature(Some(sig));
            chunks.extend(self.state.flush_trailing_signature());
            return chunks;
        }

        if self.state.current_block_type() != BlockType::Text {
            chunks.extend(
                self.state
                    .start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
            );
        }
        chunks.push(self.state.emit_delta("text_delta", json!({ "text": text })));
        chunks
    }

    fn process_function_call(&mut self, fc: &FunctionCall, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        self.state.mark_tool_used();

        let tool_id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", fc.name, uuid::Uuid::new_v4().simple()));

        let mut tool_use = json!({
            "type": "tool_use",
            "id": tool_id,
            "name": fc.name,
            "input": {}
        });
        if let Some(sig) = &signature {
            tool_use["signature"] = json!(sig);
        }

        chunks.extend(self.state.start_block(BlockType::Function, tool_use));
        if let Some(args) = &fc.args {
            // The whole argument object travels as one input_json_delta.
            let json_str = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            chunks.push(
                self.state
                    .emit_delta("input_json_delta", json!({ "partial_json": json_str })),
            );
        }
        chunks.extend(self.state.end_block());
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(value: serde_json::Value) -> GeminiPart {
        serde_json::from_value(value).expect("part")
    }

    fn render(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    fn events(output: &str) -> Vec<String> {
        output
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn emit_produces_sse_framing() {
        let state = StreamingState::new();
        let chunk = state.emit("ping", json!({"a": 1}));
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("event: ping\ndata: "));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn text_flows_through_one_block() {
        let mut state = StreamingState::new();
        let mut chunks = Vec::new();
        for word in ["hel", "lo"] {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(json!({ "text": word }))));
        }
        chunks.extend(state.emit_finish(Some("STOP"), None));

        let output = render(&chunks);
        assert_eq!(
            events(&output),
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(output.contains(r#""stop_reason":"end_turn""#));
    }

    #[test]
    fn thinking_signature_emits_before_block_stop() {
        let mut state = StreamingState::new();
        let mut chunks = Vec::new();
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(
                json!({ "text": "hm", "thought": true, "thoughtSignature": "SIG" }),
            )));
        }
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(json!({ "text": "answer" }))));
        }
        chunks.extend(state.emit_finish(Some("STOP"), None));

        let output = render(&chunks);
        let sig_pos = output.find("signature_delta").expect("signature delta");
        let stop_pos = output.find("content_block_stop").expect("block stop");
        assert!(sig_pos < stop_pos, "signature must precede the block stop");
        assert!(output.contains(r#""signature":"SIG""#));
    }

    #[test]
    fn trailing_signature_then_function_call_matches_contract() {
        // The mandated edge case: {text:"", thoughtSignature:"SIG1"} then a
        // functionCall. The client must see an empty thinking block carrying
        // SIG1, then the tool_use, then stop_reason tool_use.
        let mut state = StreamingState::new();
        let mut chunks = Vec::new();
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(
                json!({ "text": "", "thoughtSignature": "SIG1" }),
            )));
        }
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(
                json!({ "functionCall": { "name": "x", "args": {}, "id": "t1" } }),
            )));
        }
        chunks.extend(state.emit_finish(None, None));

        let output = render(&chunks);
        let thinking_pos = output.find(r#""type":"thinking""#).expect("thinking block");
        let sig_pos = output.find(r#""signature":"SIG1""#).expect("SIG1");
        let tool_pos = output.find(r#""name":"x""#).expect("tool_use");
        assert!(thinking_pos < sig_pos && sig_pos < tool_pos);
        assert!(output.contains(r#""id":"t1""#));
        assert!(output.contains(r#""stop_reason":"tool_use""#));
    }

    #[test]
    fn non_empty_text_with_signature_gets_a_dedicated_thinking_block() {
        let mut state = StreamingState::new();
        let mut chunks = Vec::new();
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(
                json!({ "text": "visible", "thoughtSignature": "SIG" }),
            )));
        }
        chunks.extend(state.emit_finish(Some("STOP"), None));

        let output = render(&chunks);
        let text_stop = output.find("content_block_stop").expect("text closes");
        let sig = output.find(r#""signature":"SIG""#).expect("signature");
        assert!(text_stop < sig);
        assert_eq!(output.matches("content_block_start").count(), 2);
    }

    #[test]
    fn indices_increase_across_blocks() {
        let mut state = StreamingState::new();
        let mut chunks = Vec::new();
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(json!({ "text": "think", "thought": true }))));
        }
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(json!({ "text": "say" }))));
        }
        {
            let mut processor = PartProcessor::new(&mut state);
            chunks.extend(processor.process(&part(
                json!({ "functionCall": { "name": "f", "args": {"a": 1}, "id": "t1" } }),
            )));
        }
        chunks.extend(state.emit_finish(None, None));

        let output = render(&chunks);
        assert!(output.contains(r#""index":0"#));
        assert!(output.contains(r#""index":1"#));
        assert!(output.contains(r#""index":2"#));
        assert_eq!(state.current_block_index(), 3);
    }

    #[test]
    fn tool_arguments_travel_as_a_single_input_json_delta() {
        let mut state = StreamingState::new();
        let mut processor = PartProcessor::new(&mut state);
        let chunks = processor.process(&part(json!({
            "functionCall": { "name": "grep", "args": { "pattern": "x", "path": "." }, "id": "t1" }
        })));

        let output = render(&chunks);
        assert_eq!(output.matches("input_json_delta").count(), 1);
        assert!(output.contains(r#"\"pattern\":\"x\""#));
    }

    #[test]
    fn usage_in_message_delta_follows_the_total_minus_prompt_rule() {
        let mut state = StreamingState::new();
        let usage = UsageMetadata {
            prompt_token_count: Some(3),
            candidates_token_count: Some(9),
            thoughts_token_count: None,
            total_token_count: Some(5),
        };
        let chunks = state.emit_finish(Some("STOP"), Some(&usage));
        let output = render(&chunks);
        assert!(output.contains(r#""input_tokens":3"#));
        assert!(output.contains(r#""output_tokens":2"#));
    }
}
