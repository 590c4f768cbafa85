use crate::mappers::claude::models::*;
use serde_json::json;

/// Claude usage derived from upstream counters. The upstream sometimes
/// reports a total below the prompt count; the candidate/thought sum is the
/// fallback.
pub fn to_claude_usage(metadata: &UsageMetadata) -> Usage {
    let prompt = metadata.prompt_token_count.unwrap_or(0);
    let total = metadata.total_token_count.unwrap_or(0);
    let output_tokens = if total >= prompt && total > 0 {
        total - prompt
    } else {
        metadata.candidates_token_count.unwrap_or(0)
            + metadata.thoughts_token_count.unwrap_or(0)
    };
    Usage {
        input_tokens: prompt,
        output_tokens,
    }
}

/// Walks upstream parts in order and accumulates typed Claude blocks. Every
/// thought-signature is re-emitted in the block position it arrived in:
/// signatures on thinking parts ride their thinking block, a signature on an
/// empty text part becomes a dedicated empty thinking block (deferred to the
/// next boundary), and a signature on non-empty plain text is split out into
/// its own empty thinking block right after that text.
pub struct NonStreamingProcessor {
    content_blocks: Vec<ContentBlock>,
    text_builder: String,
    thinking_builder: String,
    thinking_signature: Option<String>,
    trailing_signature: Option<String>,
    has_tool_call: bool,
}

impl NonStreamingProcessor {
    pub fn new() -> Self {
        Self {
            content_blocks: Vec::new(),
            text_builder: String::new(),
            thinking_builder: String::new(),
            thinking_signature: None,
            trailing_signature: None,
            has_tool_call: false,
        }
    }

    pub fn process(&mut self, response: &GeminiResponse) -> ClaudeResponse {
        let empty = Vec::new();
        let parts = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| &content.parts)
            .unwrap_or(&empty);

        for part in parts {
            self.process_part(part);
        }

        self.flush_thinking();
        self.flush_text();
        if let Some(signature) = self.trailing_signature.take() {
            self.content_blocks.push(ContentBlock::Thinking {
                thinking: String::new(),
                signature: Some(signature),
            });
        }

        self.build_response(response)
    }

    fn process_part(&mut self, part: &GeminiPart) {
        let signature = part.thought_signature.clone();

        if let Some(fc) = &part.function_call {
            self.flush_thinking();
            self.flush_text();
            if let Some(trailing) = self.trailing_signature.take() {
                self.content_blocks.push(ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: Some(trailing),
                });
            }

            self.has_tool_call = true;
            let id = fc.id.clone().unwrap_or_else(|| {
                format!("{}-{}", fc.name, uuid::Uuid::new_v4().simple())
            });
            self.content_blocks.push(ContentBlock::ToolUse {
                id,
                name: fc.name.clone(),
                input: fc.args.clone().unwrap_or_else(|| json!({})),
                signature,
            });
            return;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                self.flush_text();
                if let Some(trailing) = self.trailing_signature.take() {
                    self.flush_thinking();
                    self.content_blocks.push(ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(trailing),
                    });
                }

                self.thinking_builder.push_str(text);
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
            } else {
                if text.is_empty() {
                    // Empty text carrying only a signature: held until the
                    // next boundary, emitted as its own empty thinking block.
                    if signature.is_some() {
                        self.trailing_signature = signature;
                    }
                    return;
                }

                self.flush_thinking();
                if let Some(trailing) = self.trailing_signature.take() {
                    self.flush_text();
                    self.content_blocks.push(ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(trailing),
                    });
                }

                self.text_builder.push_str(text);
                if let Some(sig) = signature {
                    self.flush_text();
                    self.content_blocks.push(ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(sig),
                    });
                }
            }
            return;
        }

        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                self.flush_thinking();
                self.text_builder.push_str(&format!(
                    "![image](data:{};base64,{})",
                    img.mime_type, img.data
                ));
                self.flush_text();
            }
        }
    }

    fn flush_text(&mut self) {
        if self.text_builder.is_empty() {
            return;
        }
        self.content_blocks.push(ContentBlock::Text {
            text: std::mem::take(&mut self.text_builder),
        });
    }

    fn flush_thinking(&mut self) {
        if self.thinking_builder.is_empty() && self.thinking_signature.is_none() {
            return;
        }
        self.content_blocks.push(ContentBlock::Thinking {
            thinking: std::mem::take(&mut self.thinking_builder),
            signature: self.thinking_signature.take(),
        });
    }

    fn build_response(&mut self, response: &GeminiResponse) -> ClaudeResponse {
        let finish_reason = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|candidate| candidate.finish_reason.as_deref());

        let stop_reason = if self.has_tool_call {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        let usage = response
            .usage_metadata
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or_default();

        ClaudeResponse {
            id: response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: response.model_version.clone().unwrap_or_default(),
            content: std::mem::take(&mut self.content_blocks),
            stop_reason: stop_reason.to_string(),
            stop_sequence: None,
            usage,
        }
    }
}

pub fn transform_response(response: &GeminiResponse) -> ClaudeResponse {
    NonStreamingProcessor::new().process(response)
}
