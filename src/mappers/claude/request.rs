use crate::constants::{FLASH_THINKING_BUDGET_CAP, MAX_OUTPUT_TOKENS};
use crate::error::AppResult;
use crate::mappers::claude::models::*;
use crate::mappers::models::{is_flash_variant, map_claude_model, WEB_SEARCH_MODEL};
use crate::mappers::schema::clean_tool_schema;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Inner upstream request plus the routing facts the caller needs for the
/// envelope.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub request: Value,
    pub model: String,
    pub request_type: String,
}

const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

pub fn transform_claude_request(request: &ClaudeRequest) -> AppResult<TransformedRequest> {
    let wants_web_search = request.tools.iter().any(|t| t.is_web_search());
    let mapped_model = if wants_web_search {
        WEB_SEARCH_MODEL.to_string()
    } else {
        map_claude_model(&request.model).to_string()
    };
    let thinking_enabled = request
        .thinking
        .as_ref()
        .is_some_and(ThinkingConfig::is_enabled);

    let mut contents = Vec::new();
    if let Some(system) = &request.system {
        if let Some(turn) = system_turn(system) {
            contents.push(turn);
        }
    }

    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();
    for message in &request.messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let parts = build_parts(&message.content, &mut tool_id_to_name)?;
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }

    let mut inner = json!({ "contents": contents });

    if wants_web_search {
        inner["tools"] = json!([{ "googleSearch": {} }]);
    } else if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut parameters = tool.input_schema.clone().unwrap_or_else(|| json!({}));
                clean_tool_schema(&mut parameters);
                json!({
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": parameters
                })
            })
            .collect();
        inner["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    inner["generationConfig"] = generation_config(request, &mapped_model, thinking_enabled);
    inner["safetySettings"] = json!(SAFETY_CATEGORIES
        .iter()
        .map(|category| json!({ "category": category, "threshold": "OFF" }))
        .collect::<Vec<_>>());

    let request_type = if wants_web_search {
        "web_search".to_string()
    } else {
        "agent".to_string()
    };

    debug!(
        "Claude request mapped: '{}' -> '{}' ({})",
        request.model, mapped_model, request_type
    );

    Ok(TransformedRequest {
        request: inner,
        model: mapped_model,
        request_type,
    })
}

/// System prompts become a synthetic leading user turn.
fn system_turn(system: &Value) -> Option<Value> {
    let mut parts = Vec::new();
    match system {
        Value::String(text) if !text.trim().is_empty() => {
            parts.push(json!({ "text": text }));
        }
        Value::Array(blocks) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.trim().is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                }
            }
        }
        _ => {}
    }

    if parts.is_empty() {
        None
    } else {
        Some(json!({ "role": "user", "parts": parts }))
    }
}

fn build_parts(
    content: &MessageContent,
    tool_id_to_name: &mut HashMap<String, String>,
) -> AppResult<Vec<Value>> {
    let mut parts = Vec::new();
    match content {
        MessageContent::String(text) => {
            if text != "(no content)" && !text.is_empty() {
                parts.push(json!({ "text": text }));
            }
        }
        MessageContent::Array(blocks) => {
            for block in blocks {
                match block {
                    ContentBlockIn::Text { text } => {
                        if text != "(no content)" && !text.is_empty() {
                            parts.push(json!({ "text": text }));
                        }
                    }
                    ContentBlockIn::Thinking {
                        thinking,
                        signature,
                    } => {
                        let mut part = json!({ "text": thinking, "thought": true });
                        if let Some(sig) = signature {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    ContentBlockIn::RedactedThinking { data } => {
                        // The upstream has no opaque slot; carry the blob as a
                        // thought so the turn structure survives.
                        parts.push(json!({ "text": data, "thought": true }));
                    }
                    ContentBlockIn::ToolUse {
                        id,
                        name,
                        input,
                        signature,
                    } => {
                        tool_id_to_name.insert(id.clone(), name.clone());
                        let mut part = json!({
                            "functionCall": { "name": name, "args": input, "id": id }
                        });
                        if let Some(sig) = signature {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    ContentBlockIn::ToolResult {
                        tool_use_id,
                        content,
                        is_error: _,
                    } => {
                        let name = tool_id_to_name
                            .get(tool_use_id)
                            .cloned()
                            .unwrap_or_else(|| tool_use_id.clone());
                        let result = tool_result_text(content);
                        parts.push(json!({
                            "functionResponse": {
                                "name": name,
                                "response": { "result": result },
                                "id": tool_use_id
                            }
                        }));
                    }
                    ContentBlockIn::Image { source } => {
                        if source.source_type == "base64" {
                            parts.push(json!({
                                "inlineData": {
                                    "mimeType": source.media_type,
                                    "data": source.data
                                }
                            }));
                        }
                    }
                    ContentBlockIn::Unknown => {}
                }
            }
        }
    }
    Ok(parts)
}

/// Tool results arrive as a plain string or a list of blocks; block lists
/// collapse to their text joined by newlines.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn generation_config(request: &ClaudeRequest, mapped_model: &str, thinking: bool) -> Value {
    let mut config = json!({ "maxOutputTokens": MAX_OUTPUT_TOKENS });

    if let Some(temperature) = request.temperature {
        config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        config["topP"] = json!(top_p);
    }
    if let Some(top_k) = request.top_k {
        config["topK"] = json!(top_k);
    }

    if thinking {
        let mut thinking_config = json!({ "includeThoughts": true });
        if let Some(budget) = request.thinking.as_ref().and_then(|t| t.budget_tokens) {
            let capped = if is_flash_variant(mapped_model) {
                budget.min(FLASH_THINKING_BUDGET_CAP)
            } else {
                budget
            };
            thinking_config["thinkingBudget"] = json!(capped);
        }
        config["thinkingConfig"] = thinking_config;
    }

    config
}
