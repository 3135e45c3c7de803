//! Wire format of the agent CLI's stream-json interface.
//!
//! Inbound: one JSON object per stdout line, discriminated by `type`. The
//! adapter hands raw values to the interpreter; the typed views here are
//! lenient so one unknown field never drops an event (unparseable events
//! fall back to [`AgentEvent::Other`]).
//!
//! Outbound: user messages and tool results written to the agent's stdin,
//! also one JSON object per line.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    System(SystemEvent),
    Assistant(AssistantEnvelope),
    User(UserEnvelope),
    Result(ResultEvent),
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    System(SystemEvent),
    Assistant(AssistantEnvelope),
    /// Echoed user-side items; carries mirrored `tool_result` blocks.
    User(UserEnvelope),
    Result(ResultEvent),
    /// Anything we do not model. Kept raw for debug logging.
    Other(Value),
}

impl AgentEvent {
    pub fn parse(value: Value) -> AgentEvent {
        match serde_json::from_value::<WireEvent>(value.clone()) {
            Ok(WireEvent::System(e)) => AgentEvent::System(e),
            Ok(WireEvent::Assistant(e)) => AgentEvent::Assistant(e),
            Ok(WireEvent::User(e)) => AgentEvent::User(e),
            Ok(WireEvent::Result(e)) => AgentEvent::Result(e),
            Err(_) => AgentEvent::Other(value),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Populated for `subtype: "error"`.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub compact_metadata: Option<CompactMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompactMetadata {
    /// "manual" or "auto".
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub pre_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEnvelope {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEnvelope {
    pub message: UserMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or nested block array depending on the tool.
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<UsagePayload>,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: Option<HashMap<String, ModelUsage>>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsagePayload {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Per-model usage; field names follow the agent's camelCase wire format.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelUsage {
    #[serde(default, rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(default, rename = "cacheReadInputTokens")]
    pub cache_read_input_tokens: u64,
    #[serde(default, rename = "cacheCreationInputTokens")]
    pub cache_creation_input_tokens: u64,
    #[serde(default, rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(default, rename = "contextWindow")]
    pub context_window: Option<u64>,
}

// ---------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------

/// `{type:"user"}` message with plain text content.
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
}

/// `{type:"user"}` message with structured content blocks (text + images).
pub fn user_message_blocks(blocks: Vec<Value>) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": blocks },
    })
}

pub fn text_block(text: &str) -> Value {
    json!({ "type": "text", "text": text })
}

pub fn image_block(mime_type: &str, data: &[u8]) -> Value {
    json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": mime_type,
            "data": BASE64.encode(data),
        },
    })
}

/// Extract `(media_type, bytes)` from an image block previously built with
/// [`image_block`].
pub fn parse_image_block(block: &Value) -> Option<(String, Vec<u8>)> {
    let source = block.get("source")?;
    let mime = source.get("media_type")?.as_str()?.to_string();
    let data = BASE64.decode(source.get("data")?.as_str()?).ok()?;
    Some((mime, data))
}

pub fn tool_result_message(tool_use_id: &str, content: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_assistant_text_and_tool_use() {
        let v = json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "text", "text": "hello" },
                { "type": "tool_use", "id": "t1", "name": "Read",
                  "input": { "file_path": "/tmp/a" } },
                { "type": "banana", "peel": true },
            ]},
        });
        match AgentEvent::parse(v) {
            AgentEvent::Assistant(env) => {
                assert_eq!(env.message.content.len(), 3);
                assert!(matches!(env.message.content[0], ContentBlock::Text { .. }));
                assert!(matches!(
                    env.message.content[1],
                    ContentBlock::ToolUse { .. }
                ));
                assert!(matches!(env.message.content[2], ContentBlock::Unknown));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_compact_boundary() {
        let v = json!({
            "type": "system",
            "subtype": "compact_boundary",
            "compact_metadata": { "trigger": "auto", "pre_tokens": 155000 },
        });
        match AgentEvent::parse(v) {
            AgentEvent::System(e) => {
                assert_eq!(e.subtype, "compact_boundary");
                let meta = e.compact_metadata.unwrap();
                assert_eq!(meta.trigger, "auto");
                assert_eq!(meta.pre_tokens, 155000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_result_usage() {
        let v = json!({
            "type": "result",
            "total_cost_usd": 0.42,
            "usage": { "input_tokens": 10, "cache_read_input_tokens": 90 },
            "modelUsage": {
                "claude-opus-4-5-20251101": {
                    "inputTokens": 10, "outputTokens": 20,
                    "cacheReadInputTokens": 90, "cacheCreationInputTokens": 5,
                    "costUSD": 0.4, "contextWindow": 200000
                }
            },
        });
        match AgentEvent::parse(v) {
            AgentEvent::Result(e) => {
                assert_eq!(e.total_cost_usd, Some(0.42));
                assert_eq!(e.usage.unwrap().cache_read_input_tokens, 90);
                let mu = e.model_usage.unwrap();
                assert_eq!(mu["claude-opus-4-5-20251101"].output_tokens, 20);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_becomes_other() {
        let v = json!({ "type": "telemetry", "x": 1 });
        assert!(matches!(AgentEvent::parse(v), AgentEvent::Other(_)));
    }

    #[test]
    fn image_block_round_trips_mime_and_bytes() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let block = image_block("image/png", &bytes);
        let (mime, decoded) = parse_image_block(&block).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(decoded.len(), bytes.len());
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn outbound_shapes() {
        let m = user_message("hi");
        assert_eq!(m["type"], "user");
        assert_eq!(m["message"]["content"], "hi");

        let tr = tool_result_message("t9", "Approved");
        assert_eq!(tr["message"]["content"][0]["tool_use_id"], "t9");
        assert_eq!(tr["message"]["content"][0]["type"], "tool_result");
    }
}
