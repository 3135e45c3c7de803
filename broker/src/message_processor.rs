//! Dispatches inbound JSON-RPC frames. The broker speaks the minimal MCP
//! surface the agent CLI needs: initialize, tools/list, and tools/call for
//! the single `permission_prompt` tool.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task;

use tether_platform::ChatPlatform;

use crate::approval;
use crate::env::BrokerEnv;
use crate::jsonrpc::INVALID_PARAMS;
use crate::jsonrpc::INVALID_REQUEST;
use crate::jsonrpc::JsonRpcMessage;
use crate::jsonrpc::JsonRpcNotification;
use crate::jsonrpc::JsonRpcRequest;
use crate::jsonrpc::METHOD_NOT_FOUND;
use crate::jsonrpc::RequestId;

pub const PERMISSION_TOOL_NAME: &str = "permission_prompt";
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub(crate) struct MessageProcessor {
    outgoing: mpsc::Sender<JsonRpcMessage>,
    platform: Arc<dyn ChatPlatform>,
    env: BrokerEnv,
    allow_all_latch: Arc<AtomicBool>,
    initialized: bool,
}

impl MessageProcessor {
    pub(crate) fn new(
        outgoing: mpsc::Sender<JsonRpcMessage>,
        platform: Arc<dyn ChatPlatform>,
        env: BrokerEnv,
    ) -> Self {
        Self {
            outgoing,
            platform,
            env,
            allow_all_latch: Arc::new(AtomicBool::new(false)),
            initialized: false,
        }
    }

    pub(crate) fn process(&mut self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => self.process_request(request),
            JsonRpcMessage::Notification(notification) => {
                self.process_notification(notification)
            }
            JsonRpcMessage::Response(response) => {
                tracing::info!("<- unexpected response: {response:?}");
            }
            JsonRpcMessage::Error(error) => {
                tracing::error!("<- error: {error:?}");
            }
        }
    }

    fn process_request(&mut self, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        match method.as_str() {
            "initialize" => self.handle_initialize(id),
            "ping" => self.send(JsonRpcMessage::response(id, json!({}))),
            "tools/list" => self.handle_list_tools(id),
            "tools/call" => self.handle_call_tool(id, params),
            other => {
                tracing::warn!("unsupported method: {other}");
                self.send(JsonRpcMessage::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("method not supported: {other}"),
                ));
            }
        }
    }

    fn process_notification(&mut self, notification: JsonRpcNotification) {
        tracing::debug!("<- notification: {}", notification.method);
    }

    fn send(&self, message: JsonRpcMessage) {
        if let Err(e) = self.outgoing.try_send(message) {
            tracing::error!("failed to queue outgoing message: {e}");
        }
    }

    fn handle_initialize(&mut self, id: RequestId) {
        if self.initialized {
            self.send(JsonRpcMessage::error(
                id,
                INVALID_REQUEST,
                "initialize called more than once",
            ));
            return;
        }
        self.initialized = true;
        self.send(JsonRpcMessage::response(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "tether-broker",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ));
    }

    fn handle_list_tools(&self, id: RequestId) {
        self.send(JsonRpcMessage::response(
            id,
            json!({
                "tools": [{
                    "name": PERMISSION_TOOL_NAME,
                    "description":
                        "Ask the humans in the session thread to allow or deny a tool call.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "tool_name": { "type": "string" },
                            "input": { "type": "object" },
                        },
                        "required": ["tool_name", "input"],
                    },
                }],
            }),
        ));
    }

    fn handle_call_tool(&self, id: RequestId, params: Option<Value>) {
        let Some(params) = params else {
            self.send(JsonRpcMessage::error(id, INVALID_PARAMS, "missing params"));
            return;
        };
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        if name != PERMISSION_TOOL_NAME {
            // Tool not found: an error *result* so the model can react.
            self.send(JsonRpcMessage::response(
                id,
                json!({
                    "content": [{ "type": "text", "text": format!("Unknown tool '{name}'") }],
                    "isError": true,
                }),
            ));
            return;
        }

        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let tool_name = arguments
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = arguments.get("input").cloned().unwrap_or(json!({}));

        // The reaction wait can take minutes; never block the RPC loop.
        let outgoing = self.outgoing.clone();
        let platform = self.platform.clone();
        let env = self.env.clone();
        let latch = self.allow_all_latch.clone();
        task::spawn(async move {
            let decision =
                approval::prompt_for_permission(&platform, &env, &latch, &tool_name, input).await;
            let text = match serde_json::to_string(&decision) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to serialize decision: {e}");
                    r#"{"behavior":"deny","message":"internal error"}"#.to_string()
                }
            };
            let response = JsonRpcMessage::response(
                id,
                json!({ "content": [{ "type": "text", "text": text }] }),
            );
            if outgoing.send(response).await.is_err() {
                tracing::error!("outgoing channel closed before the decision was sent");
            }
        });
    }
}
