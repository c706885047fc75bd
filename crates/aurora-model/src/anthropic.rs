// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Direct Anthropic Messages API driver with prompt caching.
//!
//! The system prompt is sent as two blocks: the stable prefix carries a
//! `cache_control` marker, the ephemeral tail (mode warnings, RCA context)
//! is a second block without one, so only the prefix is cached.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: String,
        temperature: f32,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            temperature,
            max_tokens: 8192,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(request_timeout_secs))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": req.stream,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        // Two system blocks: stable prefix cached, ephemeral tail not.
        if !system_text.is_empty() || req.system_dynamic_suffix.is_some() {
            let mut system_blocks: Vec<Value> = Vec::new();
            if !system_text.is_empty() {
                system_blocks.push(json!({
                    "type": "text",
                    "text": system_text,
                    "cache_control": { "type": "ephemeral" },
                }));
            }
            if let Some(dynamic) = &req.system_dynamic_suffix {
                if !dynamic.trim().is_empty() {
                    system_blocks.push(json!({ "type": "text", "text": dynamic }));
                }
            }
            if !system_blocks.is_empty() {
                body["system"] = json!(system_blocks);
            }
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending anthropic completion request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let mut events: Vec<anyhow::Result<ResponseEvent>> = Vec::new();
                match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        while let Some(nl_pos) = buf.find('\n') {
                            let line = buf[..nl_pos].trim_end_matches('\r').to_string();
                            *buf = buf[nl_pos + 1..].to_string();
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                    events.push(Ok(parse_anthropic_event(&v)));
                                }
                            }
                        }
                    }
                    Err(e) => events.push(Err(anyhow::anyhow!(e))),
                }
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

pub(crate) fn parse_anthropic_event(v: &Value) -> ResponseEvent {
    match v["type"].as_str().unwrap_or("") {
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    ResponseEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
                }
                "input_json_delta" => ResponseEvent::ToolCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                },
                "thinking_delta" => {
                    let t = delta["thinking"].as_str().unwrap_or("");
                    if t.is_empty() {
                        ResponseEvent::TextDelta(String::new())
                    } else {
                        ResponseEvent::ThinkingDelta(t.to_string())
                    }
                }
                _ => ResponseEvent::TextDelta(String::new()),
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                ResponseEvent::ToolCall {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                    cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                    cache_write_tokens: usage["cache_creation_input_tokens"]
                        .as_u64()
                        .unwrap_or(0) as u32,
                }
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "message_delta" => {
            if let Some(usage) = v.get("usage") {
                ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                }
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "message_stop" => ResponseEvent::Done,
        "error" => ResponseEvent::Error(
            v["error"]["message"].as_str().unwrap_or("unknown").to_string(),
        ),
        _ => ResponseEvent::TextDelta(String::new()),
    }
}

/// Convert messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)` — Anthropic takes the
/// system message as a top-level `system` field, not a conversation turn.
pub(crate) fn build_anthropic_messages(messages: &[crate::Message]) -> (String, Vec<Value>) {
    use crate::{ContentPart, MessageContent};

    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        if m.role == Role::System {
            if let Some(t) = m.as_text() {
                system_text = t.to_string();
            }
            continue;
        }
        let role = match m.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
            Role::System => unreachable!(),
        };
        match &m.content {
            MessageContent::Text(t) => {
                out.push(json!({ "role": role, "content": t }));
            }
            MessageContent::ContentParts(parts) => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => {
                            if let Ok((mime, data)) = crate::parse_data_url_parts(image_url) {
                                json!({
                                    "type": "image",
                                    "source": {
                                        "type": "base64",
                                        "media_type": mime,
                                        "data": data,
                                    }
                                })
                            } else {
                                json!({
                                    "type": "image",
                                    "source": { "type": "url", "url": image_url }
                                })
                            }
                        }
                    })
                    .collect();
                out.push(json!({ "role": role, "content": content }));
            }
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } => {
                // tool_use.id must match `^[a-zA-Z0-9_-]+$`; an empty id
                // would 400 the request, so substitute a stable fallback.
                let safe_id = if tool_call_id.is_empty() {
                    warn!(tool_name = %function.name, "empty tool_call_id; substituting fallback");
                    "tc_fallback".to_string()
                } else {
                    tool_call_id.clone()
                };
                out.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": safe_id,
                        "name": function.name,
                        "input": serde_json::from_str::<Value>(&function.arguments)
                            .unwrap_or(json!({})),
                    }]
                }));
            }
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                    }]
                }));
            }
        }
    }
    (system_text, out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionCall, Message, MessageContent};

    #[test]
    fn system_message_is_lifted_out() {
        let msgs = vec![Message::system("be terse"), Message::user("hi")];
        let (system, wire) = build_anthropic_messages(&msgs);
        assert_eq!(system, "be terse");
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn tool_result_maps_to_user_tool_result_block() {
        let msgs = vec![Message::tool_result("call-1", "{\"success\":true}")];
        let (_, wire) = build_anthropic_messages(&msgs);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "call-1");
    }

    #[test]
    fn tool_call_arguments_parse_into_input_object() {
        let msgs = vec![Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: "c1".into(),
                function: FunctionCall {
                    name: "cloud_exec".into(),
                    arguments: "{\"provider\":\"gcp\"}".into(),
                },
            },
        }];
        let (_, wire) = build_anthropic_messages(&msgs);
        assert_eq!(wire[0]["content"][0]["input"]["provider"], "gcp");
    }

    #[test]
    fn empty_tool_call_id_gets_fallback() {
        let msgs = vec![Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: String::new(),
                function: FunctionCall {
                    name: "t".into(),
                    arguments: "{}".into(),
                },
            },
        }];
        let (_, wire) = build_anthropic_messages(&msgs);
        assert_eq!(wire[0]["content"][0]["id"], "tc_fallback");
    }

    #[test]
    fn tool_use_start_event_parses() {
        let v: Value = serde_json::from_str(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tc1","name":"iac_tool"}}"#,
        )
        .unwrap();
        match parse_anthropic_event(&v) {
            ResponseEvent::ToolCall { index, id, name, .. } => {
                assert_eq!(index, 1);
                assert_eq!(id, "tc1");
                assert_eq!(name, "iac_tool");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn input_json_delta_accumulates_by_index() {
        let v: Value = serde_json::from_str(
            r#"{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"a\":"}}"#,
        )
        .unwrap();
        match parse_anthropic_event(&v) {
            ResponseEvent::ToolCall { index, arguments, .. } => {
                assert_eq!(index, 2);
                assert_eq!(arguments, "{\"a\":");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_stop_is_done() {
        let v: Value = serde_json::from_str(r#"{"type":"message_stop"}"#).unwrap();
        assert!(matches!(parse_anthropic_event(&v), ResponseEvent::Done));
    }

    #[test]
    fn cache_usage_comes_from_message_start() {
        let v: Value = serde_json::from_str(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"cache_read_input_tokens":900,"cache_creation_input_tokens":34}}}"#,
        )
        .unwrap();
        match parse_anthropic_event(&v) {
            ResponseEvent::Usage {
                input_tokens,
                cache_read_tokens,
                cache_write_tokens,
                ..
            } => {
                assert_eq!(input_tokens, 12);
                assert_eq!(cache_read_tokens, 900);
                assert_eq!(cache_write_tokens, 34);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
