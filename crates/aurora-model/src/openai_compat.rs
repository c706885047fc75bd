// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible chat completion driver.
//!
//! The orchestrator's gateway mode routes every model through OpenRouter,
//! which speaks the standard `/chat/completions` SSE wire format.  Direct
//! OpenAI access uses the same driver with a different base URL.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent, Role};

pub struct OpenAICompatProvider {
    /// Driver id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    api_key: String,
    /// Full chat completions URL.
    chat_url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
    /// Additional HTTP headers (e.g. `HTTP-Referer` for OpenRouter).
    extra_headers: Vec<(String, String)>,
}

impl OpenAICompatProvider {
    /// `base_url` ends before `/chat/completions`, e.g.
    /// `https://openrouter.ai/api/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: String,
        base_url: &str,
        temperature: f32,
        request_timeout_secs: u64,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            temperature,
            max_tokens: 8192,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(request_timeout_secs))
                .build()
                .unwrap_or_default(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        // OpenAI has a single "system" message with no uncached-block
        // concept, so the ephemeral suffix is appended to the text.
        let messages: Vec<Value> = if let Some(suffix) = &req.system_dynamic_suffix {
            let mut msgs = req.messages.clone();
            if let Some(sys) = msgs.first_mut() {
                if sys.role == Role::System {
                    use crate::MessageContent;
                    if let MessageContent::Text(t) = &sys.content {
                        sys.content = MessageContent::Text(format!("{t}\n\n{suffix}"));
                    }
                }
            }
            build_openai_messages(&msgs)
        } else {
            build_openai_messages(&req.messages)
        };

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        // OpenRouter pins all requests sharing a prompt_cache_key to the same
        // cached KV prefix; the session id keeps every turn of a session on
        // the cached system prompt.
        if self.driver_name == "openrouter" {
            if let Some(key) = &req.cache_key {
                body["prompt_cache_key"] = json!(key);
            }
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self
            .client
            .post(&self.chat_url)
            .json(&body)
            .bearer_auth(&self.api_key);
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets: keep a line buffer
        // across chunks and emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.  A trailing
/// incomplete line stays in `buf` to be extended by the next chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
/// Returns `None` for empty lines, comments, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cache_read_tokens = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0) as u32;
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens,
            cache_write_tokens: 0,
        };
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta: each chunk carries one tool-call delta in practice;
    // the "index" field routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        };
    }

    // Reasoning delta: `reasoning_content` (vendor-native) or `reasoning`
    // (OpenRouter) both carry chain-of-thought text.
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return ResponseEvent::ThinkingDelta(t.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

/// Convert messages into the OpenAI wire-format JSON array.
///
/// Parallel tool calls from one assistant turn must appear inside a single
/// assistant message as a `tool_calls` array, so consecutive `ToolCall`
/// entries are merged into one object here.
pub(crate) fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::{ContentPart, MessageContent};

    fn role_str(r: Role) -> &'static str {
        match r {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    let mut out: Vec<Value> = Vec::new();
    let mut pending_tool_calls: Vec<Value> = Vec::new();

    let flush_tool_calls = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": std::mem::take(pending),
            }));
        }
    };

    for m in messages {
        match &m.content {
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } => {
                pending_tool_calls.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }));
            }
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                flush_tool_calls(&mut out, &mut pending_tool_calls);
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
            MessageContent::Text(t) => {
                flush_tool_calls(&mut out, &mut pending_tool_calls);
                out.push(json!({ "role": role_str(m.role), "content": t }));
            }
            MessageContent::ContentParts(parts) => {
                flush_tool_calls(&mut out, &mut pending_tool_calls);
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => json!({
                            "type": "image_url",
                            "image_url": { "url": image_url },
                        }),
                    })
                    .collect();
                out.push(json!({ "role": role_str(m.role), "content": content }));
            }
        }
    }
    flush_tool_calls(&mut out, &mut pending_tool_calls);
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
