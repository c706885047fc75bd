// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    /// The last `CompletionRequest` seen by this provider, for inspection.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: provider that emits one tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let mut scripts = self.scripts.lock().unwrap();
        let events: Vec<anyhow::Result<ResponseEvent>> = if scripts.is_empty() {
            vec![
                Ok(ResponseEvent::TextDelta("[script exhausted]".into())),
                Ok(ResponseEvent::Done),
            ]
        } else {
            scripts.remove(0).into_iter().map(Ok).collect()
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, ModelProvider};
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let req = CompletionRequest {
            messages: vec![Message::user("ping")],
            stream: true,
            ..Default::default()
        };
        let mut stream = p.complete(req).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            ResponseEvent::TextDelta(t) => assert_eq!(t, "MOCK: ping"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedMockProvider::new(vec![
            vec![ResponseEvent::TextDelta("one".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("two".into()), ResponseEvent::Done],
        ]);
        for expected in ["one", "two"] {
            let mut s = p.complete(CompletionRequest::default()).await.unwrap();
            match s.next().await.unwrap().unwrap() {
                ResponseEvent::TextDelta(t) => assert_eq!(t, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedMockProvider::always_text("ok");
        let req = CompletionRequest {
            messages: vec![Message::user("inspect me")],
            ..Default::default()
        };
        let _ = p.complete(req).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(
            seen.as_ref().unwrap().messages[0].as_text(),
            Some("inspect me")
        );
    }

    #[tokio::test]
    async fn exhausted_script_yields_marker_text() {
        let p = ScriptedMockProvider::new(vec![]);
        let mut s = p.complete(CompletionRequest::default()).await.unwrap();
        match s.next().await.unwrap().unwrap() {
            ResponseEvent::TextDelta(t) => assert!(t.contains("exhausted")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
