// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Out-of-band tool event envelopes sent over the socket.
//!
//! The wire shape matches the transport contract:
//! `{type, data: {tool_name, input?|output?|error?, status, timestamp,
//! tool_call_id?, tool_input?}, session_id?, user_id?}`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sanitize::sanitize_for_socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventKind {
    ToolCall,
    ToolResult,
    ToolError,
    ToastNotification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEventData {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    #[serde(rename = "type")]
    pub kind: ToolEventKind,
    pub data: ToolEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ToolEvent {
    /// `tool_call` envelope with `status: running` for a starting tool.
    pub fn start(tool_name: &str, input: Value, signature_id: &str) -> Self {
        Self {
            kind: ToolEventKind::ToolCall,
            data: ToolEventData {
                tool_name: tool_name.to_string(),
                input: Some(sanitize_for_socket(&input)),
                output: None,
                error: None,
                status: "running".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                tool_call_id: Some(signature_id.to_string()),
                tool_input: None,
            },
            session_id: None,
            user_id: None,
        }
    }

    /// `tool_result` envelope with the sanitised output.
    pub fn completion(
        tool_name: &str,
        output: &str,
        signature_id: &str,
        tool_input: Option<Value>,
    ) -> Self {
        Self {
            kind: ToolEventKind::ToolResult,
            data: ToolEventData {
                tool_name: tool_name.to_string(),
                input: None,
                output: Some(sanitize_for_socket(&Value::String(output.to_string()))),
                error: None,
                status: "completed".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                tool_call_id: Some(signature_id.to_string()),
                tool_input: tool_input.map(|v| sanitize_for_socket(&v)),
            },
            session_id: None,
            user_id: None,
        }
    }

    pub fn error(tool_name: &str, error_msg: &str, signature_id: &str) -> Self {
        Self {
            kind: ToolEventKind::ToolError,
            data: ToolEventData {
                tool_name: tool_name.to_string(),
                input: None,
                output: None,
                error: Some(error_msg.to_string()),
                status: "error".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                tool_call_id: Some(signature_id.to_string()),
                tool_input: None,
            },
            session_id: None,
            user_id: None,
        }
    }

    /// `tool_call` envelope with `status: awaiting_confirmation`, sent
    /// before the confirmation RPC for a destructive action.
    pub fn awaiting_confirmation(tool_name: &str, input: Value) -> Self {
        Self {
            kind: ToolEventKind::ToolCall,
            data: ToolEventData {
                tool_name: tool_name.to_string(),
                input: Some(sanitize_for_socket(&input)),
                output: None,
                error: None,
                status: "awaiting_confirmation".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                tool_call_id: None,
                tool_input: None,
            },
            session_id: None,
            user_id: None,
        }
    }

    /// One-line toast surfaced directly in the client UI.
    pub fn toast(message: &str) -> Self {
        Self {
            kind: ToolEventKind::ToastNotification,
            data: ToolEventData {
                tool_name: "toast".to_string(),
                input: None,
                output: Some(Value::String(message.to_string())),
                error: None,
                status: "info".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                tool_call_id: None,
                tool_input: None,
            },
            session_id: None,
            user_id: None,
        }
    }

    pub fn with_session(mut self, user_id: &str, session_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.session_id = Some(session_id.to_string());
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_event_serialises_with_type_tag() {
        let ev = ToolEvent::start("cloud_exec", json!({"command": "ls"}), "cloud_exec_abc");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["data"]["status"], "running");
        assert_eq!(v["data"]["tool_call_id"], "cloud_exec_abc");
    }

    #[test]
    fn completion_event_carries_sanitised_output() {
        let big = "x".repeat(20_000);
        let ev = ToolEvent::completion("cloud_exec", &big, "id", None);
        let out = ev.data.output.unwrap();
        assert!(out.as_str().unwrap().len() < 11_000);
    }

    #[test]
    fn completion_parses_json_output_into_structure() {
        let ev = ToolEvent::completion("iac_tool", r#"{"success":true}"#, "id", None);
        assert_eq!(ev.data.output.unwrap()["success"], true);
    }

    #[test]
    fn error_event_has_error_status() {
        let ev = ToolEvent::error("iac_tool", "boom", "sig");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_error");
        assert_eq!(v["data"]["error"], "boom");
    }

    #[test]
    fn awaiting_confirmation_status() {
        let ev = ToolEvent::awaiting_confirmation("github_commit", json!({"repo": "a/b"}));
        assert_eq!(ev.data.status, "awaiting_confirmation");
    }

    #[test]
    fn with_session_sets_routing_fields() {
        let ev = ToolEvent::toast("connect GitHub").with_session("u1", "s1");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["user_id"], "u1");
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["type"], "toast_notification");
    }
}
