// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use aurora_config::{CloudProvider, SessionMode};

use crate::capture::ToolCapture;

/// The result of executing a tool: a JSON envelope plus an error flag.
///
/// `content` is always a JSON-encoded object (the common envelope shape
/// `{success, command?, chat_output?, data?, error?, ...}`).  Tools fold
/// every failure into the envelope; `is_error` marks envelopes the model
/// should treat as failures.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Envelope from a JSON value; serialisation cannot fail for values we
    /// build ourselves, but fall back to a minimal error envelope anyway.
    pub fn from_value(v: &Value, is_error: bool) -> Self {
        let content = serde_json::to_string(v)
            .unwrap_or_else(|_| r#"{"success":false,"error":"envelope serialisation failed"}"#.into());
        Self { content, is_error }
    }
}

/// Out-of-band yes/no prompt presented to the user before a destructive
/// command.  The transport owns the round-trip; the core treats it as an
/// opaque awaitable returning in bounded time.  Background sessions resolve
/// without user interaction per the configured auto policy.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// Returns true when the user approved; false on denial or timeout.
    async fn confirm(&self, summary: &str, tool_name: &str, session_id: &str) -> bool;
}

/// Gate that always approves — used for background auto-approve policy and
/// in tests.
pub struct AutoApproveGate;

#[async_trait]
impl ConfirmationGate for AutoApproveGate {
    async fn confirm(&self, _summary: &str, _tool_name: &str, _session_id: &str) -> bool {
        true
    }
}

/// Gate that always cancels — background auto-cancel policy.
pub struct AutoCancelGate;

#[async_trait]
impl ConfirmationGate for AutoCancelGate {
    async fn confirm(&self, _summary: &str, _tool_name: &str, _session_id: &str) -> bool {
        false
    }
}

/// Per-call execution context, passed explicitly to every tool.
///
/// There is no implicit thread-local state: the principal, session, mode and
/// provider preference ride in this value, and the capture handle is the
/// session's own.
#[derive(Clone)]
pub struct ToolCtx {
    /// Authenticated user principal (opaque, non-empty; supplied by the
    /// transport, never generated here).
    pub user_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    /// Ordered provider preference.  Never empty when a cloud tool runs;
    /// cloud tools fail with a typed requires-connection error otherwise.
    pub preference: Vec<CloudProvider>,
    /// Project / subscription selected for this session, if any.
    pub selected_project: Option<String>,
    /// Incident linked to this session (RCA sessions only).
    pub incident_id: Option<String>,
    /// Recent user messages, newest last.  Provider inference scores these
    /// when the model omits an explicit provider.
    pub recent_user_messages: Vec<String>,
    pub capture: Arc<ToolCapture>,
    pub confirm: Arc<dyn ConfirmationGate>,
}

impl ToolCtx {
    /// True when confirmation prompts are suppressed (background mode).
    pub fn is_background(&self) -> bool {
        self.mode.is_background()
    }
}

impl std::fmt::Debug for ToolCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCtx")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

/// Trait every native and bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Destructive tools are removed from the tool set in read-only modes
    /// and pass through the confirmation gate before side effects.
    fn destructive(&self) -> bool {
        false
    }

    /// Execute the tool.  Every failure is folded into the returned
    /// envelope; implementations never panic across this boundary.
    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
