// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool wrapper stack.
//!
//! Every tool in a session registry is wrapped with three layers, composed
//! at registration time rather than per call:
//!
//! 1. context assertion — critical tools refuse to run without a principal
//!    and session (`must_have_ctx` at the boundary);
//! 2. notification — `tool_call` / `tool_result` / `tool_error` envelopes
//!    go over the fabric with deterministic signature-based ids;
//! 3. capture — the terminal outcome is recorded in the session capture via
//!    signature matching (skipped when the tool already captured its own
//!    end, e.g. a cancellation).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use aurora_fabric::ConnectionRegistry;
use aurora_tools::events::ToolEvent;
use aurora_tools::signature::signature_id;
use aurora_tools::{Tool, ToolCtx, ToolOutput};

pub struct WrappedTool {
    inner: Arc<dyn Tool>,
    connections: Arc<ConnectionRegistry>,
    /// Critical tools force a valid principal/session from context.
    critical: bool,
}

impl WrappedTool {
    pub fn new(inner: Arc<dyn Tool>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            inner,
            connections,
            critical: true,
        }
    }

    /// Wrap a non-critical tool (context fields filled best-effort).
    pub fn relaxed(inner: Arc<dyn Tool>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            inner,
            connections,
            critical: false,
        }
    }

    async fn emit(&self, ctx: &ToolCtx, event: ToolEvent) {
        let payload = serde_json::to_value(event.with_session(&ctx.user_id, &ctx.session_id))
            .unwrap_or(Value::Null);
        self.connections
            .send_validated(&ctx.user_id, &ctx.session_id, payload, self.inner.name())
            .await;
    }
}

#[async_trait]
impl Tool for WrappedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }

    fn destructive(&self) -> bool {
        self.inner.destructive()
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolOutput {
        // Layer 3 (innermost boundary first): context assertion.
        if self.critical && (ctx.user_id.is_empty() || ctx.session_id.is_empty()) {
            return ToolOutput::err(format!(
                r#"{{"success":false,"error":"no user context available for {}"}}"#,
                self.inner.name()
            ));
        }

        // Layer 2: start notification with the deterministic signature id.
        let sig_id = signature_id(self.inner.name(), &args);
        self.emit(ctx, ToolEvent::start(self.inner.name(), args.clone(), &sig_id))
            .await;

        let output = self.inner.execute(args.clone(), ctx).await;

        // Layer 1: capture the terminal outcome (no-op when the tool
        // already captured its own, e.g. cancellations), then notify.
        ctx.capture
            .finish_matched(self.inner.name(), &args, &output.content, output.is_error);

        if output.is_error {
            self.emit(
                ctx,
                ToolEvent::error(self.inner.name(), &output.content, &sig_id),
            )
            .await;
        } else {
            self.emit(
                ctx,
                ToolEvent::completion(self.inner.name(), &output.content, &sig_id, Some(args)),
            )
            .await;
        }

        output
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
