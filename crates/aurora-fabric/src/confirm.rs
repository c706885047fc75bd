// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Confirmation gates.
//!
//! A destructive action sends an `awaiting_confirmation` tool event over the
//! fabric and blocks on the transport's answer.  The answer channel is
//! opaque to the core: an mpsc of [`ConfirmationRequest`]s that the
//! transport resolves within a bounded time.  Background sessions never
//! prompt; [`BackgroundGate`] resolves per the configured auto policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use aurora_tools::ConfirmationGate;

use crate::registry::ConnectionRegistry;

/// One pending confirmation handed to the transport.
pub struct ConfirmationRequest {
    pub user_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub summary: String,
    /// Resolve with the user's decision.  Dropping the sender counts as a
    /// denial (timeout path).
    pub respond: oneshot::Sender<bool>,
}

/// Interactive gate: pushes an `awaiting_confirmation` event to the socket,
/// enqueues a [`ConfirmationRequest`] and waits for the decision with a
/// timeout.  Timeout or a dropped responder is a denial.
pub struct ChannelConfirmationGate {
    registry: Arc<ConnectionRegistry>,
    user_id: String,
    requests: mpsc::Sender<ConfirmationRequest>,
    timeout: Duration,
}

impl ChannelConfirmationGate {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        user_id: impl Into<String>,
        requests: mpsc::Sender<ConfirmationRequest>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            user_id: user_id.into(),
            requests,
            timeout,
        }
    }
}

#[async_trait]
impl ConfirmationGate for ChannelConfirmationGate {
    async fn confirm(&self, summary: &str, tool_name: &str, session_id: &str) -> bool {
        let event = json!({
            "type": "tool_call",
            "data": {
                "tool_name": tool_name,
                "status": "awaiting_confirmation",
                "input": summary,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "session_id": session_id,
            "user_id": self.user_id,
        });
        self.registry
            .send_validated(&self.user_id, session_id, event, tool_name)
            .await;

        let (tx, rx) = oneshot::channel();
        let request = ConfirmationRequest {
            user_id: self.user_id.clone(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            summary: summary.to_string(),
            respond: tx,
        };
        if self.requests.send(request).await.is_err() {
            warn!(tool_name, "confirmation channel closed; denying");
            return false;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => {
                info!(tool_name, decision, "confirmation resolved");
                decision
            }
            Ok(Err(_)) => {
                warn!(tool_name, "confirmation responder dropped; denying");
                false
            }
            Err(_) => {
                warn!(tool_name, timeout = ?self.timeout, "confirmation timed out; denying");
                false
            }
        }
    }
}

/// Background gate: auto-approves or auto-cancels per policy, without any
/// socket traffic.
pub struct BackgroundGate {
    auto_approve: bool,
}

impl BackgroundGate {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve }
    }
}

#[async_trait]
impl ConfirmationGate for BackgroundGate {
    async fn confirm(&self, _summary: &str, tool_name: &str, _session_id: &str) -> bool {
        info!(
            tool_name,
            auto_approve = self.auto_approve,
            "background confirmation auto-resolved"
        );
        self.auto_approve
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    fn gate_with_channel(
        timeout: Duration,
    ) -> (
        ChannelConfirmationGate,
        mpsc::Receiver<ConfirmationRequest>,
        Arc<CollectingSink>,
        Arc<ConnectionRegistry>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(CollectingSink::default());
        let (tx, rx) = mpsc::channel(4);
        let gate = ChannelConfirmationGate::new(registry.clone(), "u1", tx, timeout);
        (gate, rx, sink, registry)
    }

    #[tokio::test]
    async fn approval_flows_back_through_the_channel() {
        let (gate, mut rx, sink, registry) = gate_with_channel(Duration::from_secs(5));
        registry.register("u1", "s1", sink.clone(), 1).await;

        let answerer = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.tool_name, "cloud_exec");
            assert!(req.summary.contains("delete"));
            req.respond.send(true).unwrap();
        });

        assert!(gate.confirm("The command will delete instance", "cloud_exec", "s1").await);
        answerer.await.unwrap();

        // The awaiting_confirmation event went over the socket first.
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0]["data"]["status"], "awaiting_confirmation");
    }

    #[tokio::test]
    async fn denial_flows_back() {
        let (gate, mut rx, _sink, _reg) = gate_with_channel(Duration::from_secs(5));
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            req.respond.send(false).unwrap();
        });
        assert!(!gate.confirm("summary", "iac_tool", "s1").await);
    }

    #[tokio::test]
    async fn timeout_is_a_denial() {
        let (gate, _rx, _sink, _reg) = gate_with_channel(Duration::from_millis(20));
        // Nobody answers: _rx kept alive but idle.
        assert!(!gate.confirm("summary", "iac_tool", "s1").await);
    }

    #[tokio::test]
    async fn dropped_responder_is_a_denial() {
        let (gate, mut rx, _sink, _reg) = gate_with_channel(Duration::from_secs(5));
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            drop(req.respond);
        });
        assert!(!gate.confirm("summary", "cloud_exec", "s1").await);
    }

    #[tokio::test]
    async fn background_gate_follows_policy() {
        use aurora_tools::ConfirmationGate as _;
        assert!(BackgroundGate::new(true).confirm("s", "t", "sess").await);
        assert!(!BackgroundGate::new(false).confirm("s", "t", "sess").await);
    }
}
