// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Notification dispatch port.
//!
//! Email and Slack delivery belong to external connectors; the pipeline
//! only decides WHEN to notify, honouring the user's opt-ins:
//! - email: general opt-in, plus a separate opt-in for "started" events
//! - slack: workspace connection is the only gate (the started message is
//!   overwritten by the completion message)

use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcaEvent {
    Started,
    Completed,
    Failed,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn email_opt_in(&self, user_id: &str) -> bool;
    async fn email_start_opt_in(&self, user_id: &str) -> bool;
    async fn slack_connected(&self, user_id: &str) -> bool;
    async fn send_email(&self, user_id: &str, incident_id: &str, event: RcaEvent);
    async fn send_slack(&self, user_id: &str, incident_id: &str, event: RcaEvent);
}

/// Notifier that drops everything (minimal deployments).
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn email_opt_in(&self, _user_id: &str) -> bool {
        false
    }
    async fn email_start_opt_in(&self, _user_id: &str) -> bool {
        false
    }
    async fn slack_connected(&self, _user_id: &str) -> bool {
        false
    }
    async fn send_email(&self, _user_id: &str, _incident_id: &str, _event: RcaEvent) {}
    async fn send_slack(&self, _user_id: &str, _incident_id: &str, _event: RcaEvent) {}
}

/// Test notifier: records every dispatch.
pub struct RecordingNotifier {
    pub email_opt_in: bool,
    pub email_start_opt_in: bool,
    pub slack: bool,
    pub sent: Mutex<Vec<(String, RcaEvent, &'static str)>>,
}

impl RecordingNotifier {
    pub fn new(email_opt_in: bool, email_start_opt_in: bool, slack: bool) -> Self {
        Self {
            email_opt_in,
            email_start_opt_in,
            slack,
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn email_opt_in(&self, _user_id: &str) -> bool {
        self.email_opt_in
    }
    async fn email_start_opt_in(&self, _user_id: &str) -> bool {
        self.email_start_opt_in
    }
    async fn slack_connected(&self, _user_id: &str) -> bool {
        self.slack
    }
    async fn send_email(&self, _user_id: &str, incident_id: &str, event: RcaEvent) {
        self.sent
            .lock()
            .unwrap()
            .push((incident_id.to_string(), event, "email"));
    }
    async fn send_slack(&self, _user_id: &str, incident_id: &str, event: RcaEvent) {
        self.sent
            .lock()
            .unwrap()
            .push((incident_id.to_string(), event, "slack"));
    }
}

/// Dispatch one event per the opt-in matrix.
pub async fn dispatch(notifier: &dyn Notifier, user_id: &str, incident_id: &str, event: RcaEvent) {
    let email = match event {
        // Started emails need both the general and the start opt-in.
        RcaEvent::Started => {
            notifier.email_opt_in(user_id).await && notifier.email_start_opt_in(user_id).await
        }
        _ => notifier.email_opt_in(user_id).await,
    };
    if email {
        notifier.send_email(user_id, incident_id, event).await;
    }
    if notifier.slack_connected(user_id).await {
        notifier.send_slack(user_id, incident_id, event).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
