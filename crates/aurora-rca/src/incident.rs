// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incident, session and suggestion records, plus their storage ports.
//!
//! The relational engine is an external collaborator; in-memory stores ship
//! in-tree for tests and the worker binary.  `aurora_status` transitions are
//! enforced by the store: only the DAG `pending → running → {complete,
//! error}` is legal, except on explicit cancellation override.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aurora_model::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuroraStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl AuroraStatus {
    /// Legal transitions form a DAG; anything else is rejected.
    pub fn can_transition(self, to: AuroraStatus) -> bool {
        use AuroraStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Complete) | (Running, Error)
        ) || self == to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Detected,
    Investigating,
    Analyzed,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "warning" => Severity::Medium,
            "low" | "info" => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Incident {
    pub id: String,
    pub user_id: String,
    /// Alert source: grafana, netdata, datadog, slack.
    pub source: String,
    pub title: String,
    pub severity: Severity,
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub aurora_status: AuroraStatus,
    pub summary: Option<String>,
    /// Linked RCA chat session, once one starts.
    pub chat_session_id: Option<String>,
}

impl Incident {
    pub fn new(
        user_id: impl Into<String>,
        source: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
        service: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            source: source.into(),
            title: title.into(),
            severity,
            service: service.into(),
            started_at: Utc::now(),
            status: IncidentStatus::Detected,
            aurora_status: AuroraStatus::Pending,
            summary: None,
            chat_session_id: None,
        }
    }
}

/// One evidence citation extracted from an RCA transcript.  `index` is the
/// number referenced by `[n]` markers in the final summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub index: usize,
    pub tool_name: String,
    pub command: String,
    pub output_excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Fix,
    Command,
}

/// A structured follow-up action attached to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub description: String,
    pub kind: SuggestionKind,
    /// low | medium | high
    pub risk: String,
    pub repository: Option<String>,
    pub file_path: Option<String>,
    pub suggested_content: Option<String>,
    pub command: Option<String>,
    /// Pull-request artefact once the suggestion is applied.
    pub pr_url: Option<String>,
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn create(&self, incident: Incident);
    async fn get(&self, id: &str) -> Option<Incident>;
    async fn set_status(&self, id: &str, status: IncidentStatus);
    /// Enforces the status DAG; returns false when the transition is
    /// rejected.  `force` is the explicit-cancellation override.
    async fn set_aurora_status(&self, id: &str, status: AuroraStatus, force: bool) -> bool;
    async fn link_session(&self, id: &str, session_id: &str);
    async fn set_summary(&self, id: &str, summary: &str);
    async fn set_severity(&self, id: &str, severity: Severity);
    async fn save_citations(&self, id: &str, citations: Vec<Citation>);
    async fn citations(&self, id: &str) -> Vec<Citation>;
    async fn save_suggestions(&self, id: &str, suggestions: Vec<Suggestion>);
    async fn suggestions(&self, id: &str) -> Vec<Suggestion>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub incident_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, row: SessionRow);
    async fn get(&self, id: &str) -> Option<SessionRow>;
    async fn set_status(&self, id: &str, status: SessionStatus);
    async fn save_transcript(&self, id: &str, transcript: Vec<Message>);
    async fn transcript(&self, id: &str) -> Vec<Message>;
    /// Sessions still `in_progress` whose last update is older than the
    /// cutoff — the sweeper's prey.
    async fn stale_in_progress(&self, older_than: chrono::Duration) -> Vec<SessionRow>;
}

// ─── In-memory implementations ───────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryIncidentStore {
    incidents: Mutex<HashMap<String, Incident>>,
    citations: Mutex<HashMap<String, Vec<Citation>>>,
    suggestions: Mutex<HashMap<String, Vec<Suggestion>>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentStore for InMemoryIncidentStore {
    async fn create(&self, incident: Incident) {
        self.incidents
            .lock()
            .unwrap()
            .insert(incident.id.clone(), incident);
    }

    async fn get(&self, id: &str) -> Option<Incident> {
        self.incidents.lock().unwrap().get(id).cloned()
    }

    async fn set_status(&self, id: &str, status: IncidentStatus) {
        if let Some(incident) = self.incidents.lock().unwrap().get_mut(id) {
            incident.status = status;
        }
    }

    async fn set_aurora_status(&self, id: &str, status: AuroraStatus, force: bool) -> bool {
        let mut incidents = self.incidents.lock().unwrap();
        let Some(incident) = incidents.get_mut(id) else {
            return false;
        };
        if !force && !incident.aurora_status.can_transition(status) {
            tracing::warn!(
                incident = id,
                from = ?incident.aurora_status,
                to = ?status,
                "rejected aurora_status transition"
            );
            return false;
        }
        incident.aurora_status = status;
        true
    }

    async fn link_session(&self, id: &str, session_id: &str) {
        if let Some(incident) = self.incidents.lock().unwrap().get_mut(id) {
            incident.chat_session_id = Some(session_id.to_string());
        }
    }

    async fn set_summary(&self, id: &str, summary: &str) {
        if let Some(incident) = self.incidents.lock().unwrap().get_mut(id) {
            incident.summary = Some(summary.to_string());
        }
    }

    async fn set_severity(&self, id: &str, severity: Severity) {
        if let Some(incident) = self.incidents.lock().unwrap().get_mut(id) {
            incident.severity = severity;
        }
    }

    async fn save_citations(&self, id: &str, citations: Vec<Citation>) {
        self.citations
            .lock()
            .unwrap()
            .insert(id.to_string(), citations);
    }

    async fn citations(&self, id: &str) -> Vec<Citation> {
        self.citations.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    async fn save_suggestions(&self, id: &str, suggestions: Vec<Suggestion>) {
        self.suggestions
            .lock()
            .unwrap()
            .insert(id.to_string(), suggestions);
    }

    async fn suggestions(&self, id: &str) -> Vec<Suggestion> {
        self.suggestions
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    rows: Mutex<HashMap<String, SessionRow>>,
    transcripts: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: backdate a session so the sweeper sees it as stale.
    pub fn backdate(&self, id: &str, by: chrono::Duration) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.updated_at -= by;
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, row: SessionRow) {
        self.rows.lock().unwrap().insert(row.id.clone(), row);
    }

    async fn get(&self, id: &str) -> Option<SessionRow> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    async fn set_status(&self, id: &str, status: SessionStatus) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.status = status;
            row.updated_at = Utc::now();
        }
    }

    async fn save_transcript(&self, id: &str, transcript: Vec<Message>) {
        self.transcripts
            .lock()
            .unwrap()
            .insert(id.to_string(), transcript);
    }

    async fn transcript(&self, id: &str) -> Vec<Message> {
        self.transcripts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    async fn stale_in_progress(&self, older_than: chrono::Duration) -> Vec<SessionRow> {
        let cutoff = Utc::now() - older_than;
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.status == SessionStatus::InProgress && row.updated_at < cutoff)
            .cloned()
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
