// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use aurora_config::{CloudProvider, SessionMode};
use aurora_model::Message;
use aurora_tools::ToolCapture;

/// One conversation session: the canonical transcript plus the session's
/// own tool capture.  The transport creates sessions; the core never
/// generates user principals.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub mode: SessionMode,
    /// Ordered provider preference for cloud tools.
    pub preference: Vec<CloudProvider>,
    /// Explicit per-turn model choice from the client, if any.
    pub model_override: Option<String>,
    /// Project / subscription selected for this session.
    pub selected_project: Option<String>,
    /// Incident linked to this session (RCA sessions).
    pub incident_id: Option<String>,
    /// Attachment file names uploaded to this session.
    pub attachments: Vec<String>,
    /// The canonical transcript.  Tool outputs are stored in full; the
    /// history mapper truncates only the model-facing view.
    pub transcript: Vec<Message>,
    pub capture: Arc<ToolCapture>,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, mode: SessionMode) -> Self {
        let id = id.into();
        let user_id = user_id.into();
        let capture = Arc::new(ToolCapture::new(id.clone(), user_id.clone()));
        Self {
            id,
            user_id,
            mode,
            preference: Vec::new(),
            model_override: None,
            selected_project: None,
            incident_id: None,
            attachments: Vec::new(),
            transcript: Vec::new(),
            capture,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.transcript.push(msg);
    }

    /// User messages in order, as plain text, for provider inference.
    pub fn user_texts(&self) -> Vec<String> {
        self.transcript
            .iter()
            .filter(|m| m.role == aurora_model::Role::User)
            .filter_map(|m| m.as_text())
            .map(str::to_string)
            .collect()
    }

    /// The first user message of the conversation, if any.
    pub fn original_request(&self) -> Option<&str> {
        self.transcript
            .iter()
            .find(|m| m.role == aurora_model::Role::User)
            .and_then(|m| m.as_text())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_starts_with_empty_transcript() {
        let s = Session::new("s1", "u1", SessionMode::Agent);
        assert!(s.transcript.is_empty());
        assert_eq!(s.capture.session_id, "s1");
    }

    #[test]
    fn user_texts_filters_roles() {
        let mut s = Session::new("s1", "u1", SessionMode::Agent);
        s.push(Message::user("first"));
        s.push(Message::assistant("reply"));
        s.push(Message::user("second"));
        assert_eq!(s.user_texts(), vec!["first", "second"]);
        assert_eq!(s.original_request(), Some("first"));
    }

    #[test]
    fn original_request_is_none_when_empty() {
        let s = Session::new("s1", "u1", SessionMode::Ask);
        assert!(s.original_request().is_none());
    }
}
