// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session-scoped recording of tool invocations.
//!
//! The capture is the source of truth for transcript reconstruction and RCA
//! citation extraction.  Records are created on tool start and closed exactly
//! once; a record marked completed is never mutated again except deletion.
//!
//! Matching uses the signature first (parallel execution), then falls back to
//! a single-incomplete candidate, then the oldest incomplete candidate with a
//! warning — OpenAI executes tools sequentially, Anthropic and Gemini in
//! parallel, and this ladder handles both.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::signature::{sanitize_kwargs, tool_signature};

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    /// Deterministic signature of the non-context kwargs.
    pub signature: String,
    pub input: Value,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// JSON envelope returned by the tool.
    pub output: Option<String>,
    pub is_error: bool,
    pub completed: bool,
}

#[derive(Default)]
struct CaptureState {
    /// Records still open or awaiting cleanup, keyed by call id.
    current: HashMap<String, ToolCallRecord>,
    /// Closed records in completion order (transcript / citations).
    collected: Vec<ToolCallRecord>,
    /// Pre-summarised outputs, keyed by call id, substituted into the
    /// model-facing history instead of the raw output.
    summarized: HashMap<String, String>,
}

/// Session-scoped container of tool call records, protected by a mutex.
/// The only mutators are the tool wrappers and the post-turn cleanup.
pub struct ToolCapture {
    pub session_id: String,
    pub user_id: String,
    state: Mutex<CaptureState>,
}

impl ToolCapture {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            state: Mutex::new(CaptureState::default()),
        }
    }

    /// Open a record for a starting tool call.  At most one record exists
    /// per call id; a duplicate start for the same id is ignored.
    pub fn capture_tool_start(&self, call_id: &str, tool_name: &str, kwargs: &Value) {
        let mut st = self.state.lock().unwrap();
        if st.current.contains_key(call_id) {
            debug!(call_id, "duplicate tool start ignored");
            return;
        }
        let record = ToolCallRecord {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            signature: tool_signature(tool_name, kwargs),
            input: sanitize_kwargs(kwargs),
            start_time: Utc::now(),
            end_time: None,
            output: None,
            is_error: false,
            completed: false,
        };
        st.current.insert(call_id.to_string(), record);
    }

    /// Close a record.  Returns false when the record does not exist or was
    /// already completed — a completed record is never mutated again.
    pub fn capture_tool_end(&self, call_id: &str, output: &str, is_error: bool) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(record) = st.current.get_mut(call_id) else {
            warn!(call_id, "tool end for unknown call id");
            return false;
        };
        if record.completed {
            debug!(call_id, "tool end ignored; record already completed");
            return false;
        }
        record.end_time = Some(Utc::now());
        record.output = Some(output.to_string());
        record.is_error = is_error;
        record.completed = true;
        let closed = record.clone();
        st.collected.push(closed);
        true
    }

    /// Find the call id for a finishing (tool, kwargs) pair.
    ///
    /// Ladder: exact signature match → single incomplete candidate → oldest
    /// incomplete candidate (logged, never fails).  The exact match does not
    /// skip completed records: a tool that captured its own terminal outcome
    /// (cancellation, timeout) must still be matchable by the wrapper so the
    /// record is cleaned up rather than mis-paired.
    pub fn match_call(&self, tool_name: &str, kwargs: &Value) -> Option<String> {
        let st = self.state.lock().unwrap();
        let signature = tool_signature(tool_name, kwargs);

        // Prefer an exact-signature match that is still open; retried calls
        // with identical kwargs otherwise pair against the finished record.
        for (id, rec) in st.current.iter() {
            if rec.signature == signature && !rec.completed {
                return Some(id.clone());
            }
        }
        for (id, rec) in st.current.iter() {
            if rec.signature == signature {
                return Some(id.clone());
            }
        }

        let mut candidates: Vec<(&String, DateTime<Utc>)> = st
            .current
            .iter()
            .filter(|(_, r)| r.tool_name == tool_name && !r.completed)
            .map(|(id, r)| (id, r.start_time))
            .collect();

        match candidates.len() {
            0 => None,
            1 => {
                info!(
                    tool_name,
                    call_id = %candidates[0].0,
                    "matched tool call by single incomplete candidate"
                );
                Some(candidates[0].0.clone())
            }
            _ => {
                candidates.sort_by_key(|(_, started)| *started);
                warn!(
                    tool_name,
                    candidates = candidates.len(),
                    call_id = %candidates[0].0,
                    "no signature match; falling back to oldest incomplete candidate"
                );
                Some(candidates[0].0.clone())
            }
        }
    }

    /// Close the record matching (tool, kwargs) and drop it from the open
    /// set.  Skips the close when the tool already captured its own end
    /// (cloud_exec and iac apply do), so the terminal outcome is recorded
    /// exactly once.
    pub fn finish_matched(&self, tool_name: &str, kwargs: &Value, output: &str, is_error: bool) {
        let Some(call_id) = self.match_call(tool_name, kwargs) else {
            warn!(tool_name, "no matching tool call to finish; tracking may have been lost");
            return;
        };
        let already = {
            let st = self.state.lock().unwrap();
            st.current
                .get(&call_id)
                .map(|r| r.completed)
                .unwrap_or(false)
        };
        if !already {
            self.capture_tool_end(&call_id, output, is_error);
        }
        let mut st = self.state.lock().unwrap();
        st.current.remove(&call_id);
    }

    /// Close the record matching (tool, kwargs) without removing it from
    /// the open set.  Tools that must persist a terminal outcome themselves
    /// (cancellation, timeout, final success of `cloud_exec`) use this; the
    /// wrapper's later `finish_matched` sees the completed record, skips the
    /// duplicate close and cleans up.
    pub fn end_matched(&self, tool_name: &str, kwargs: &Value, output: &str, is_error: bool) {
        if let Some(call_id) = self.match_call(tool_name, kwargs) {
            self.capture_tool_end(&call_id, output, is_error);
        }
    }

    /// Record a pre-summarised output for a call id, used by the history
    /// mapper instead of the raw output.
    pub fn set_summarized(&self, call_id: &str, summary: impl Into<String>) {
        let mut st = self.state.lock().unwrap();
        st.summarized.insert(call_id.to_string(), summary.into());
    }

    pub fn summarized_for(&self, call_id: &str) -> Option<String> {
        self.state.lock().unwrap().summarized.get(call_id).cloned()
    }

    /// All closed records in completion order.
    pub fn collected(&self) -> Vec<ToolCallRecord> {
        self.state.lock().unwrap().collected.clone()
    }

    /// Open (incomplete) call ids, for diagnostics.
    pub fn open_call_ids(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.current
            .iter()
            .filter(|(_, r)| !r.completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Post-turn cleanup: drop open records (the collected history stays).
    pub fn clear_open(&self) {
        self.state.lock().unwrap().current.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
