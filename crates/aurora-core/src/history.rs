// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transcript → model-message mapping.
//!
//! The canonical transcript is never mutated.  The model sees a windowed
//! view: the last N prior messages, tool outputs truncated (or substituted
//! with a pre-summarised form from the capture), and — when the footprint
//! is still too large — the whole history replaced by a single summary
//! system message.

use aurora_config::AgentConfig;
use aurora_model::{Message, MessageContent, Role};
use aurora_tools::ToolCapture;

/// Map the prior transcript (everything before the current user message)
/// into the model's view.
///
/// - user ↔ human, assistant ↔ ai
/// - assistant tool-call placeholders flatten into a compact description
/// - tool results become system messages `[Tool: name] output`, truncated
///   past the configured cap unless a summarised form exists in the capture
pub fn build_model_messages(
    prior: &[Message],
    capture: &ToolCapture,
    cfg: &AgentConfig,
    window: usize,
) -> Vec<Message> {
    let windowed: &[Message] = if prior.len() > window {
        &prior[prior.len() - window..]
    } else {
        prior
    };

    let mut out: Vec<Message> = Vec::with_capacity(windowed.len());
    for msg in windowed {
        match (&msg.role, &msg.content) {
            (Role::User, _) => out.push(msg.clone()),
            (Role::Assistant, MessageContent::ToolCall { function, .. }) => {
                // Flatten the placeholder into a compact description so the
                // model remembers what it invoked without the full wire form.
                let described = format!("[{}] {}", function.name, function.arguments);
                out.push(Message::assistant(described));
            }
            (Role::Assistant, _) => {
                if msg.as_text().map(|t| !t.is_empty()).unwrap_or(false) {
                    out.push(msg.clone());
                }
            }
            (Role::Tool, MessageContent::ToolResult {
                tool_call_id,
                content,
            }) => {
                let body = match capture.summarized_for(tool_call_id) {
                    Some(summary) => summary,
                    None if content.len() > cfg.tool_output_history_cap => {
                        let cut = floor_char_boundary(content, cfg.tool_output_history_cap);
                        format!("{}\n...[truncated for context reduction]", &content[..cut])
                    }
                    None => content.clone(),
                };
                out.push(Message::system(format!("[Tool result] {body}")));
            }
            (Role::System, _) | (Role::Tool, _) => {}
        }
    }
    out
}

/// True when the prior-message footprint exceeds the preflight threshold
/// and should be replaced by a summary.
pub fn should_compress(prior: &[Message], cfg: &AgentConfig) -> bool {
    let total: usize = prior.iter().map(|m| m.approx_tokens() * 4).sum();
    total > cfg.preflight_compression_chars
}

/// Deterministic conversation summary used by preflight compression.  The
/// canonical transcript stays intact; only the model-facing view shrinks.
pub fn summarize_history(prior: &[Message]) -> String {
    let user_count = prior.iter().filter(|m| m.role == Role::User).count();
    let tool_count = prior
        .iter()
        .filter(|m| matches!(m.content, MessageContent::ToolResult { .. }))
        .count();

    let first_request = prior
        .iter()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.as_text())
        .unwrap_or("(none)");

    let mut tail: Vec<String> = Vec::new();
    for msg in prior.iter().rev().take(6) {
        let excerpt = match (&msg.role, &msg.content) {
            (Role::User, _) => msg.as_text().map(|t| format!("user: {}", clip(t, 300))),
            (Role::Assistant, MessageContent::ToolCall { function, .. }) => {
                Some(format!("assistant called {}", function.name))
            }
            (Role::Assistant, _) => msg.as_text().map(|t| format!("assistant: {}", clip(t, 300))),
            (Role::Tool, MessageContent::ToolResult { content, .. }) => {
                Some(format!("tool result: {}", clip(content, 200)))
            }
            _ => None,
        };
        if let Some(e) = excerpt {
            tail.push(e);
        }
    }
    tail.reverse();

    format!(
        "[CONVERSATION SUMMARY - Preflight]\n\n\
         The conversation so far: {user_count} user turns, {tool_count} tool results.\n\
         Original request: {first_request}\n\n\
         Most recent exchanges:\n{}\n\n\
         [END SUMMARY]",
        tail.join("\n")
    )
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = floor_char_boundary(s, max);
        format!("{}…", &s[..cut])
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
