// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Citation extraction.
//!
//! Citations are simply the investigation's tool calls: each ToolCall /
//! ToolResult pair in the transcript becomes an indexed piece of evidence
//! the summary can reference with `[n]` markers.  Only cited rows are
//! persisted.

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use aurora_model::{Message, MessageContent};

use crate::incident::Citation;

const EXCERPT_LIMIT: usize = 600;

/// Walk a transcript and produce citations from tool-call/result pairs,
/// indexed from 1 in transcript order.
pub fn extract_citations(transcript: &[Message]) -> Vec<Citation> {
    let mut citations = Vec::new();
    let mut pending: Vec<(String, String, String)> = Vec::new(); // (call_id, tool, command)

    for msg in transcript {
        match &msg.content {
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } => {
                let command = command_from_args(&function.name, &function.arguments);
                pending.push((tool_call_id.clone(), function.name.clone(), command));
            }
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => {
                if let Some(pos) = pending.iter().position(|(id, _, _)| id == tool_call_id) {
                    let (_, tool_name, command) = pending.remove(pos);
                    citations.push(Citation {
                        index: citations.len() + 1,
                        tool_name,
                        command,
                        output_excerpt: excerpt(content),
                    });
                }
            }
            _ => {}
        }
    }
    citations
}

/// The human-relevant command for a tool call: the cloud command, the IaC
/// action, or the raw kwargs as a fallback.
fn command_from_args(tool_name: &str, arguments: &str) -> String {
    let parsed: Value = serde_json::from_str(arguments).unwrap_or(Value::Null);
    if let Some(command) = parsed["command"].as_str() {
        return command.to_string();
    }
    if let Some(action) = parsed["action"].as_str() {
        return format!("{tool_name} {action}");
    }
    if let Some(query) = parsed["query"].as_str() {
        return query.to_string();
    }
    arguments.to_string()
}

/// Prefer the envelope's chat_output; fall back to the raw content clipped
/// to the excerpt limit.
fn excerpt(content: &str) -> String {
    let text = serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|v| v["chat_output"].as_str().map(str::to_string))
        .unwrap_or_else(|| content.to_string());
    if text.len() > EXCERPT_LIMIT {
        let mut cut = EXCERPT_LIMIT;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    } else {
        text
    }
}

/// Parse the `[n]` / `[n, m]` markers out of a summary.  Every cited index
/// is returned once, sorted.
pub fn parse_used_citations(summary: &str) -> BTreeSet<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[(\d+(?:,\s*\d+)*)\]").unwrap());
    let mut used = BTreeSet::new();
    for capture in re.captures_iter(summary) {
        for num in capture[1].split(',') {
            if let Ok(n) = num.trim().parse::<usize>() {
                used.insert(n);
            }
        }
    }
    used
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_model::{FunctionCall, Message, Role};

    fn tool_call(id: &str, name: &str, args: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: args.into(),
                },
            },
        }
    }

    #[test]
    fn pairs_become_indexed_citations() {
        let transcript = vec![
            Message::user("investigate"),
            tool_call("c1", "cloud_exec", r#"{"provider":"gcp","command":"compute instances list"}"#),
            Message::tool_result("c1", r#"{"success":true,"chat_output":"3 instances"}"#),
            tool_call("c2", "iac_tool", r#"{"action":"state_list"}"#),
            Message::tool_result("c2", r#"{"success":true,"chat_output":"2 resources"}"#),
            Message::assistant("done"),
        ];
        let citations = extract_citations(&transcript);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].index, 1);
        assert_eq!(citations[0].command, "compute instances list");
        assert_eq!(citations[0].output_excerpt, "3 instances");
        assert_eq!(citations[1].index, 2);
        assert_eq!(citations[1].command, "iac_tool state_list");
    }

    #[test]
    fn orphan_calls_produce_no_citations() {
        let transcript = vec![tool_call("c1", "cloud_exec", "{}")];
        assert!(extract_citations(&transcript).is_empty());
    }

    #[test]
    fn long_outputs_are_clipped() {
        let big = "z".repeat(2000);
        let transcript = vec![
            tool_call("c1", "cloud_exec", r#"{"command":"logs read"}"#),
            Message::tool_result("c1", big),
        ];
        let citations = extract_citations(&transcript);
        assert!(citations[0].output_excerpt.len() < 700);
        assert!(citations[0].output_excerpt.ends_with('…'));
    }

    // ── Marker parsing ────────────────────────────────────────────────────────

    #[test]
    fn single_and_grouped_markers_parse() {
        let summary = "CPU spiked [1]. Memory stayed flat [2, 3]. Disk was fine [4,5].";
        let used = parse_used_citations(summary);
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_markers_count_once() {
        let used = parse_used_citations("see [1] and again [1]");
        assert_eq!(used.len(), 1);
    }

    #[test]
    fn prose_brackets_without_digits_are_ignored() {
        let used = parse_used_citations("no citations here [abc] [ ]");
        assert!(used.is_empty());
    }
}
