// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP tool surfacing.
//!
//! Discovered tools become [`Tool`]s prefixed `mcp_` to avoid collision
//! with native tools.  Destructive verbs route through the same user
//! confirmation gate as cloud writes, with a kwargs-derived action summary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use aurora_tools::{Tool, ToolCtx, ToolOutput};

use crate::manager::{McpServerManager, ServerKind};
use crate::protocol::McpToolSpec;

/// Verb prefixes that create, modify or delete resources.
const DESTRUCTIVE_PREFIXES: &[&str] = &[
    "create_", "delete_", "update_", "push_", "merge_", "close_", "add_", "remove_", "cancel_",
    "rerun_", "fork_", "assign_", "request_", "submit_", "approve_", "dismiss_", "resolve_",
];

/// Explicitly destructive tool names beyond the prefix set.
const DESTRUCTIVE_TOOLS: &[&str] = &[
    "create_or_update_file",
    "push_files",
    "create_branch",
    "create_repository",
    "create_issue",
    "create_pull_request",
    "create_pull_request_review",
    "merge_pull_request",
    "update_pull_request_branch",
    "fork_repository",
    "add_issue_comment",
    "add_comment_to_pending_review",
    "add_project_item",
    "delete_file",
    "delete_pending_review",
    "cancel_workflow_run",
    "rerun_workflow",
    "rerun_workflow_failed_jobs",
    "assign_copilot_to_issue",
    "request_copilot_review",
    "update_issue",
    "update_project_item_field_value",
    "close_pull_request_review",
    "manage_pull_request_review",
];

/// True when an MCP tool creates, modifies or deletes resources.
pub fn is_destructive_mcp_tool(tool_name: &str) -> bool {
    if DESTRUCTIVE_TOOLS.contains(&tool_name) {
        return true;
    }
    DESTRUCTIVE_PREFIXES.iter().any(|p| tool_name.starts_with(p))
}

/// Human-readable summary of what the MCP tool will do, from its kwargs.
pub fn summarize_mcp_tool_action(tool_name: &str, kwargs: &Value) -> String {
    let action = tool_name.replace('_', " ");
    let mut parts = vec![format!("The tool will {action}")];

    let get = |key: &str| kwargs.get(key).and_then(Value::as_str);
    match (get("owner"), get("repo")) {
        (Some(owner), Some(repo)) => parts.push(format!("in repository {owner}/{repo}")),
        (None, Some(repo)) => parts.push(format!("in repository {repo}")),
        _ => {}
    }
    if let Some(branch) = get("branch") {
        parts.push(format!("on branch '{branch}'"));
    }
    if let Some(path) = get("path") {
        parts.push(format!("at path '{path}'"));
    }
    if let Some(title) = get("title") {
        parts.push(format!("with title '{title}'"));
    }
    let pr = kwargs
        .get("pullNumber")
        .or_else(|| kwargs.get("pull_number"))
        .and_then(Value::as_u64);
    if let Some(n) = pr {
        parts.push(format!("for PR #{n}"));
    }
    let issue = kwargs
        .get("issue_number")
        .or_else(|| kwargs.get("issueNumber"))
        .and_then(Value::as_u64);
    if let Some(n) = issue {
        parts.push(format!("for issue #{n}"));
    }

    format!("{}.\n\n", parts.join(" "))
}

/// One discovered MCP tool bridged into the registry.
pub struct McpBridgedTool {
    manager: Arc<McpServerManager>,
    kind: ServerKind,
    spec: McpToolSpec,
    /// `mcp_` + the server's tool name.
    prefixed_name: String,
}

impl McpBridgedTool {
    pub fn new(manager: Arc<McpServerManager>, kind: ServerKind, spec: McpToolSpec) -> Self {
        let prefixed_name = format!("mcp_{}", spec.name);
        Self {
            manager,
            kind,
            spec,
            prefixed_name,
        }
    }
}

#[async_trait]
impl Tool for McpBridgedTool {
    fn name(&self) -> &str {
        &self.prefixed_name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.input_schema.clone()
    }

    fn destructive(&self) -> bool {
        is_destructive_mcp_tool(&self.spec.name)
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolOutput {
        if self.destructive() {
            let summary = summarize_mcp_tool_action(&self.spec.name, &args);
            if !ctx
                .confirm
                .confirm(&summary, &self.prefixed_name, &ctx.session_id)
                .await
            {
                return ToolOutput::from_value(
                    &json!({
                        "status": "cancelled",
                        "success": false,
                        "message": format!("{} cancelled by user", self.spec.name),
                        "chat_output": "Action cancelled.",
                        "user_cancelled": true,
                    }),
                    false,
                );
            }
        }

        match self
            .manager
            .call_tool(&ctx.user_id, self.kind, &self.spec.name, args)
            .await
        {
            Ok(result) => {
                let is_error = result["isError"].as_bool().unwrap_or(false);
                let text = extract_content_text(&result);
                ToolOutput::from_value(
                    &json!({
                        "success": !is_error,
                        "tool": self.spec.name,
                        "server": self.kind.as_str(),
                        "chat_output": text,
                    }),
                    is_error,
                )
            }
            Err(e) => ToolOutput::from_value(
                &json!({
                    "success": false,
                    "tool": self.spec.name,
                    "server": self.kind.as_str(),
                    "error": e.to_string(),
                }),
                true,
            ),
        }
    }
}

/// Concatenate the text blocks of an MCP `tools/call` result.
fn extract_content_text(result: &Value) -> String {
    let Some(content) = result["content"].as_array() else {
        return result.to_string();
    };
    let texts: Vec<&str> = content
        .iter()
        .filter(|c| c["type"].as_str() == Some("text"))
        .filter_map(|c| c["text"].as_str())
        .collect();
    if texts.is_empty() {
        result.to_string()
    } else {
        texts.join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Destructive detection ─────────────────────────────────────────────────

    #[test]
    fn prefix_verbs_are_destructive() {
        for name in ["create_gist", "delete_branch", "merge_pull_request", "push_files"] {
            assert!(is_destructive_mcp_tool(name), "{name}");
        }
    }

    #[test]
    fn explicit_names_are_destructive() {
        assert!(is_destructive_mcp_tool("manage_pull_request_review"));
        assert!(is_destructive_mcp_tool("close_pull_request_review"));
    }

    #[test]
    fn read_tools_are_not_destructive() {
        for name in ["get_me", "list_issues", "search_repositories", "get_file_contents"] {
            assert!(!is_destructive_mcp_tool(name), "{name}");
        }
    }

    // ── Summaries ─────────────────────────────────────────────────────────────

    #[test]
    fn summary_names_repo_branch_and_title() {
        let s = summarize_mcp_tool_action(
            "create_pull_request",
            &json!({"owner": "acme", "repo": "infra", "branch": "fix-1", "title": "Fix quota"}),
        );
        assert!(s.contains("create pull request"));
        assert!(s.contains("acme/infra"));
        assert!(s.contains("branch 'fix-1'"));
        assert!(s.contains("title 'Fix quota'"));
    }

    #[test]
    fn summary_handles_pr_number_variants() {
        let a = summarize_mcp_tool_action("merge_pull_request", &json!({"pullNumber": 7}));
        let b = summarize_mcp_tool_action("merge_pull_request", &json!({"pull_number": 7}));
        assert!(a.contains("PR #7"));
        assert!(b.contains("PR #7"));
    }

    // ── Content extraction ────────────────────────────────────────────────────

    #[test]
    fn content_text_blocks_concatenate() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "line two"},
            ]
        });
        assert_eq!(extract_content_text(&result), "line one\nline two");
    }

    #[test]
    fn non_content_results_stringify() {
        let result = json!({"raw": 42});
        assert!(extract_content_text(&result).contains("42"));
    }
}
