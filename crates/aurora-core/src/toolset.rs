// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-set assembly.
//!
//! The per-turn registry composes: native tools, connector tools for the
//! integrations the user actually has, and MCP-discovered tools — in that
//! order, so the deterministic duplicate filter favours native tools.
//! Zip-analysis tools join only when the prompt references an archive or
//! deployment intent is detected alongside an attachment.

use std::sync::Arc;

use async_trait::async_trait;

use aurora_config::SessionMode;
use aurora_mcp::{McpBridgedTool, McpServerManager};
use aurora_tools::{Tool, ToolRegistry};

/// Connector tools (Splunk, Dynatrace, Coroot, Confluence, Bitbucket,
/// knowledge base) come from external connector clients; the assembler
/// consumes them through this port.  Implementations return only the tools
/// whose integration is connected for the user.
#[async_trait]
pub trait ConnectorToolProvider: Send + Sync {
    async fn tools_for_user(&self, user_id: &str) -> Vec<Arc<dyn Tool>>;
}

/// Provider with no connectors, for tests and minimal deployments.
pub struct NoConnectors;

#[async_trait]
impl ConnectorToolProvider for NoConnectors {
    async fn tools_for_user(&self, _user_id: &str) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

const ZIP_KEYWORDS: &[&str] = &[
    ".zip",
    "zip file",
    "archive",
    "uploaded file",
    "attachment",
];

const DEPLOYMENT_KEYWORDS: &[&str] = &["deploy", "deployment", "release", "helm chart"];

const ZIP_TOOL_NAMES: &[&str] = &["analyze_zip_file", "rag_index_zip"];

/// Zip-analysis tools are included when the prompt names an archive (by
/// file name or generic keyword), or when deployment intent meets a zip
/// attachment.
pub fn prompt_references_zip(prompt: &str, attachments: &[String]) -> bool {
    let lowered = prompt.to_ascii_lowercase();
    if ZIP_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return true;
    }
    // An attachment mentioned by name counts as a reference.
    for attachment in attachments {
        let name = attachment.to_ascii_lowercase();
        if !name.is_empty() && lowered.contains(&name) {
            return true;
        }
    }
    // Deployment intent with a zip attachment present.
    let has_zip_attachment = attachments
        .iter()
        .any(|a| a.to_ascii_lowercase().ends_with(".zip"));
    has_zip_attachment && DEPLOYMENT_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Assemble the registry for one turn.
///
/// Duplicate names resolve deterministically — first occurrence wins, and
/// natives register first.  In read-only modes destructive tools are
/// removed outright so their schemas never reach the model.
pub async fn assemble_tool_registry(
    user_id: &str,
    mode: SessionMode,
    native_tools: &[Arc<dyn Tool>],
    connectors: &dyn ConnectorToolProvider,
    mcp: Option<&Arc<McpServerManager>>,
    prompt: &str,
    attachments: &[String],
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let include_zip = prompt_references_zip(prompt, attachments);

    for tool in native_tools {
        if !include_zip && ZIP_TOOL_NAMES.contains(&tool.name()) {
            continue;
        }
        registry.register(tool.clone());
    }

    for tool in connectors.tools_for_user(user_id).await {
        registry.register(tool);
    }

    if let Some(manager) = mcp {
        for (kind, spec) in manager.tools_for_user(user_id).await {
            registry.register(Arc::new(McpBridgedTool::new(manager.clone(), kind, spec)));
        }
    }

    if mode.is_read_only() {
        registry.retain_read_only();
    }
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_tools::{ToolCtx, ToolOutput};
    use serde_json::{json, Value};

    struct StubTool {
        name: &'static str,
        destructive: bool,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn destructive(&self) -> bool {
            self.destructive
        }
        async fn execute(&self, _args: Value, _ctx: &ToolCtx) -> ToolOutput {
            ToolOutput::ok("{}")
        }
    }

    fn stub(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(StubTool {
            name,
            destructive: false,
        })
    }

    fn destructive(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(StubTool {
            name,
            destructive: true,
        })
    }

    struct OneConnector;

    #[async_trait]
    impl ConnectorToolProvider for OneConnector {
        async fn tools_for_user(&self, _user: &str) -> Vec<Arc<dyn Tool>> {
            vec![stub("splunk_search"), stub("cloud_exec")]
        }
    }

    // ── Zip gating ────────────────────────────────────────────────────────────

    #[test]
    fn archive_keywords_trigger_zip_tools() {
        assert!(prompt_references_zip("analyze the zip file I uploaded", &[]));
        assert!(prompt_references_zip("look at app.zip", &[]));
        assert!(!prompt_references_zip("list my vms", &[]));
    }

    #[test]
    fn attachment_name_mention_counts() {
        let attachments = vec!["backend.zip".to_string()];
        assert!(prompt_references_zip("deploy backend.zip to gke", &attachments));
    }

    #[test]
    fn deployment_intent_with_zip_attachment_counts() {
        let attachments = vec!["service-bundle.zip".to_string()];
        assert!(prompt_references_zip("deploy this to production", &attachments));
        // No zip attachment → deployment alone is not enough.
        assert!(!prompt_references_zip("deploy this to production", &[]));
    }

    // ── Assembly ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn natives_win_name_collisions_with_connectors() {
        let natives = vec![stub("cloud_exec"), stub("iac_tool")];
        let registry = assemble_tool_registry(
            "u1",
            SessionMode::Agent,
            &natives,
            &OneConnector,
            None,
            "list vms",
            &[],
        )
        .await;
        // cloud_exec appears once; splunk_search joins.
        assert_eq!(registry.names(), vec!["cloud_exec", "iac_tool", "splunk_search"]);
    }

    #[tokio::test]
    async fn zip_tools_are_excluded_without_a_reference() {
        let natives = vec![stub("cloud_exec"), stub("analyze_zip_file"), stub("rag_index_zip")];
        let registry = assemble_tool_registry(
            "u1",
            SessionMode::Agent,
            &natives,
            &NoConnectors,
            None,
            "list my vms",
            &[],
        )
        .await;
        assert_eq!(registry.names(), vec!["cloud_exec"]);

        let registry = assemble_tool_registry(
            "u1",
            SessionMode::Agent,
            &natives,
            &NoConnectors,
            None,
            "inspect the archive please",
            &[],
        )
        .await;
        assert_eq!(registry.names().len(), 3);
    }

    #[tokio::test]
    async fn read_only_mode_drops_destructive_tools() {
        let natives = vec![stub("cloud_exec"), destructive("github_apply_fix")];
        let registry = assemble_tool_registry(
            "u1",
            SessionMode::Ask,
            &natives,
            &NoConnectors,
            None,
            "what is running?",
            &[],
        )
        .await;
        assert_eq!(registry.names(), vec!["cloud_exec"]);
    }
}
