// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::Value;

use aurora_config::SessionMode;

use crate::{Tool, ToolCtx, ToolOutput};

/// A tool schema as presented to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Ordered registry of the tools available to one session.
///
/// Registration order is meaningful: duplicate names are filtered
/// deterministically with the first occurrence winning, which is what the
/// tool-set assembler relies on when native tools and MCP-discovered tools
/// collide.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool.  A tool with an already-registered name is dropped
    /// (first occurrence wins).
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            tracing::debug!(name = tool.name(), "duplicate tool name filtered");
            return;
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Remove destructive tools; used when assembling a read-only tool set.
    pub fn retain_read_only(&mut self) {
        self.tools.retain(|t| !t.destructive());
    }

    /// Schemas for the given mode (read-only modes hide destructive tools),
    /// in registration order.
    pub fn schemas_for_mode(&self, mode: SessionMode) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .filter(|t| !(mode.is_read_only() && t.destructive()))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolCtx) -> ToolOutput {
        match self.get(name) {
            Some(tool) => tool.execute(args, ctx).await,
            None => ToolOutput::err(format!(
                r#"{{"success":false,"error":"unknown tool: {name}"}}"#
            )),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
