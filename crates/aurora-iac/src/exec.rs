// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Terraform subprocess plumbing and output parsing.
//!
//! Commands run as `terraform -chdir=<workspace> <subcommand...>` in the
//! provider's isolated environment, so the right credentials are visible to
//! the provider plugin and nothing leaks into the parent process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use aurora_creds::IsolatedEnv;
use aurora_tools::runner::{CommandRunner, RunOutcome};
use aurora_tools::sanitize::strip_ansi;

#[derive(Debug, Clone)]
pub struct TfCommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

pub struct TerraformRunner {
    runner: Arc<dyn CommandRunner>,
}

impl TerraformRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Run one terraform subcommand in the workspace.
    pub async fn run(
        &self,
        dir: &Path,
        args: &[&str],
        env: &IsolatedEnv,
        timeout: Duration,
    ) -> TfCommandResult {
        let mut argv: Vec<String> = vec![
            "terraform".to_string(),
            format!("-chdir={}", dir.display()),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));
        debug!(subcommand = args.first().copied().unwrap_or(""), "running terraform");

        match self.runner.run(&argv, env, timeout).await {
            RunOutcome::Finished {
                stdout,
                stderr,
                code,
            } => TfCommandResult {
                success: code == 0,
                stdout: strip_ansi(&stdout),
                stderr: strip_ansi(&stderr),
                return_code: code,
            },
            RunOutcome::NotFound => TfCommandResult {
                success: false,
                stdout: String::new(),
                stderr: "terraform is not installed or not in PATH".to_string(),
                return_code: 127,
            },
            RunOutcome::TimedOut => TfCommandResult {
                success: false,
                stdout: String::new(),
                stderr: format!("terraform timed out after {} s", timeout.as_secs()),
                return_code: 124,
            },
            RunOutcome::SpawnError(e) => TfCommandResult {
                success: false,
                stdout: String::new(),
                stderr: e,
                return_code: -1,
            },
        }
    }
}

/// Flatten `terraform output -json` into `{name: value}`.
pub fn parse_outputs_json(stdout: &str) -> Value {
    match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Object(map)) => {
            let flat: serde_json::Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| {
                    let value = v.get("value").cloned().unwrap_or(v);
                    (k, value)
                })
                .collect();
            Value::Object(flat)
        }
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Condense plan stdout into the confirmation summary: the resource-change
/// counts plus the listed resource actions.
pub fn summarize_plan(plan_stdout: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in plan_stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Plan:")
            || trimmed.starts_with("# ")
            || trimmed.starts_with("+ resource")
            || trimmed.starts_with("- resource")
            || trimmed.starts_with("~ resource")
            || trimmed.contains("will be created")
            || trimmed.contains("will be destroyed")
            || trimmed.contains("will be updated")
            || trimmed.contains("must be replaced")
        {
            lines.push(trimmed);
        }
    }
    if lines.is_empty() {
        let head: Vec<&str> = plan_stdout.lines().take(15).collect();
        return format!("Terraform plan:\n{}\n\n", head.join("\n"));
    }
    // Keep the Plan: counts line last so it reads as the conclusion.
    let (counts, changes): (Vec<&str>, Vec<&str>) =
        lines.iter().partition(|l| l.starts_with("Plan:"));
    let mut summary = String::from("Terraform plan:\n");
    for change in changes.iter().take(20) {
        summary.push_str(change);
        summary.push('\n');
    }
    for count in counts {
        summary.push_str(count);
        summary.push('\n');
    }
    summary.push('\n');
    summary
}

/// Classify an apply failure into a short hint the model can act on.
pub fn analyze_terraform_error(stderr: &str, stdout: &str) -> Option<String> {
    let text = format!("{stderr}\n{stdout}").to_ascii_lowercase();
    if text.contains("error acquiring the state lock") {
        return Some("State is locked by another operation; wait for it to finish or remove the stale lock.".into());
    }
    if text.contains("invalid credentials")
        || text.contains("unauthorized")
        || text.contains("authentication")
        || text.contains("permission denied")
        || text.contains("accessdenied")
    {
        return Some("Provider authentication failed; the credentials may lack the required permissions.".into());
    }
    if text.contains("quota") || text.contains("limit exceeded") {
        return Some("A provider quota or limit was exceeded; request a quota increase or choose a smaller resource.".into());
    }
    if text.contains("already exists") {
        return Some("A resource with this name already exists; pick a different name or import the existing resource.".into());
    }
    if text.contains("unsupported argument")
        || text.contains("invalid block")
        || text.contains("syntax error")
        || text.contains("unsupported block type")
    {
        return Some("The Terraform configuration has a syntax or schema error; fix the flagged block and retry.".into());
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
