// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `iac_tool` entry point.
//!
//! One action parameter selects the operation; every operation is scoped to
//! the session's Terraform workspace.  Plan and apply follow the
//! `init → plan -detailed-exitcode` protocol: exit code 0 means no changes,
//! 2 means changes present (and gates apply behind user confirmation),
//! 1 is an error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use aurora_config::{CloudProvider, IacConfig};
use aurora_creds::{CredSetup, CredentialBroker, IsolatedEnv};
use aurora_tools::{Tool, ToolCtx, ToolOutput};

use crate::exec::{
    analyze_terraform_error, parse_outputs_json, summarize_plan, TerraformRunner, TfCommandResult,
};
use crate::provider::{detect_provider_from_content, has_own_provider_block, provider_config};
use crate::state_guard::clear_state_if_provider_changed;
use crate::workspace::{terraform_directory, tf_file_names};

/// Commit details offered to the transport after a successful apply.
#[derive(Debug, Clone)]
pub struct CommitSuggestion {
    pub repo: String,
    pub branch: String,
    pub message: String,
}

/// GitHub connectivity port.  The connector itself is an external
/// collaborator; the IaC pipeline only needs to know whether to offer the
/// commit flow or nudge the user to connect.
#[async_trait]
pub trait GitHubPort: Send + Sync {
    async fn is_connected(&self, user_id: &str) -> bool;
    async fn commit_suggestion(
        &self,
        user_id: &str,
        session_id: &str,
        terraform_dir: &Path,
    ) -> anyhow::Result<CommitSuggestion>;
}

/// Port implementation for deployments without a GitHub connector.
pub struct NullGitHub;

#[async_trait]
impl GitHubPort for NullGitHub {
    async fn is_connected(&self, _user_id: &str) -> bool {
        false
    }
    async fn commit_suggestion(
        &self,
        _user_id: &str,
        _session_id: &str,
        _terraform_dir: &Path,
    ) -> anyhow::Result<CommitSuggestion> {
        anyhow::bail!("github is not connected")
    }
}

pub struct IacTool {
    broker: Arc<CredentialBroker>,
    tf: TerraformRunner,
    github: Arc<dyn GitHubPort>,
    cfg: IacConfig,
}

impl IacTool {
    pub fn new(
        broker: Arc<CredentialBroker>,
        tf: TerraformRunner,
        github: Arc<dyn GitHubPort>,
        cfg: IacConfig,
    ) -> Self {
        Self {
            broker,
            tf,
            github,
            cfg,
        }
    }

    fn finish(&self, ctx: &ToolCtx, original_args: &Value, envelope: Value, is_error: bool) -> ToolOutput {
        let rendered = serde_json::to_string(&envelope)
            .unwrap_or_else(|_| r#"{"success":false,"error":"envelope serialisation failed"}"#.into());
        ctx.capture
            .end_matched("iac_tool", original_args, &rendered, is_error);
        ToolOutput {
            content: rendered,
            is_error,
        }
    }

    /// Resolve the provider for this workspace: explicit content beats the
    /// existing manifests, which beat the preference list.
    fn resolve_provider(&self, ctx: &ToolCtx, dir: &Path, content: Option<&str>) -> Option<CloudProvider> {
        if let Some(c) = content {
            if let Some(p) = detect_provider_from_content(c) {
                return Some(p);
            }
        }
        for file in crate::workspace::list_tf_files(dir) {
            if let Ok(text) = std::fs::read_to_string(&file) {
                if let Some(p) = detect_provider_from_content(&text) {
                    return Some(p);
                }
            }
        }
        ctx.preference.first().copied()
    }

    /// Credentials for terraform itself: the provider plugin reads the same
    /// isolated bundle the CLIs do.  Azure additionally needs the ARM_*
    /// aliases the azurerm provider expects.
    async fn terraform_env(
        &self,
        ctx: &ToolCtx,
        provider: CloudProvider,
    ) -> Result<CredSetup, Value> {
        match self
            .broker
            .setup(provider, &ctx.user_id, ctx.selected_project.as_deref(), ctx.mode, None)
            .await
        {
            Ok(mut setup) => {
                if provider == CloudProvider::Azure {
                    let pairs: Vec<(String, String)> = [
                        ("AZURE_CLIENT_ID", "ARM_CLIENT_ID"),
                        ("AZURE_CLIENT_SECRET", "ARM_CLIENT_SECRET"),
                        ("AZURE_TENANT_ID", "ARM_TENANT_ID"),
                    ]
                    .iter()
                    .filter_map(|(from, to)| {
                        setup.env.get(from).map(|v| (to.to_string(), v.to_string()))
                    })
                    .collect();
                    for (k, v) in pairs {
                        setup.env.set(k, v);
                    }
                    setup.env.set("ARM_SUBSCRIPTION_ID", setup.resource_id.clone());
                }
                Ok(setup)
            }
            Err(e) => {
                let mut envelope = json!({
                    "success": false,
                    "error": format!("Failed to set up {provider} credentials for terraform: {e}"),
                });
                if e.requires_connection() {
                    envelope["requires_connection"] = json!(true);
                }
                Err(envelope)
            }
        }
    }

    fn var_args(vars: Option<&Value>) -> Vec<String> {
        let mut out = Vec::new();
        let Some(vars) = vars else { return out };
        let parsed: Option<Value> = match vars {
            Value::String(s) => serde_json::from_str(s).ok(),
            Value::Object(_) => Some(vars.clone()),
            _ => None,
        };
        match parsed {
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    let value = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.push(format!("-var={k}={value}"));
                }
            }
            _ => {
                if let Value::String(s) = vars {
                    out.push(format!("-var={s}"));
                }
            }
        }
        out
    }

    async fn init(&self, dir: &Path, env: &IsolatedEnv) -> TfCommandResult {
        self.tf
            .run(dir, &["init", "-input=false"], env, Duration::from_secs(300))
            .await
    }

    // ── write ─────────────────────────────────────────────────────────────────

    async fn action_write(&self, ctx: &ToolCtx, original_args: &Value, args: &Value) -> ToolOutput {
        let Some(path) = args["path"].as_str().filter(|p| !p.is_empty()) else {
            return self.finish(
                ctx,
                original_args,
                json!({"error": "path is required for write", "action": "write"}),
                true,
            );
        };
        let content = args["content"].as_str().unwrap_or("");
        let dir = terraform_directory(&self.cfg.workdir, &ctx.user_id, &ctx.session_id);

        let provider = match self.resolve_provider(ctx, &dir, Some(content)) {
            Some(p) => p,
            None => {
                return self.finish(
                    ctx,
                    original_args,
                    json!({
                        "error": "No cloud provider available for terraform; connect a provider first.",
                        "requires_connection": true,
                        "action": "write",
                    }),
                    true,
                );
            }
        };

        // Wipe stale state from a different provider before touching files.
        clear_state_if_provider_changed(&dir, Some(provider));

        let setup = match self.terraform_env(ctx, provider).await {
            Ok(s) => s,
            Err(mut envelope) => {
                envelope["action"] = json!("write");
                return self.finish(ctx, original_args, envelope, true);
            }
        };

        let file_path = dir.join(path);
        if let Some(parent) = file_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return self.finish(
                    ctx,
                    original_args,
                    json!({"error": format!("Failed to create workspace: {e}"), "action": "write"}),
                    true,
                );
            }
        }
        if let Err(e) = tokio::fs::write(&file_path, content).await {
            return self.finish(
                ctx,
                original_args,
                json!({"error": format!("Failed to write {path}: {e}"), "action": "write"}),
                true,
            );
        }

        let provider_file = dir.join("provider.tf");
        if has_own_provider_block(content) {
            // A user-supplied terraform{}/provider{} block plus a generated
            // provider.tf yields duplicate-provider errors.
            if provider_file.exists() {
                let _ = tokio::fs::remove_file(&provider_file).await;
                info!("deleted generated provider.tf in favour of user-supplied blocks");
            }
        } else {
            let config = provider_config(provider, &setup.resource_id);
            if let Err(e) = tokio::fs::write(&provider_file, config).await {
                return self.finish(
                    ctx,
                    original_args,
                    json!({"error": format!("Failed to write provider.tf: {e}"), "action": "write"}),
                    true,
                );
            }
        }

        info!(path = %file_path.display(), provider = %provider, "iac manifest written");
        self.finish(
            ctx,
            original_args,
            json!({
                "status": "success",
                "action": "write",
                "message": format!("IaC manifest written to {}", file_path.display()),
                "path": file_path.display().to_string(),
                "terraform_directory": dir.display().to_string(),
                "resource_id": setup.resource_id,
                "provider_type": provider.as_str(),
                "content_type": "custom",
                "chat_output": content,
            }),
            false,
        )
    }

    // ── plan ──────────────────────────────────────────────────────────────────

    async fn action_plan(&self, ctx: &ToolCtx, original_args: &Value, args: &Value) -> ToolOutput {
        let dir = terraform_directory(&self.cfg.workdir, &ctx.user_id, &ctx.session_id);
        let provider = match self.resolve_provider(ctx, &dir, None) {
            Some(p) => p,
            None => {
                return self.finish(
                    ctx,
                    original_args,
                    json!({"error": "No cloud provider available for terraform", "requires_connection": true, "action": "plan"}),
                    true,
                );
            }
        };
        let setup = match self.terraform_env(ctx, provider).await {
            Ok(s) => s,
            Err(mut envelope) => {
                envelope["action"] = json!("plan");
                return self.finish(ctx, original_args, envelope, true);
            }
        };

        let mut results = Vec::new();

        let init = self.init(&dir, &setup.env).await;
        results.push(json!({"step": "terraform_init", "result": tf_step(&init)}));
        if !init.success {
            return self.finish(
                ctx,
                original_args,
                json!({
                    "status": "failed",
                    "action": "plan",
                    "message": "Terraform initialization failed",
                    "results": results,
                    "chat_output": init.stderr,
                }),
                true,
            );
        }

        let validate = self
            .tf
            .run(&dir, &["validate"], &setup.env, Duration::from_secs(60))
            .await;
        results.push(json!({"step": "terraform_validate", "result": tf_step(&validate)}));

        let mut plan_args: Vec<String> = vec![
            "plan".into(),
            "-detailed-exitcode".into(),
            "-input=false".into(),
        ];
        plan_args.extend(Self::var_args(args.get("vars")));
        let plan_refs: Vec<&str> = plan_args.iter().map(String::as_str).collect();
        let plan = self
            .tf
            .run(&dir, &plan_refs, &setup.env, Duration::from_secs(self.cfg.plan_timeout_secs))
            .await;
        results.push(json!({"step": "terraform_plan", "result": tf_step(&plan)}));

        let plan_status = match plan.return_code {
            0 => "no_changes",
            2 => "changes_present",
            1 => "error",
            _ => "unknown",
        };
        let plan_ok = plan.success || plan.return_code == 2;

        self.finish(
            ctx,
            original_args,
            json!({
                "status": if plan_ok { "success" } else { "failed" },
                "action": "plan",
                "plan_status": plan_status,
                "directory": dir.display().to_string(),
                "terraform_files": tf_file_names(&dir),
                "results": results,
                "chat_output": if plan_ok { plan.stdout.clone() } else { plan.stderr.clone() },
                "summary": {
                    "initialization": "success",
                    "validation": if validate.success { "success" } else { "failed" },
                    "plan": plan_status,
                },
            }),
            !plan_ok,
        )
    }

    // ── apply / destroy ───────────────────────────────────────────────────────

    async fn action_apply_or_destroy(
        &self,
        ctx: &ToolCtx,
        original_args: &Value,
        args: &Value,
        destroy: bool,
    ) -> ToolOutput {
        let action = if destroy { "destroy" } else { "apply" };
        let dir = terraform_directory(&self.cfg.workdir, &ctx.user_id, &ctx.session_id);
        let provider = match self.resolve_provider(ctx, &dir, None) {
            Some(p) => p,
            None => {
                return self.finish(
                    ctx,
                    original_args,
                    json!({"error": "No cloud provider available for terraform", "requires_connection": true, "action": action}),
                    true,
                );
            }
        };
        let setup = match self.terraform_env(ctx, provider).await {
            Ok(s) => s,
            Err(mut envelope) => {
                envelope["action"] = json!(action);
                return self.finish(ctx, original_args, envelope, true);
            }
        };

        let mut results = Vec::new();

        let init = self.init(&dir, &setup.env).await;
        results.push(json!({"step": "terraform_init", "result": tf_step(&init)}));
        if !init.success {
            return self.finish(
                ctx,
                original_args,
                json!({
                    "status": "failed",
                    "action": action,
                    "message": "Terraform initialization failed",
                    "results": results,
                    "chat_output": init.stderr,
                }),
                true,
            );
        }

        let mut plan_args: Vec<&str> = vec!["plan", "-detailed-exitcode", "-input=false"];
        if destroy {
            plan_args.push("-destroy");
        }
        let plan = self
            .tf
            .run(&dir, &plan_args, &setup.env, Duration::from_secs(self.cfg.plan_timeout_secs))
            .await;
        results.push(json!({"step": "terraform_plan_check", "result": tf_step(&plan)}));

        if plan.return_code == 0 {
            let message = if destroy {
                "No resources to destroy - state is already empty"
            } else {
                "No changes detected - infrastructure is up to date"
            };
            return self.finish(
                ctx,
                original_args,
                json!({
                    "status": "success",
                    "action": action,
                    "message": message,
                    "directory": dir.display().to_string(),
                    "results": results,
                    "chat_output": "Terraform applied successfully",
                }),
                false,
            );
        }
        if plan.return_code != 2 {
            let error_output = if plan.stderr.is_empty() { &plan.stdout } else { &plan.stderr };
            return self.finish(
                ctx,
                original_args,
                json!({
                    "status": "failed",
                    "action": action,
                    "message": format!("Terraform {action} failed: Pre-{action} validation check failed"),
                    "results": results,
                    "chat_output": format!("Terraform {action} failed during plan validation:\n\n{error_output}"),
                    "error_details": error_output,
                }),
                true,
            );
        }

        // Changes present: the confirmation gate decides.  An explicit
        // auto_approve from the model still prompts the user — only the gate
        // policy (background mode) may skip the human.
        let plan_summary = summarize_plan(&plan.stdout);
        let approved = ctx
            .confirm
            .confirm(&plan_summary, "iac_tool", &ctx.session_id)
            .await;
        if !approved {
            // The internal note keeps later model turns from re-attempting
            // the operation through another tool.
            let mut cancellation = json!({
                "status": "cancelled",
                "action": action,
                "message": format!("Terraform {action} operation was cancelled or timed out waiting for confirmation."),
                "chat_output": format!("Terraform {action} cancelled."),
                "internal_note": format!(
                    "User cancelled terraform {action} - do NOT attempt to redo or perform equivalent operations via other tools."
                ),
                "final_command": format!("terraform {action} {}", dir.display()),
            });
            cancellation[format!("user_cancelled_{action}")] = json!(true);
            return self.finish(ctx, original_args, cancellation, false);
        }

        let exec_args: Vec<&str> = if destroy {
            vec!["destroy", "-auto-approve", "-input=false"]
        } else {
            vec!["apply", "-auto-approve", "-input=false"]
        };
        let apply = self
            .tf
            .run(&dir, &exec_args, &setup.env, Duration::from_secs(self.cfg.apply_timeout_secs))
            .await;
        results.push(json!({"step": format!("terraform_{action}"), "result": tf_step(&apply)}));

        let mut outputs = json!({});
        if apply.success && !destroy {
            let output_result = self
                .tf
                .run(&dir, &["output", "-json"], &setup.env, Duration::from_secs(60))
                .await;
            if output_result.success {
                outputs = parse_outputs_json(&output_result.stdout);
            }
            results.push(json!({"step": "terraform_outputs", "result": tf_step(&output_result)}));
        }

        let mut summary = json!({
            "initialization": "success",
            "plan_check": "changes_detected",
        });
        summary[action] = json!(if apply.success { "success" } else { "failed" });

        let mut envelope = json!({
            "status": if apply.success { "success" } else { "failed" },
            "action": action,
            "message": if apply.success {
                format!("Infrastructure {action} completed successfully")
            } else {
                format!("Infrastructure {action} failed")
            },
            "directory": dir.display().to_string(),
            "terraform_files": tf_file_names(&dir),
            "outputs": outputs,
            "results": results,
            "summary": summary,
            "chat_output": if apply.success {
                "Terraform applied successfully".to_string()
            } else {
                format!(
                    "Terraform {action} failed:\n\n{}",
                    if apply.stderr.is_empty() { &apply.stdout } else { &apply.stderr }
                )
            },
        });

        if !apply.success {
            if let Some(analysis) = analyze_terraform_error(&apply.stderr, &apply.stdout) {
                envelope["error_analysis"] = json!(analysis);
            }
            return self.finish(ctx, original_args, envelope, true);
        }

        // GitHub hand-off after a successful apply.
        if !destroy {
            if self.github.is_connected(&ctx.user_id).await {
                match self
                    .github
                    .commit_suggestion(&ctx.user_id, &ctx.session_id, &dir)
                    .await
                {
                    Ok(commit) => {
                        envelope["github_status"] = json!({ "connected": true });
                        envelope["post_completion_actions"] = json!({
                            "send_github_commit_flow": {
                                "repo": commit.repo,
                                "branch": commit.branch,
                                "commit_message": commit.message,
                                "terraform_directory": dir.display().to_string(),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "github commit preparation failed");
                        envelope["github_status"] =
                            json!({ "connected": true, "error": e.to_string() });
                    }
                }
            } else {
                info!("apply succeeded but github is not connected; surfacing toast");
                envelope["github_status"] = json!({
                    "connected": false,
                    "action": "toast_sent",
                    "message": "Connect your GitHub account to enable CI/CD for your infrastructure code",
                });
            }
        }

        self.finish(ctx, original_args, envelope, false)
    }

    // ── simple and state commands ─────────────────────────────────────────────

    async fn simple_command(
        &self,
        ctx: &ToolCtx,
        original_args: &Value,
        action: &str,
        args: &Value,
    ) -> ToolOutput {
        let dir = terraform_directory(&self.cfg.workdir, &ctx.user_id, &ctx.session_id);

        // Refresh talks to the provider; everything else reads local files.
        let env = if action == "refresh" {
            let provider = match self.resolve_provider(ctx, &dir, None) {
                Some(p) => p,
                None => {
                    return self.finish(
                        ctx,
                        original_args,
                        json!({"error": "No cloud provider available for terraform", "requires_connection": true, "action": action}),
                        true,
                    );
                }
            };
            match self.terraform_env(ctx, provider).await {
                Ok(s) => s.env,
                Err(mut envelope) => {
                    envelope["action"] = json!(action);
                    return self.finish(ctx, original_args, envelope, true);
                }
            }
        } else {
            IsolatedEnv::with_base("/home/appuser")
        };

        let result = match action {
            "fmt" => self.tf.run(&dir, &["fmt", "-recursive"], &env, Duration::from_secs(60)).await,
            "validate" => {
                let init = self.init(&dir, &env).await;
                if !init.success {
                    return self.finish(
                        ctx,
                        original_args,
                        json!({
                            "status": "failed",
                            "action": action,
                            "message": "Terraform initialization failed",
                            "chat_output": init.stderr,
                        }),
                        true,
                    );
                }
                self.tf.run(&dir, &["validate"], &env, Duration::from_secs(60)).await
            }
            "refresh" => {
                let init = self.init(&dir, &env).await;
                if !init.success {
                    return self.finish(
                        ctx,
                        original_args,
                        json!({
                            "status": "failed",
                            "action": action,
                            "message": "Terraform initialization failed",
                            "chat_output": init.stderr,
                        }),
                        true,
                    );
                }
                self.tf.run(&dir, &["refresh", "-input=false"], &env, Duration::from_secs(300)).await
            }
            "outputs" => {
                let result = self.tf.run(&dir, &["output", "-json"], &env, Duration::from_secs(60)).await;
                if result.success {
                    let outputs = parse_outputs_json(&result.stdout);
                    return self.finish(
                        ctx,
                        original_args,
                        json!({
                            "status": "success",
                            "action": action,
                            "outputs": outputs.clone(),
                            "chat_output": serde_json::to_string_pretty(&outputs).unwrap_or_default(),
                        }),
                        false,
                    );
                }
                result
            }
            "state_list" => self.tf.run(&dir, &["state", "list"], &env, Duration::from_secs(60)).await,
            "state_show" => {
                let Some(resource) = args["resource"].as_str().filter(|r| !r.is_empty()) else {
                    return self.finish(
                        ctx,
                        original_args,
                        json!({"error": "resource is required for state_show", "action": action}),
                        true,
                    );
                };
                self.tf.run(&dir, &["state", "show", resource], &env, Duration::from_secs(60)).await
            }
            "state_pull" => self.tf.run(&dir, &["state", "pull"], &env, Duration::from_secs(60)).await,
            _ => unreachable!("dispatch covers all simple actions"),
        };

        self.finish(
            ctx,
            original_args,
            json!({
                "status": if result.success { "success" } else { "failed" },
                "action": action,
                "return_code": result.return_code,
                "chat_output": if result.success { result.stdout.clone() } else { result.stderr.clone() },
            }),
            !result.success,
        )
    }
}

fn tf_step(result: &TfCommandResult) -> Value {
    json!({
        "success": result.success,
        "return_code": result.return_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
    })
}

const WRITE_ACTIONS: &[&str] = &["write", "plan", "apply", "destroy"];
const ALL_ACTIONS: &[&str] = &[
    "write",
    "fmt",
    "validate",
    "refresh",
    "outputs",
    "state_list",
    "state_show",
    "state_pull",
    "plan",
    "apply",
    "destroy",
];

#[async_trait]
impl Tool for IacTool {
    fn name(&self) -> &str {
        "iac_tool"
    }

    fn description(&self) -> &str {
        "Manage infrastructure as code with Terraform in a per-session workspace. \
         Actions: write (create a manifest; provider configuration is generated \
         automatically, so include ONLY resource/data/variable/output/locals blocks), \
         fmt, validate, refresh, outputs, state_list, state_show, state_pull, \
         plan, apply (plans first and asks the user to confirm), destroy. \
         Use this for complicated infrastructure; one-off operations are better \
         served by cloud_exec."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ALL_ACTIONS,
                    "description": "The IaC operation to perform"
                },
                "path": {
                    "type": "string",
                    "description": "Manifest file name for write (e.g. main.tf)"
                },
                "content": {
                    "type": "string",
                    "description": "Complete Terraform HCL for write, without terraform{}/provider{} blocks"
                },
                "directory": {
                    "type": "string",
                    "description": "Workspace directory hint; operations are scoped to the session workspace"
                },
                "vars": {
                    "type": "string",
                    "description": "JSON object of -var values for plan"
                },
                "resource": {
                    "type": "string",
                    "description": "Resource address for state_show"
                },
                "auto_approve": {
                    "type": "boolean",
                    "description": "Accepted for compatibility; the confirmation gate still decides"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn destructive(&self) -> bool {
        // Per-action gating below; state inspection stays available in
        // read-only modes.
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolOutput {
        let original_args = args.clone();
        let action = args["action"].as_str().unwrap_or("").to_string();
        if !ALL_ACTIONS.contains(&action.as_str()) {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "error": format!("Unknown action '{action}'. Supported: {}", ALL_ACTIONS.join(", ")),
                }),
                true,
            );
        }

        if ctx.mode.is_read_only() && WRITE_ACTIONS.contains(&action.as_str()) {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": false,
                    "error": format!("This session is read-only; '{action}' would modify infrastructure."),
                    "code": "READ_ONLY_MODE",
                    "action": action,
                }),
                true,
            );
        }

        match action.as_str() {
            "write" => self.action_write(ctx, &original_args, &args).await,
            "plan" => self.action_plan(ctx, &original_args, &args).await,
            "apply" => self.action_apply_or_destroy(ctx, &original_args, &args, false).await,
            "destroy" => self.action_apply_or_destroy(ctx, &original_args, &args, true).await,
            other => self.simple_command(ctx, &original_args, other, &args).await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
