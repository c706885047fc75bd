// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `cloud_exec` tool.
//!
//! State machine per call: receiving → credential-setup → classification →
//! (confirmation-wait | direct-exec) → post-process → captured.  Every
//! return path runs through [`CloudExecTool::finish`], which records the
//! envelope in the session capture keyed by the ORIGINAL arguments — flag
//! injection must not break signature matching.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{info, warn};

use aurora_config::{CloudConfig, CloudProvider};
use aurora_creds::{CredentialBroker, IsolatedEnv};
use aurora_tools::sanitize::{
    detect_errors_in_stderr, filter_error_messages, sanitize_command_output, sanitize_no_truncate,
    OUTPUT_TRUNCATE_LIMIT,
};
use aurora_tools::runner::{CommandRunner, RunOutcome};
use aurora_tools::{Tool, ToolCtx, ToolOutput};

use crate::classify::{
    command_timeout, estimate_tokens, is_read_only_command, split_command, summarize_cloud_command,
};
use crate::context::determine_target_provider;
use crate::flags::{inject_flags, is_project_query, target_cli};
use crate::projection::{build_projection_command, command_already_filtered, large_output_note};
use crate::shape::shape_output;
use crate::tailscale::{execute_tailscale_command, TailscaleApi};

pub struct CloudExecTool {
    broker: Arc<CredentialBroker>,
    runner: Arc<dyn CommandRunner>,
    tailscale: Arc<dyn TailscaleApi>,
    cfg: CloudConfig,
}

impl CloudExecTool {
    pub fn new(
        broker: Arc<CredentialBroker>,
        runner: Arc<dyn CommandRunner>,
        tailscale: Arc<dyn TailscaleApi>,
        cfg: CloudConfig,
    ) -> Self {
        Self {
            broker,
            runner,
            tailscale,
            cfg,
        }
    }

    /// Terminal path: capture the envelope against the original arguments,
    /// then hand it back to the agent.
    fn finish(&self, ctx: &ToolCtx, original_args: &Value, envelope: Value, is_error: bool) -> ToolOutput {
        let rendered = serde_json::to_string(&envelope)
            .unwrap_or_else(|_| r#"{"success":false,"error":"envelope serialisation failed"}"#.into());
        ctx.capture
            .end_matched("cloud_exec", original_args, &rendered, is_error);
        ToolOutput {
            content: rendered,
            is_error,
        }
    }

    /// Compose a human-friendly resource label from the isolated env without
    /// extra API calls.
    fn resource_name(provider: CloudProvider, resource_id: &str, env: &IsolatedEnv) -> String {
        match provider {
            CloudProvider::Aws => {
                let label = env
                    .get("AURORA_AWS_ACCOUNT_ALIAS")
                    .filter(|a| !a.is_empty())
                    .or_else(|| env.get("AURORA_AWS_ACCOUNT_ID").filter(|a| !a.is_empty()));
                match label {
                    Some(l) => format!("{l} - {resource_id}"),
                    None => resource_id.to_string(),
                }
            }
            CloudProvider::Ovh => {
                let endpoint = env.get("OVH_ENDPOINT").unwrap_or("ovh-us");
                if resource_id.is_empty() {
                    format!("OVH {endpoint}")
                } else {
                    format!("OVH {endpoint} - {resource_id}")
                }
            }
            CloudProvider::Scaleway => {
                let region = env.get("SCW_DEFAULT_REGION").unwrap_or("");
                match (region.is_empty(), resource_id.is_empty()) {
                    (false, false) => format!("Scaleway {region} - {resource_id}"),
                    (true, false) => format!("Scaleway - {resource_id}"),
                    (false, true) => format!("Scaleway {region}"),
                    (true, true) => "Scaleway".to_string(),
                }
            }
            CloudProvider::Tailscale => {
                let name = env
                    .get("TAILSCALE_TAILNET_NAME")
                    .filter(|n| !n.is_empty() && *n != "-");
                match name {
                    Some(n) => format!("Tailscale - {n}"),
                    None if !resource_id.is_empty() && resource_id != "-" => {
                        format!("Tailscale - {resource_id}")
                    }
                    None => "Tailscale".to_string(),
                }
            }
            _ => resource_id.to_string(),
        }
    }

    /// AWS multi-account fan-out: confirm once for the aggregate, then run
    /// the command against every account on a bounded pool.
    async fn multi_account(
        &self,
        ctx: &ToolCtx,
        original_args: &Value,
        command: &str,
        timeout: Option<u64>,
    ) -> ToolOutput {
        let read_only = is_read_only_command(command);
        if ctx.mode.is_read_only() && !read_only {
            return self.finish(
                ctx,
                original_args,
                json!({
                    "success": false,
                    "error": "This session is read-only; the command would modify infrastructure.",
                    "code": "READ_ONLY_MODE",
                    "multi_account": true,
                    "command": command,
                    "provider": "aws",
                }),
                true,
            );
        }

        let connections = self.broker.aws_connections(&ctx.user_id).await;
        if !read_only {
            let summary = format!(
                "[ALL {} accounts] {}",
                connections.len(),
                summarize_cloud_command(command)
            );
            if !ctx
                .confirm
                .confirm(&summary, "cloud_exec", &ctx.session_id)
                .await
            {
                return self.finish(
                    ctx,
                    original_args,
                    json!({
                        "success": false,
                        "status": "cancelled",
                        "error": "User declined multi-account command execution",
                        "user_cancelled": true,
                        "multi_account": true,
                        "command": command,
                        "provider": "aws",
                    }),
                    false,
                );
            }
        }

        let mut tasks = Vec::new();
        for conn in &connections {
            let account_id = conn.account_id.clone();
            let region = conn.region.clone().unwrap_or_else(|| "us-east-1".into());
            let command = command.to_string();
            let broker = Arc::clone(&self.broker);
            let runner = Arc::clone(&self.runner);
            let cfg = self.cfg.clone();
            let user_id = ctx.user_id.clone();
            let mode = ctx.mode;
            tasks.push(async move {
                let setup = match broker
                    .setup(CloudProvider::Aws, &user_id, Some(&region), mode, Some(&account_id))
                    .await
                {
                    Ok(s) => s,
                    Err(_) => {
                        return (
                            account_id,
                            json!({"region": region, "success": false, "error": "Failed to assume role"}),
                        )
                    }
                };

                let mut cmd = command.trim().to_string();
                if !cmd.starts_with("aws") {
                    cmd = format!("aws {cmd}");
                }
                if !cmd.contains("--region") {
                    cmd.push_str(&format!(" --region {region}"));
                }
                if !cmd.contains("--output")
                    && ["list", "describe", "get"].iter().any(|kw| cmd.contains(kw))
                {
                    cmd.push_str(" --output json");
                }

                let argv = match split_command(&cmd) {
                    Ok(a) => a,
                    Err(e) => {
                        return (
                            account_id,
                            json!({"region": region, "success": false, "error": format!("Command parsing failed: {e}")}),
                        )
                    }
                };
                let effective = command_timeout(&cmd, timeout, &cfg);
                match runner.run(&argv, &setup.env, effective).await {
                    RunOutcome::Finished { stdout, stderr, code } => {
                        let output = if code == 0 { stdout.trim() } else { stderr.trim() };
                        (
                            account_id,
                            json!({
                                "region": region,
                                "success": code == 0,
                                "output": sanitize_command_output(output, OUTPUT_TRUNCATE_LIMIT),
                                "return_code": code,
                            }),
                        )
                    }
                    RunOutcome::TimedOut => (
                        account_id,
                        json!({"region": region, "success": false, "error": format!("Command timed out after {} s", effective.as_secs())}),
                    ),
                    RunOutcome::NotFound => (
                        account_id,
                        json!({"region": region, "success": false, "error": "aws CLI not installed"}),
                    ),
                    RunOutcome::SpawnError(e) => (
                        account_id,
                        json!({"region": region, "success": false, "error": e}),
                    ),
                }
            });
        }

        // Bounded parallelism over the fan-out pool.
        let mut results = serde_json::Map::new();
        let mut limited =
            stream::iter(tasks).buffer_unordered(self.cfg.multi_account_workers.max(1));
        while let Some((account_id, result)) = limited.next().await {
            results.insert(account_id, result);
        }

        let all_success = results.values().all(|r| r["success"].as_bool().unwrap_or(false));
        info!(accounts = results.len(), all_success, "multi-account dispatch complete");
        self.finish(
            ctx,
            original_args,
            json!({
                "success": all_success,
                "multi_account": true,
                "accounts_queried": results.len(),
                "command": command,
                "provider": "aws",
                "results_by_account": Value::Object(results),
            }),
            false,
        )
    }
}

#[async_trait]
impl Tool for CloudExecTool {
    fn name(&self) -> &str {
        "cloud_exec"
    }

    fn description(&self) -> &str {
        "Run a cloud CLI command against the user's connected provider \
         (gcloud/gsutil/bq/kubectl for GCP, aws/eksctl for AWS, az for Azure, \
         ovhcloud for OVH, scw for Scaleway; Tailscale commands go to the REST API). \
         The provider CLI is prepended and project/region/output flags are injected \
         automatically. Prefer the CLI over IaC for one-off operations: compute, \
         storage, networking, IAM, containers, serverless, databases, monitoring. \
         Use output_file to persist raw stdout (kubeconfig, helm values)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "provider": {
                    "type": "string",
                    "description": "Target provider: gcp | aws | azure | ovh | scaleway | tailscale"
                },
                "command": {
                    "type": "string",
                    "description": "The CLI command to run, without shell operators"
                },
                "output_file": {
                    "type": "string",
                    "description": "Optional path; raw stdout is written there on success"
                },
                "account_id": {
                    "type": "string",
                    "description": "Optional AWS account id to target instead of fanning out"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Optional timeout override in seconds"
                }
            },
            "required": ["provider", "command"],
            "additionalProperties": false
        })
    }

    fn destructive(&self) -> bool {
        // Write verbs are gated per-command; the tool itself stays available
        // in read-only modes for list/describe work.
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolOutput {
        // Preserve the original arguments for signature matching before any
        // command mutation.
        let original_args = args.clone();
        let original_command = args["command"].as_str().unwrap_or("").to_string();
        if original_command.trim().is_empty() {
            return self.finish(
                ctx,
                &original_args,
                json!({"success": false, "error": "command is required"}),
                true,
            );
        }
        let output_file = args["output_file"].as_str().map(str::to_string);
        let account_id = args["account_id"].as_str().map(str::to_string);
        let timeout_override = args["timeout"].as_u64();

        // ── Context resolution ───────────────────────────────────────────────
        if ctx.preference.is_empty() {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": false,
                    "error": "No cloud provider detected from context. Please specify or connect a provider before running cloud tools.",
                    "requires_connection": true,
                    "final_command": original_command,
                }),
                true,
            );
        }
        let provider = match args["provider"].as_str().and_then(CloudProvider::parse) {
            Some(p) => p,
            None => match determine_target_provider(&ctx.preference, &ctx.recent_user_messages) {
                Some(p) => {
                    info!(provider = %p, "provider inferred from conversation context");
                    p
                }
                None => ctx.preference[0],
            },
        };

        // ── Early read-only gate ─────────────────────────────────────────────
        // Classify the original command before credentials are minted: a
        // write command in a read-only session must fail without an STS call
        // or any other credential traffic.  Flag injection only ever adds
        // flags, so the classification cannot flip afterwards.
        if ctx.mode.is_read_only() && !is_read_only_command(&original_command) {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": false,
                    "error": "This session is read-only; the command would modify infrastructure.",
                    "code": "READ_ONLY_MODE",
                    "final_command": original_command,
                    "provider": provider.as_str(),
                }),
                true,
            );
        }

        // ── AWS multi-account dispatch ───────────────────────────────────────
        if provider == CloudProvider::Aws && account_id.is_none() {
            let connections = self.broker.aws_connections(&ctx.user_id).await;
            if connections.len() > 1 {
                return self
                    .multi_account(ctx, &original_args, &original_command, timeout_override)
                    .await;
            }
        }

        // ── Isolated-env setup ───────────────────────────────────────────────
        let setup = match self
            .broker
            .setup(
                provider,
                &ctx.user_id,
                ctx.selected_project.as_deref(),
                ctx.mode,
                account_id.as_deref(),
            )
            .await
        {
            Ok(s) => s,
            Err(e) => {
                let mut envelope = json!({
                    "success": false,
                    "error": format!("Failed to set up {provider} environment: {e}"),
                    "final_command": original_command,
                });
                if e.requires_connection() {
                    envelope["requires_connection"] = json!(true);
                }
                return self.finish(ctx, &original_args, envelope, true);
            }
        };
        let resource_id = setup.resource_id.clone();
        let resource_name = Self::resource_name(provider, &resource_id, &setup.env);
        info!(provider = %provider, auth_method = setup.auth_method, resource = %resource_id, "cloud_exec dispatch");

        // ── gcloud project-query intercept ───────────────────────────────────
        // `gcloud config get-value project` ignores env vars; answer with the
        // effective impersonated project instead of shelling out.
        if is_project_query(provider, &original_command) && !resource_id.is_empty() {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": true,
                    "command": original_command,
                    "final_command": original_command,
                    "resource_id": resource_id,
                    "resource_name": resource_name,
                    "auth_method": setup.auth_method,
                    "provider": provider.as_str(),
                    "return_code": 0,
                    "chat_output": resource_id,
                    "output": format!("{resource_id}\n"),
                }),
                false,
            );
        }

        // ── Tailscale REST translation ───────────────────────────────────────
        if provider == CloudProvider::Tailscale {
            if ctx.mode.is_read_only() && !is_read_only_command(&original_command) {
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "success": false,
                        "error": "This session is read-only; the command would modify the tailnet.",
                        "code": "READ_ONLY_MODE",
                        "final_command": original_command,
                        "provider": "tailscale",
                    }),
                    true,
                );
            }
            if !is_read_only_command(&original_command) {
                let summary = summarize_cloud_command(&original_command);
                if !ctx.confirm.confirm(&summary, "cloud_exec", &ctx.session_id).await {
                    return self.finish(
                        ctx,
                        &original_args,
                        json!({
                            "status": "cancelled",
                            "success": false,
                            "message": "cloud_exec command cancelled by user",
                            "chat_output": "Command cancelled.",
                            "user_cancelled": true,
                            "final_command": original_command,
                        }),
                        false,
                    );
                }
            }
            let result = execute_tailscale_command(self.tailscale.as_ref(), &original_command, &setup.env).await;
            let mut envelope = json!({
                "success": result["success"],
                "command": original_command,
                "final_command": original_command,
                "resource_id": resource_id,
                "resource_name": resource_name,
                "auth_method": setup.auth_method,
                "provider": "tailscale",
                "return_code": result["return_code"],
                "chat_output": result
                    .get("chat_output")
                    .cloned()
                    .unwrap_or_else(|| result.get("error").cloned().unwrap_or(json!("Command executed"))),
            });
            let is_error = !result["success"].as_bool().unwrap_or(false);
            if is_error {
                envelope["error"] = result.get("error").cloned().unwrap_or(json!("Unknown error"));
            }
            if let Some(output) = result.get("output") {
                envelope["output"] = output.clone();
            }
            return self.finish(ctx, &original_args, envelope, is_error);
        }

        // ── CLI selection + flag injection ───────────────────────────────────
        let cli = target_cli(provider, &original_command);
        let sa_email = setup.env.get("CLOUDSDK_IMPERSONATE_SERVICE_ACCOUNT").map(str::to_string);
        let command = inject_flags(
            provider,
            &original_command,
            &resource_id,
            setup.auth_method,
            sa_email.as_deref(),
        );

        // ── Read-only gate ───────────────────────────────────────────────────
        let read_only = is_read_only_command(&command);
        if ctx.mode.is_read_only() && !read_only {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": false,
                    "error": "This session is read-only; the command would modify infrastructure.",
                    "code": "READ_ONLY_MODE",
                    "final_command": command,
                    "provider": provider.as_str(),
                }),
                true,
            );
        }

        // ── Destructive-action confirmation ──────────────────────────────────
        if !read_only {
            let summary = summarize_cloud_command(&command);
            if !ctx.confirm.confirm(&summary, "cloud_exec", &ctx.session_id).await {
                // Captured so the transcript persists the decision.
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "status": "cancelled",
                        "success": false,
                        "message": "cloud_exec command cancelled by user",
                        "chat_output": "Command cancelled.",
                        "user_cancelled": true,
                        "final_command": command,
                    }),
                    false,
                );
            }
        }

        // ── CLI availability ─────────────────────────────────────────────────
        if !self.runner.cli_available(cli, &setup.env).await {
            return self.finish(
                ctx,
                &original_args,
                json!({
                    "success": false,
                    "error": format!("CLI tool '{cli}' is not installed or not available in PATH"),
                    "cli_tool": cli,
                    "provider": provider.as_str(),
                    "command": command,
                    "final_command": command,
                    "resource_id": resource_id,
                    "auth_method": setup.auth_method,
                }),
                true,
            );
        }

        let argv = match split_command(&command) {
            Ok(a) => a,
            Err(e) => {
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "success": false,
                        "error": format!("Command parsing failed: {e}"),
                        "command": command,
                        "final_command": command,
                        "resource_id": resource_id,
                        "resource_name": resource_name,
                        "auth_method": setup.auth_method,
                    }),
                    true,
                );
            }
        };
        let effective_timeout = command_timeout(&command, timeout_override, &self.cfg);

        // ── Azure auth chaining ──────────────────────────────────────────────
        // The service-principal login runs first, in the same isolated env,
        // so the user command authenticates against the right subscription.
        if let Some(auth_command) = &setup.auth_command {
            let auth_argv = match split_command(auth_command) {
                Ok(a) => a,
                Err(e) => {
                    return self.finish(
                        ctx,
                        &original_args,
                        json!({"success": false, "error": format!("auth command parsing failed: {e}"), "final_command": command}),
                        true,
                    );
                }
            };
            match self.runner.run(&auth_argv, &setup.env, Duration::from_secs(30)).await {
                RunOutcome::Finished { code: 0, .. } => {
                    info!("azure authentication successful");
                }
                RunOutcome::Finished { stderr, .. } => {
                    return self.finish(
                        ctx,
                        &original_args,
                        json!({
                            "success": false,
                            "error": format!("Azure authentication failed: {}", filter_error_messages(&stderr)),
                            "command": command,
                            "final_command": command,
                        }),
                        true,
                    );
                }
                other => {
                    return self.finish(
                        ctx,
                        &original_args,
                        json!({
                            "success": false,
                            "error": format!("Azure authentication error: {other:?}"),
                            "command": command,
                            "final_command": command,
                        }),
                        true,
                    );
                }
            }
        }

        // ── Execution ────────────────────────────────────────────────────────
        let outcome = self.runner.run(&argv, &setup.env, effective_timeout).await;
        let (stdout, stderr, code) = match outcome {
            RunOutcome::Finished { stdout, stderr, code } => (stdout, stderr, code),
            RunOutcome::NotFound => {
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "success": false,
                        "error": format!("CLI tool '{cli}' not found. This may indicate it's not installed or not in PATH."),
                        "cli_tool": cli,
                        "provider": provider.as_str(),
                        "command": command,
                        "final_command": command,
                        "resource_id": resource_id,
                        "resource_name": resource_name,
                        "auth_method": setup.auth_method,
                    }),
                    true,
                );
            }
            RunOutcome::TimedOut => {
                // Timeouts are captured as non-error: the operation may well
                // still be progressing server-side.
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "success": false,
                        "error": format!("Command timed out after {} s", effective_timeout.as_secs()),
                        "command": command,
                        "final_command": command,
                        "provider": provider.as_str(),
                        "resource_id": resource_id,
                        "auth_method": setup.auth_method,
                    }),
                    false,
                );
            }
            RunOutcome::SpawnError(e) => {
                return self.finish(
                    ctx,
                    &original_args,
                    json!({
                        "success": false,
                        "error": format!("Unexpected error executing command: {e}"),
                        "command": command,
                        "final_command": command,
                        "resource_id": resource_id,
                        "auth_method": setup.auth_method,
                    }),
                    true,
                );
            }
        };

        // ── Post-process ─────────────────────────────────────────────────────
        let serial_hint = extract_serial_port_hint(&stderr);
        let (has_stderr_error, stderr_error) = detect_errors_in_stderr(&stderr);
        let actual_success = code == 0 && !has_stderr_error;
        let is_serial_port = command.contains("get-serial-port-output");

        let chat_output = if actual_success {
            let mut out = if is_serial_port {
                if stdout.trim().is_empty() {
                    "No new serial port output since the specified position.".to_string()
                } else {
                    sanitize_no_truncate(&stdout)
                }
            } else {
                let mut text = stdout.trim().to_string();
                if text.is_empty() && !stderr.trim().is_empty() && !has_stderr_error {
                    // Many CLIs confirm success on stderr ("Deleted [...]").
                    text = stderr.trim().to_string();
                }
                if text.is_empty() {
                    "Command executed successfully".to_string()
                } else {
                    sanitize_command_output(&text, OUTPUT_TRUNCATE_LIMIT)
                }
            };
            // The pagination hint goes at the tail so it survives model
            // summarisation.
            if let Some(hint) = &serial_hint {
                out = format!("{out}\n\n[stderr note] {hint}");
            }
            out
        } else {
            failure_chat_output(provider, &stdout, &stderr, code)
        };

        let mut response = json!({
            "success": actual_success,
            "command": command,
            "final_command": command,
            "resource_id": resource_id,
            "resource_name": resource_name,
            "auth_method": setup.auth_method,
            "provider": provider.as_str(),
            "return_code": code,
            "chat_output": chat_output,
        });

        if has_stderr_error {
            response["error"] = json!(stderr_error);
            warn!(code, "command exit 0 but stderr contained errors");
        }

        // Output-file sink for kubeconfig / helm values.
        if let (Some(path), true, false) = (&output_file, actual_success, stdout.is_empty()) {
            match write_output_file(path, &stdout).await {
                Ok(()) => {
                    response["output_file"] = json!(path);
                    info!(path = %path, "wrote command output to file");
                }
                Err(e) => {
                    let note = format!(
                        "{}\n\nWarning: Failed to write output to {path}: {e}",
                        response["chat_output"].as_str().unwrap_or("")
                    );
                    response["chat_output"] = json!(note);
                }
            }
        }

        if actual_success {
            if stdout.trim().is_empty() {
                response["message"] = json!("Command executed successfully");
            } else {
                match serde_json::from_str::<Value>(&stdout) {
                    Ok(parsed) => {
                        let shaped = shape_output(provider.as_str(), &command, &parsed);
                        if let Value::Object(fields) = shaped {
                            for (k, v) in fields {
                                response[k] = v;
                            }
                        }
                    }
                    Err(_) => {
                        if !is_serial_port {
                            response["output"] =
                                json!(sanitize_command_output(&stdout, OUTPUT_TRUNCATE_LIMIT));
                        } else {
                            response["output"] = json!(sanitize_no_truncate(&stdout));
                        }
                    }
                }
            }
        } else {
            response["error"] = json!(sanitize_command_output(
                &non_empty_or(filter_error_messages(&stderr), &stdout),
                OUTPUT_TRUNCATE_LIMIT
            ));
        }

        // ── Projection-based compression ─────────────────────────────────────
        let rendered = serde_json::to_string_pretty(&response).unwrap_or_default();
        let response_tokens = estimate_tokens(&rendered);
        if response_tokens > self.cfg.projection_token_threshold
            && !command_already_filtered(&command)
        {
            if let Some((projection_cmd, reason)) = build_projection_command(provider, &command) {
                warn!(
                    response_tokens,
                    "large response; retrying with projection preview"
                );
                if let Ok(projection_argv) = split_command(&projection_cmd) {
                    if let RunOutcome::Finished {
                        stdout: p_stdout,
                        stderr: p_stderr,
                        code: 0,
                    } = self.runner.run(&projection_argv, &setup.env, effective_timeout).await
                    {
                        let filtered_output = sanitize_command_output(
                            if p_stdout.trim().is_empty() { &p_stderr } else { &p_stdout },
                            OUTPUT_TRUNCATE_LIMIT,
                        );
                        response["filter_applied"] = json!(true);
                        response["filter_command"] = json!(projection_cmd);
                        response["filter_reason"] = json!(reason);
                        response["original_command"] = json!(command);
                        response["original_chat_output"] = response["chat_output"].clone();
                        response["original_reference"] = json!(
                            "Full result available; rerun without projection or with a different filter if needed."
                        );
                        let preview = serde_json::from_str::<Value>(&p_stdout)
                            .map(|v| aurora_tools::sanitize::truncate_json_fields(&v, 10_000))
                            .unwrap_or_else(|_| json!(filtered_output));
                        response["preview_data"] = preview.clone();
                        response["data"] = preview;
                        response["chat_output"] = json!(filtered_output);
                        response["final_command"] = json!(projection_cmd);
                    } else {
                        warn!("projection retry failed; returning original output");
                    }
                }
            } else {
                // AWS and non-list commands: no safe generic projection.
                response["large_output_note"] = json!(large_output_note(response_tokens));
            }
            let rerendered = serde_json::to_string_pretty(&response).unwrap_or_default();
            if estimate_tokens(&rerendered) > self.cfg.projection_token_threshold
                && response.get("large_output_note").is_none()
            {
                response["large_output_note"] =
                    json!(large_output_note(estimate_tokens(&rerendered)));
            }
        }

        let is_error = !actual_success && !has_stderr_error;
        self.finish(ctx, &original_args, response, is_error)
    }
}

/// Detect gcloud serial-port pagination hints so they surface as context
/// instead of errors.
fn extract_serial_port_hint(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find(|line| {
            let lowered = line.to_ascii_lowercase();
            lowered.contains("get-serial-port-output") && lowered.contains("--start=")
        })
        .map(|l| l.trim().to_string())
}

fn non_empty_or(primary: String, fallback: &str) -> String {
    if primary.trim().is_empty() {
        fallback.to_string()
    } else {
        primary
    }
}

/// Provider-aware failure message extraction.
fn failure_chat_output(provider: CloudProvider, stdout: &str, stderr: &str, code: i32) -> String {
    match provider {
        // OVH API errors often arrive as JSON on stdout.
        CloudProvider::Ovh => {
            if !stdout.trim().is_empty() {
                if let Ok(v) = serde_json::from_str::<Value>(stdout) {
                    if let Some(message) = v["message"].as_str() {
                        return format!("OVH API Error: {message}");
                    }
                }
                return sanitize_command_output(stdout, OUTPUT_TRUNCATE_LIMIT);
            }
            let filtered = filter_error_messages(stderr);
            if filtered.trim().is_empty() {
                format!("OVH command failed with exit code {code}. Check the OVH console for details.")
            } else {
                sanitize_command_output(&filtered, OUTPUT_TRUNCATE_LIMIT)
            }
        }
        // Scaleway errors split across both streams; combine for visibility.
        CloudProvider::Scaleway => {
            let mut parts = Vec::new();
            if !stdout.trim().is_empty() {
                parts.push(format!("stdout: {}", stdout.trim()));
            }
            if !stderr.trim().is_empty() {
                parts.push(format!("stderr: {}", stderr.trim()));
            }
            if parts.is_empty() {
                format!("Scaleway command failed with exit code {code}. Check the Scaleway console for details.")
            } else {
                sanitize_command_output(&parts.join(" | "), OUTPUT_TRUNCATE_LIMIT)
            }
        }
        _ => {
            let filtered = filter_error_messages(stderr);
            let text = non_empty_or(filtered, stdout);
            if text.trim().is_empty() {
                format!("Command failed with exit code {code}.")
            } else {
                sanitize_command_output(&text, OUTPUT_TRUNCATE_LIMIT)
            }
        }
    }
}

async fn write_output_file(path: &str, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_tools::runner::ScriptedRunner;
    use crate::tailscale::TailscaleApi;
    use aurora_config::SessionMode;
    use aurora_creds::minters::{FakeStsClient, FakeTokenMinter};
    use aurora_creds::{AwsConnection, InMemoryCredentialStore};
    use aurora_tools::{AutoApproveGate, AutoCancelGate, ConfirmationGate, ToolCapture};
    use std::sync::Mutex;

    struct NullTailscale;

    #[async_trait]
    impl TailscaleApi for NullTailscale {
        async fn list_devices(&self, _t: &str, _n: &str) -> anyhow::Result<Value> {
            Ok(json!([{"id": "d1"}]))
        }
        async fn get_device(&self, _t: &str, _id: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
        async fn authorize_device(&self, _t: &str, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_device(&self, _t: &str, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_device_tags(&self, _t: &str, _id: &str, _tags: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_keys(&self, _t: &str, _n: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
        async fn create_key(&self, _t: &str, _n: &str, _r: bool, _e: bool, _tags: &[String]) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
        async fn delete_key(&self, _t: &str, _n: &str, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_acl(&self, _t: &str, _n: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
        async fn dns(&self, _t: &str, _n: &str, _k: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
        async fn routes(&self, _t: &str, _n: &str) -> anyhow::Result<Value> {
            Ok(json!([]))
        }
    }

    /// Gate that records whether it was consulted.
    struct RecordingGate {
        approve: bool,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConfirmationGate for RecordingGate {
        async fn confirm(&self, summary: &str, _tool: &str, _session: &str) -> bool {
            self.asked.lock().unwrap().push(summary.to_string());
            self.approve
        }
    }

    struct Fixture {
        tool: CloudExecTool,
        runner: Arc<ScriptedRunner>,
        capture: Arc<ToolCapture>,
        store: Arc<InMemoryCredentialStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryCredentialStore::new());
        let broker = Arc::new(CredentialBroker::new(
            store.clone(),
            Arc::new(FakeTokenMinter),
            Arc::new(FakeStsClient),
        ));
        let runner = Arc::new(ScriptedRunner::new());
        let tool = CloudExecTool::new(
            broker,
            runner.clone(),
            Arc::new(NullTailscale),
            CloudConfig::default(),
        );
        Fixture {
            tool,
            runner,
            capture: Arc::new(ToolCapture::new("sess-1", "user-1")),
            store,
        }
    }

    fn ctx_with(
        fixture: &Fixture,
        mode: SessionMode,
        preference: Vec<CloudProvider>,
        gate: Arc<dyn ConfirmationGate>,
    ) -> ToolCtx {
        ToolCtx {
            user_id: "user-1".into(),
            session_id: "sess-1".into(),
            mode,
            preference,
            selected_project: None,
            incident_id: None,
            recent_user_messages: vec![],
            capture: fixture.capture.clone(),
            confirm: gate,
        }
    }

    fn parse(out: &ToolOutput) -> Value {
        serde_json::from_str(&out.content).unwrap()
    }

    // ── Scenario: GCP VM list ─────────────────────────────────────────────────

    #[tokio::test]
    async fn gcp_vm_list_runs_without_confirmation() {
        let f = fixture();
        let instances = json!([{
            "name": "web-1", "status": "RUNNING",
            "machineType": "zones/us-central1-a/machineTypes/e2-medium",
            "zone": "zones/us-central1-a",
            "networkInterfaces": [{"networkIP": "10.0.0.2", "accessConfigs": [{"natIP": "34.1.2.3"}]}],
        }]);
        f.runner.ok(
            "gcloud compute instances list --zone=us-central1-a --project=test-project --format=json",
            &instances.to_string(),
        );
        let gate = Arc::new(RecordingGate { approve: true, asked: Mutex::new(vec![]) });
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], gate.clone());

        let out = f
            .tool
            .execute(
                json!({"provider": "gcp", "command": "compute instances list --zone=us-central1-a"}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], true);
        assert_eq!(v["return_code"], 0);
        assert_eq!(v["data"]["resources"][0]["name"], "web-1");
        assert_eq!(v["data"]["resources"][0]["externalIP"], "34.1.2.3");
        // Read-only commands never prompt.
        assert!(gate.asked.lock().unwrap().is_empty());
    }

    // ── Scenario: read-only mode denies writes without a subprocess ──────────

    #[tokio::test]
    async fn read_only_mode_denies_delete_without_subprocess() {
        let f = fixture();
        f.store.insert_aws_connection(
            "user-1",
            AwsConnection {
                account_id: "111".into(),
                role_arn: "arn:role/a".into(),
                read_only_role_arn: None,
                region: Some("us-east-1".into()),
            },
        );
        f.store.set_external_id("user-1", "ext");
        let gate = Arc::new(RecordingGate { approve: true, asked: Mutex::new(vec![]) });
        let ctx = ctx_with(&f, SessionMode::Ask, vec![CloudProvider::Aws], gate.clone());

        let out = f
            .tool
            .execute(
                json!({"provider": "aws", "command": "ec2 terminate-instances --instance-ids i-01234"}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], false);
        assert_eq!(v["code"], "READ_ONLY_MODE");
        // No confirmation prompt and no subprocess.
        assert!(gate.asked.lock().unwrap().is_empty());
        assert_eq!(f.runner.invocation_count(), 0);
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_delete_is_captured_as_non_error() {
        let f = fixture();
        let args = json!({"provider": "gcp", "command": "compute instances delete web-1"});
        f.capture.capture_tool_start("call-1", "cloud_exec", &args);
        let ctx = ctx_with(
            &f,
            SessionMode::Agent,
            vec![CloudProvider::Gcp],
            Arc::new(AutoCancelGate),
        );

        let out = f.tool.execute(args, &ctx).await;
        let v = parse(&out);
        assert_eq!(v["status"], "cancelled");
        assert_eq!(v["user_cancelled"], true);
        assert!(!out.is_error);
        // The capture holds a non-error cancellation record.
        let records = f.capture.collected();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_error);
        assert!(records[0].output.as_ref().unwrap().contains("cancelled"));
        assert_eq!(f.runner.invocation_count(), 0);
    }

    // ── Confirmation approval path ───────────────────────────────────────────

    #[tokio::test]
    async fn destructive_command_runs_after_approval() {
        let f = fixture();
        f.runner.ok(
            "gcloud compute instances delete web-1 --project=test-project --quiet",
            "Deleted [web-1].",
        );
        let gate = Arc::new(RecordingGate { approve: true, asked: Mutex::new(vec![]) });
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], gate.clone());

        let out = f
            .tool
            .execute(
                json!({"provider": "gcp", "command": "compute instances delete web-1"}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], true, "envelope: {v}");
        let asked = gate.asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert!(asked[0].contains("delete"));
    }

    // ── Provider resolution ──────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_preference_is_requires_connection() {
        let f = fixture();
        let ctx = ctx_with(&f, SessionMode::Agent, vec![], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(json!({"provider": "gcp", "command": "compute instances list"}), &ctx)
            .await;
        let v = parse(&out);
        assert_eq!(v["requires_connection"], true);
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn unparseable_provider_falls_back_to_context_then_first_preference() {
        let f = fixture();
        f.runner.fallback(RunOutcome::Finished {
            stdout: "[]".into(),
            stderr: String::new(),
            code: 0,
        });
        let mut ctx = ctx_with(
            &f,
            SessionMode::Agent,
            vec![CloudProvider::Gcp, CloudProvider::Scaleway],
            Arc::new(AutoApproveGate),
        );
        ctx.recent_user_messages = vec!["list the scaleway instances".into()];
        f.store.insert_tokens(
            "user-1",
            CloudProvider::Scaleway,
            json!({"access_key": "k", "secret_key": "s", "default_project_id": "p"}),
        );
        let out = f
            .tool
            .execute(json!({"provider": "cloud", "command": "instance server list"}), &ctx)
            .await;
        let v = parse(&out);
        assert_eq!(v["provider"], "scaleway");
    }

    // ── gcloud project intercept ─────────────────────────────────────────────

    #[tokio::test]
    async fn project_query_is_answered_without_subprocess() {
        let f = fixture();
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(
                json!({"provider": "gcp", "command": "gcloud config get-value project"}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], true);
        assert_eq!(v["chat_output"], "test-project");
        assert_eq!(f.runner.invocation_count(), 0);
    }

    // ── stderr soft failure ──────────────────────────────────────────────────

    #[tokio::test]
    async fn stderr_error_with_exit_zero_is_soft_failure() {
        let f = fixture();
        f.runner.on(
            "gcloud compute instances list --project=test-project --format=json",
            RunOutcome::Finished {
                stdout: "[]".into(),
                stderr: "ERROR: quota exceeded for quota metric".into(),
                code: 0,
            },
        );
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(json!({"provider": "gcp", "command": "compute instances list"}), &ctx)
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], false);
        assert!(v["error"].as_str().unwrap().contains("quota"));
        assert_eq!(v["return_code"], 0);
    }

    // ── Timeout envelope ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn timeout_returns_non_error_envelope() {
        let f = fixture();
        f.runner.fallback(RunOutcome::TimedOut);
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(
                json!({"provider": "gcp", "command": "compute instances list", "timeout": 5}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert!(v["error"].as_str().unwrap().contains("timed out after 5 s"));
        assert!(!out.is_error);
    }

    // ── Multi-account fan-out ────────────────────────────────────────────────

    #[tokio::test]
    async fn aws_multi_account_merges_results_by_account() {
        let f = fixture();
        for acct in ["111", "222"] {
            f.store.insert_aws_connection(
                "user-1",
                AwsConnection {
                    account_id: acct.into(),
                    role_arn: format!("arn:role/{acct}"),
                    read_only_role_arn: None,
                    region: Some("us-east-1".into()),
                },
            );
        }
        f.store.set_external_id("user-1", "ext");
        f.runner.fallback(RunOutcome::Finished {
            stdout: json!({"Reservations": []}).to_string(),
            stderr: String::new(),
            code: 0,
        });
        let gate = Arc::new(RecordingGate { approve: true, asked: Mutex::new(vec![]) });
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Aws], gate.clone());

        let out = f
            .tool
            .execute(json!({"provider": "aws", "command": "ec2 describe-instances"}), &ctx)
            .await;
        let v = parse(&out);
        assert_eq!(v["multi_account"], true);
        assert_eq!(v["accounts_queried"], 2);
        assert_eq!(v["results_by_account"]["111"]["success"], true);
        assert_eq!(v["results_by_account"]["222"]["success"], true);
        // Read-only verb: the single aggregate confirmation is suppressed.
        assert!(gate.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn aws_explicit_account_skips_fan_out() {
        let f = fixture();
        for acct in ["111", "222"] {
            f.store.insert_aws_connection(
                "user-1",
                AwsConnection {
                    account_id: acct.into(),
                    role_arn: format!("arn:role/{acct}"),
                    read_only_role_arn: None,
                    region: Some("us-east-1".into()),
                },
            );
        }
        f.store.set_external_id("user-1", "ext");
        f.runner.fallback(RunOutcome::Finished {
            stdout: "{}".into(),
            stderr: String::new(),
            code: 0,
        });
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Aws], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(
                json!({"provider": "aws", "command": "ec2 describe-instances", "account_id": "222"}),
                &ctx,
            )
            .await;
        let v = parse(&out);
        assert!(v.get("multi_account").is_none());
        assert_eq!(v["provider"], "aws");
    }

    // ── Projection compression ───────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_list_triggers_projection_retry() {
        let f = fixture();
        // ~200 KB of list output → well past the 30 K-token threshold.
        let big: Vec<Value> = (0..2000)
            .map(|i| json!({"name": format!("proj-{i}"), "status": "ACTIVE", "padding": "x".repeat(80)}))
            .collect();
        f.runner.ok(
            "gcloud projects list --project=test-project --format=json",
            &json!(big).to_string(),
        );
        f.runner.ok(
            r#"gcloud projects list --project=test-project --format=value(name,status)"#,
            "proj-0 ACTIVE\nproj-1 ACTIVE",
        );
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Gcp], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(json!({"provider": "gcp", "command": "projects list"}), &ctx)
            .await;
        let v = parse(&out);
        // Both forms present; final_command is the projection.
        assert_eq!(v["filter_applied"], true);
        assert!(v["final_command"].as_str().unwrap().contains("value(name,status)"));
        assert!(v.get("original_reference").is_some());
        assert!(v.get("original_chat_output").is_some());
        assert_eq!(f.runner.invocation_count(), 2);
    }

    // ── Tailscale translation ────────────────────────────────────────────────

    #[tokio::test]
    async fn tailscale_commands_route_to_rest() {
        let f = fixture();
        f.store.insert_tokens(
            "user-1",
            CloudProvider::Tailscale,
            json!({
                "client_id": "cid", "client_secret": "cs",
                "tailnet": "corp.example", "tailnet_name": "corp",
                "token_data": {"access_token": "tok", "expires_at": 9999999999i64},
            }),
        );
        let ctx = ctx_with(&f, SessionMode::Agent, vec![CloudProvider::Tailscale], Arc::new(AutoApproveGate));
        let out = f
            .tool
            .execute(json!({"provider": "tailscale", "command": "device list"}), &ctx)
            .await;
        let v = parse(&out);
        assert_eq!(v["success"], true);
        assert_eq!(v["provider"], "tailscale");
        assert_eq!(v["resource_name"], "Tailscale - corp");
        assert_eq!(f.runner.invocation_count(), 0);
    }
}
