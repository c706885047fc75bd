// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! CLI selection and provider-specific flag injection.
//!
//! The command is normalised before gating and execution: the provider's
//! default CLI is prepended when missing, explicit project/region flags are
//! injected so no global CLI state is consulted, JSON output is requested
//! for read-style verbs, and deletions get `--quiet` so the CLI never
//! blocks on its own prompt.  `terraform` runs without provider prefixing.

use aurora_config::CloudProvider;
use tracing::debug;

/// CLIs accepted per provider; the first entry is the default.
pub fn supported_clis(provider: CloudProvider) -> &'static [&'static str] {
    match provider {
        CloudProvider::Gcp => &["gcloud", "kubectl", "gsutil", "bq", "helm", "terraform"],
        CloudProvider::Aws => &["aws", "kubectl", "eksctl", "sam", "cdk", "helm", "terraform"],
        CloudProvider::Azure => &["az", "kubectl", "helm", "terraform"],
        CloudProvider::Ovh => &["ovhcloud", "kubectl", "helm", "terraform"],
        CloudProvider::Scaleway => &["scw", "kubectl", "helm", "terraform"],
        CloudProvider::Tailscale => &[],
    }
}

/// The binary the command targets: its own first token when recognised,
/// otherwise the provider default.
pub fn target_cli(provider: CloudProvider, command: &str) -> &'static str {
    let supported = supported_clis(provider);
    let first = command
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    supported
        .iter()
        .find(|c| **c == first)
        .copied()
        .unwrap_or_else(|| supported.first().copied().unwrap_or(""))
}

/// Normalise a command for execution.  `resource_id` is the effective
/// project / region / subscription; `sa_email` enables the gsutil
/// impersonation flag.  Returns the final command string.
pub fn inject_flags(
    provider: CloudProvider,
    command: &str,
    resource_id: &str,
    auth_method: &str,
    sa_email: Option<&str>,
) -> String {
    let cli = target_cli(provider, command);
    let mut cmd = command.trim().to_string();

    // Terraform runs as-is: no provider prefixing, no flag injection.
    if cli == "terraform" {
        return cmd;
    }

    // Prepend the default CLI when the command doesn't start with any
    // recognised one.
    let first = cmd.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
    if !supported_clis(provider).contains(&first.as_str()) && !cli.is_empty() {
        cmd = format!("{cli} {cmd}");
    }

    match (provider, cli) {
        (CloudProvider::Gcp, "gcloud") => {
            // `gcloud config` manages configuration, not resources — no
            // project injection there.
            let is_config_command = cmd.contains("gcloud config");
            if !resource_id.is_empty() && !cmd.contains("--project") && !is_config_command {
                cmd.push_str(&format!(" --project={resource_id}"));
                debug!(project = resource_id, "using explicit project");
            }
            if !cmd.contains("--format") && (cmd.contains("list") || cmd.contains("describe")) {
                cmd.push_str(" --format=json");
            }
            if cmd.contains("delete") && !cmd.contains("--quiet") && !cmd.contains("-q") {
                cmd.push_str(" --quiet");
            }
        }
        (CloudProvider::Gcp, "gsutil") => {
            // Impersonation: gsutil does not read the CLOUDSDK_* env vars.
            if auth_method == "impersonated" {
                if let Some(email) = sa_email {
                    if !cmd.split_whitespace().any(|t| t == "-i") {
                        cmd = cmd.replacen("gsutil", &format!("gsutil -i {email}"), 1);
                        debug!(sa = email, "injected gsutil impersonation flag");
                    }
                }
            }
        }
        (CloudProvider::Aws, "aws") => {
            if !resource_id.is_empty() && !cmd.contains("--region") {
                cmd.push_str(&format!(" --region {resource_id}"));
                debug!(region = resource_id, "using explicit region");
            }
            if !cmd.contains("--output")
                && (cmd.contains("list") || cmd.contains("describe") || cmd.contains("get"))
            {
                cmd.push_str(" --output json");
            }
        }
        (CloudProvider::Azure, "az") => {
            // No subscription auto-append: `az login` set the default.
            if !cmd.contains("--output")
                && !cmd.contains("-o ")
                && (cmd.contains("list") || cmd.contains("show"))
            {
                cmd.push_str(" --output=json");
            }
        }
        (CloudProvider::Ovh, "ovhcloud") => {
            // kubeconfig output must stay raw YAML for kubectl.
            if !cmd.contains("--json")
                && !cmd.contains("-j")
                && (cmd.contains("list") || cmd.contains("get"))
                && !cmd.contains("kubeconfig")
            {
                cmd.push_str(" --json");
            }
        }
        (CloudProvider::Scaleway, "scw") => {
            if !cmd.contains("-o ")
                && !cmd.contains("--output")
                && (cmd.contains("list") || cmd.contains("get"))
                && !cmd.contains("kubeconfig")
            {
                cmd.push_str(" -o json");
            }
        }
        _ => {}
    }

    cmd
}

/// True for the one gcloud subcommand that ignores environment variables:
/// the dispatcher intercepts it and answers with the effective project.
pub fn is_project_query(provider: CloudProvider, command: &str) -> bool {
    if provider != CloudProvider::Gcp {
        return false;
    }
    let normalized = {
        let c = command.trim();
        if c.starts_with("gcloud") {
            c.to_string()
        } else {
            format!("gcloud {c}")
        }
    };
    normalized == "gcloud config get-value project"
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── CLI selection ─────────────────────────────────────────────────────────

    #[test]
    fn bare_command_gets_the_default_cli() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "compute instances list",
            "proj-1",
            "impersonated",
            None,
        );
        assert!(cmd.starts_with("gcloud compute instances list"));
    }

    #[test]
    fn recognised_cli_is_kept() {
        assert_eq!(target_cli(CloudProvider::Gcp, "kubectl get pods"), "kubectl");
        assert_eq!(target_cli(CloudProvider::Aws, "eksctl create cluster"), "eksctl");
    }

    #[test]
    fn terraform_is_exempt_from_prefixing_and_flags() {
        let cmd = inject_flags(
            CloudProvider::Aws,
            "terraform plan",
            "us-east-1",
            "access_key",
            None,
        );
        assert_eq!(cmd, "terraform plan");
    }

    // ── Flag injection ────────────────────────────────────────────────────────

    #[test]
    fn gcp_list_gets_project_and_json() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "compute instances list --zone=us-central1-a",
            "proj-1",
            "impersonated",
            None,
        );
        assert!(cmd.contains("--project=proj-1"));
        assert!(cmd.contains("--format=json"));
    }

    #[test]
    fn gcp_existing_project_flag_is_respected() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "compute instances list --project=other",
            "proj-1",
            "impersonated",
            None,
        );
        assert!(!cmd.contains("proj-1"));
    }

    #[test]
    fn gcp_config_commands_skip_project_injection() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "gcloud config list",
            "proj-1",
            "impersonated",
            None,
        );
        assert!(!cmd.contains("--project="));
    }

    #[test]
    fn gcp_delete_gets_quiet() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "compute instances delete web-1",
            "proj-1",
            "impersonated",
            None,
        );
        assert!(cmd.ends_with("--quiet"));
    }

    #[test]
    fn gsutil_impersonation_flag_injected() {
        let cmd = inject_flags(
            CloudProvider::Gcp,
            "gsutil ls gs://bucket",
            "proj-1",
            "impersonated",
            Some("sa@proj.iam.gserviceaccount.com"),
        );
        assert!(cmd.starts_with("gsutil -i sa@proj.iam.gserviceaccount.com ls"));
    }

    #[test]
    fn aws_read_gets_region_and_json_output() {
        let cmd = inject_flags(
            CloudProvider::Aws,
            "ec2 describe-instances",
            "eu-west-1",
            "access_key",
            None,
        );
        assert!(cmd.contains("--region eu-west-1"));
        assert!(cmd.contains("--output json"));
    }

    #[test]
    fn azure_show_gets_json_but_no_subscription() {
        let cmd = inject_flags(CloudProvider::Azure, "vm list", "sub-1", "service_principal", None);
        assert!(cmd.contains("--output=json"));
        assert!(!cmd.contains("--subscription"));
    }

    #[test]
    fn ovh_kubeconfig_stays_raw() {
        let cmd = inject_flags(
            CloudProvider::Ovh,
            "cloud kube kubeconfig get my-cluster",
            "p-1",
            "oauth2_access_token",
            None,
        );
        assert!(!cmd.contains("--json"));
    }

    #[test]
    fn scaleway_list_gets_json_output() {
        let cmd = inject_flags(
            CloudProvider::Scaleway,
            "instance server list",
            "p-1",
            "api_key",
            None,
        );
        assert!(cmd.ends_with("-o json"));
    }

    // ── Project query intercept ───────────────────────────────────────────────

    #[test]
    fn project_query_is_detected_with_and_without_prefix() {
        assert!(is_project_query(CloudProvider::Gcp, "gcloud config get-value project"));
        assert!(is_project_query(CloudProvider::Gcp, "config get-value project"));
        assert!(!is_project_query(CloudProvider::Gcp, "gcloud config list"));
        assert!(!is_project_query(CloudProvider::Aws, "gcloud config get-value project"));
    }
}
