// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Command classification: read-only detection, adaptive timeouts, shell
//! tokenisation and the human confirmation summary.

use std::time::Duration;

use aurora_config::CloudConfig;

/// Verbs that only observe state.
const READ_ONLY_VERBS: &[&str] = &[
    "list", "describe", "get", "show", "config", "version", "info", "status", "read", "view",
    "help", "logs", "top",
];

/// Non-exhaustive but conservative set of verbs that change state.
const ACTION_VERBS: &[&str] = &[
    "create", "delete", "update", "apply", "destroy", "terminate", "start", "stop", "restart",
    "attach", "detach", "enable", "disable", "put", "remove",
];

/// Read-only patterns beyond single verbs, including the Tailscale verb
/// forms that carry no classic CLI verb.
const READ_ONLY_PATTERNS: &[&str] = &[
    "--filter",
    "--output=json",
    "--query",
    "status:running",
    "--dry-run",
    "explain",
    "diff",
    "logging read",
    "logging list",
    "logs read",
    "logs list",
    "dns nameservers",
    "dns searchpaths",
    "dns preferences",
    "routes",
    "settings",
    "acl get",
    "acl show",
    "devices",
    "keys",
];

/// Classify a cloud command as read-only.  Defaults to NOT read-only so an
/// unknown verb errs on the side of the confirmation gate.
///
/// Verbs are matched on word boundaries, not substrings — `stop` must not
/// classify as read-only just because it contains `top`.  Hyphenated CLI
/// verbs (`describe-instances`, `get-serial-port-output`) split into words
/// first.
pub fn is_read_only_command(command: &str) -> bool {
    let lowered = command.to_ascii_lowercase();
    let words = lowered.split(|c: char| !c.is_ascii_alphanumeric());
    for word in words {
        if READ_ONLY_VERBS.contains(&word) {
            return true;
        }
    }
    READ_ONLY_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Operations known to run for many minutes: cluster and managed-database
/// create/delete/restore across the supported CLIs.
const VERY_LONG_OPS: &[&str] = &[
    "cluster create",
    "clusters create",
    "create-cluster",
    "create cluster",
    "cluster delete",
    "clusters delete",
    "delete-cluster",
    "delete cluster",
    "sql instances create",
    "instances create",
    "sql instances delete",
    "instances delete",
    "rds create-db-instance",
    "create-db-instance",
    "rds delete-db-instance",
    "delete-db-instance",
    "sql db create",
    "sql server create",
    "sql db delete",
    "sql server delete",
    "restore",
];

const LONG_OPS: &[&str] = &["delete", "create", "update", "deploy", "apply", "install"];

/// Pick the execution timeout: an explicit caller value wins; otherwise the
/// tier follows what the command does.
pub fn command_timeout(command: &str, user_timeout: Option<u64>, cfg: &CloudConfig) -> Duration {
    if let Some(t) = user_timeout {
        return Duration::from_secs(t);
    }
    let lowered = command.to_ascii_lowercase();
    if VERY_LONG_OPS.iter().any(|op| lowered.contains(op)) {
        return Duration::from_secs(cfg.very_long_timeout_secs);
    }
    if LONG_OPS.iter().any(|op| command.contains(op)) {
        return Duration::from_secs(cfg.long_timeout_secs);
    }
    Duration::from_secs(cfg.quick_timeout_secs)
}

/// Split a command line respecting POSIX-style quoting.
///
/// Supports single quotes (literal), double quotes (literal except `\"` and
/// `\\`), and backslash escapes outside quotes.  Returns `Err` on an
/// unterminated quote so the dispatcher can reject the command instead of
/// guessing.
pub fn split_command(command: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\' | '$' | '`')) => current.push(esc),
                            Some(esc) => {
                                current.push('\\');
                                current.push(esc);
                            }
                            None => return Err("unterminated double quote".into()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".into()),
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Build the human summary shown in the confirmation prompt: action verb,
/// resource type (the token before the verb, skipping flags and CLI names),
/// resource name (the token after), and any zone/region flag.
pub fn summarize_cloud_command(command: &str) -> String {
    let tokens = split_command(command).unwrap_or_else(|_| {
        command.split_whitespace().map(str::to_string).collect()
    });

    const CLI_TOKENS: &[&str] = &[
        "gcloud", "az", "aws", "kubectl", "gsutil", "bq", "scw", "ovh", "ovhcloud", "eksctl",
        "helm",
    ];

    let mut action = None;
    let mut resource_type = None;
    let mut resource_name = None;
    let mut zone_or_region = None;

    for (i, tok) in tokens.iter().enumerate() {
        let low = tok.to_ascii_lowercase();

        if ACTION_VERBS.contains(&low.as_str()) || READ_ONLY_VERBS.contains(&low.as_str()) {
            action = Some(low.clone());

            // Resource type: walk backwards past flags and CLI executables.
            let mut j = i;
            while j > 0 {
                j -= 1;
                let prev = tokens[j].to_ascii_lowercase();
                if CLI_TOKENS.contains(&prev.as_str()) || prev.starts_with('-') {
                    continue;
                }
                resource_type = Some(tokens[j].clone());
                break;
            }

            // Resource name: next non-flag token.
            let mut k = i + 1;
            while k < tokens.len() && tokens[k].starts_with('-') {
                k += 1;
            }
            if k < tokens.len() {
                resource_name = Some(tokens[k].clone());
            }
        }

        if let Some(v) = low.strip_prefix("--zone=") {
            zone_or_region = Some(v.to_string());
        } else if low == "--zone" && i + 1 < tokens.len() {
            zone_or_region = Some(tokens[i + 1].clone());
        } else if let Some(v) = low
            .strip_prefix("--region=")
            .or_else(|| low.strip_prefix("--location="))
        {
            zone_or_region = Some(v.to_string());
        } else if matches!(low.as_str(), "--region" | "--location" | "-r" | "-l")
            && i + 1 < tokens.len()
        {
            zone_or_region = Some(tokens[i + 1].clone());
        }
    }

    let mut parts: Vec<String> = Vec::new();
    if let (Some(a), Some(rt)) = (&action, &resource_type) {
        parts.push(format!("The command will {a} {rt}"));
    }
    if let Some(name) = &resource_name {
        if !name.starts_with("--") {
            parts.push(format!("named '{name}'"));
        }
    }
    if let Some(loc) = &zone_or_region {
        parts.push(format!("in {loc}"));
    }

    let core = if parts.is_empty() {
        command.to_string()
    } else {
        parts.join(" ")
    };
    format!("{core}.\n\n")
}

/// Rough token estimate (4 chars per token) for the projection threshold.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CloudConfig {
        CloudConfig::default()
    }

    // ── Read-only classification ──────────────────────────────────────────────

    #[test]
    fn list_and_describe_are_read_only() {
        assert!(is_read_only_command("compute instances list --zone=us-central1-a"));
        assert!(is_read_only_command("ec2 describe-instances"));
        assert!(is_read_only_command("az vm show -n web"));
    }

    #[test]
    fn delete_and_create_are_not_read_only() {
        assert!(!is_read_only_command("compute instances delete web-1 --quiet"));
        assert!(!is_read_only_command("ec2 terminate-instances --instance-ids i-1"));
    }

    #[test]
    fn tailscale_verb_forms_are_read_only() {
        assert!(is_read_only_command("dns nameservers"));
        assert!(is_read_only_command("acl show"));
        assert!(is_read_only_command("devices"));
    }

    #[test]
    fn unknown_verbs_default_to_not_read_only() {
        assert!(!is_read_only_command("frobnicate the-thing"));
    }

    #[test]
    fn stop_is_not_read_only_despite_containing_top() {
        assert!(!is_read_only_command("compute instances stop web-1"));
        assert!(!is_read_only_command("ec2 stop-instances --instance-ids i-1"));
        // But kubectl top genuinely is.
        assert!(is_read_only_command("kubectl top pods"));
    }

    // ── Timeouts ──────────────────────────────────────────────────────────────

    #[test]
    fn explicit_timeout_wins() {
        let d = command_timeout("container clusters create big", Some(7), &cfg());
        assert_eq!(d, Duration::from_secs(7));
    }

    #[test]
    fn cluster_creation_gets_the_long_tier() {
        let d = command_timeout("container clusters create big", None, &cfg());
        assert_eq!(d, Duration::from_secs(1200));
    }

    #[test]
    fn deletes_get_five_minutes() {
        let d = command_timeout("compute instances delete web", None, &cfg());
        assert_eq!(d, Duration::from_secs(300));
    }

    #[test]
    fn reads_get_sixty_seconds() {
        let d = command_timeout("compute instances list", None, &cfg());
        assert_eq!(d, Duration::from_secs(60));
    }

    // ── Shell splitting ───────────────────────────────────────────────────────

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_command("gcloud compute instances list").unwrap(),
            vec!["gcloud", "compute", "instances", "list"]
        );
    }

    #[test]
    fn split_preserves_quoted_arguments() {
        let toks = split_command(r#"gcloud compute ssh vm --command="uptime -p""#).unwrap();
        assert_eq!(toks.last().unwrap(), "--command=uptime -p");
    }

    #[test]
    fn split_single_quotes_are_literal() {
        let toks = split_command(r#"aws ec2 run --tag 'Name=my vm'"#).unwrap();
        assert_eq!(toks.last().unwrap(), "Name=my vm");
    }

    #[test]
    fn split_rejects_unterminated_quote() {
        assert!(split_command("aws ec2 'oops").is_err());
    }

    #[test]
    fn split_handles_escaped_quotes_in_double_quotes() {
        let toks = split_command(r#"echo "say \"hi\"""#).unwrap();
        assert_eq!(toks[1], r#"say "hi""#);
    }

    // ── Summaries ─────────────────────────────────────────────────────────────

    #[test]
    fn summary_names_verb_type_name_and_zone() {
        let s = summarize_cloud_command(
            "gcloud compute instances delete web-1 --zone=us-central1-a",
        );
        assert!(s.contains("delete instances"));
        assert!(s.contains("named 'web-1'"));
        assert!(s.contains("in us-central1-a"));
    }

    #[test]
    fn summary_falls_back_to_the_raw_command() {
        let s = summarize_cloud_command("frobnicate");
        assert!(s.starts_with("frobnicate"));
    }

    #[test]
    fn summary_skips_flags_when_finding_the_resource_name() {
        let s = summarize_cloud_command("aws ec2 terminate-instances --instance-ids i-01234");
        // terminate-instances is not a bare verb; the simpler delete form is.
        let s2 = summarize_cloud_command("aws rds delete db-main --region us-east-1");
        assert!(s2.contains("named 'db-main'"));
        assert!(!s.is_empty());
    }
}
