// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly turned
/// off need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub iac: IacConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Session mode.  Read-only modes deny destructive cloud verbs and
/// destructive IaC actions; background suppresses confirmation prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Full interactive agent: all tools, confirmation gates active.
    #[default]
    Agent,
    /// Read-only question answering.
    Ask,
    /// Unattended RCA investigation: no socket, gates auto-resolve.
    Background,
}

impl SessionMode {
    /// Modes in which write operations are denied.
    pub fn is_read_only(self) -> bool {
        matches!(self, SessionMode::Ask)
    }

    pub fn is_background(self) -> bool {
        matches!(self, SessionMode::Background)
    }
}

/// Cloud providers a user can connect.  Ordering in a preference list is
/// meaningful: the first entry is the default when context detection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Gcp,
    Aws,
    Azure,
    Ovh,
    Scaleway,
    Tailscale,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Gcp => "gcp",
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Ovh => "ovh",
            CloudProvider::Scaleway => "scaleway",
            CloudProvider::Tailscale => "tailscale",
        }
    }

    /// Parse a provider name, accepting the CLI aliases the model tends to
    /// use (`gcloud`, `az`, `amazon`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gcp" | "gcloud" | "google" => Some(CloudProvider::Gcp),
            "aws" | "amazon" => Some(CloudProvider::Aws),
            "azure" | "az" => Some(CloudProvider::Azure),
            "ovh" | "ovhcloud" => Some(CloudProvider::Ovh),
            "scaleway" | "scw" => Some(CloudProvider::Scaleway),
            "tailscale" => Some(CloudProvider::Tailscale),
            _ => None,
        }
    }

    /// All providers, in default priority order.
    pub fn all() -> &'static [CloudProvider] {
        &[
            CloudProvider::Gcp,
            CloudProvider::Aws,
            CloudProvider::Azure,
            CloudProvider::Ovh,
            CloudProvider::Scaleway,
            CloudProvider::Tailscale,
        ]
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model identifier in `vendor/name` form.
    pub default_model: String,
    /// Model used when the user message carries images and no explicit
    /// model was selected.
    pub multimodal_model: String,
    /// Model pinned for background RCA sessions.
    pub rca_model: String,
    /// Model used for one-shot summarisation calls (no tools).
    pub summary_model: String,
    /// "direct" routes to the vendor API; "openrouter" routes everything
    /// through the OpenRouter gateway.
    pub provider_mode: String,
    /// Sampling temperature for agent turns.
    pub temperature: f32,
    /// Request timeout for a single streaming completion (seconds).
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: "openai/gpt-4o".to_string(),
            multimodal_model: "openai/gpt-4o".to_string(),
            rca_model: "anthropic/claude-sonnet-4-5".to_string(),
            summary_model: "google/gemini-3-pro-preview".to_string(),
            provider_mode: "openrouter".to_string(),
            temperature: 0.3,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Number of prior messages presented to the model per turn.
    pub context_window_messages: usize,
    /// Context window used by background RCA sessions (larger: the
    /// investigation needs more tool history in view).
    pub background_context_window_messages: usize,
    /// Tool outputs larger than this many bytes are truncated in the
    /// history mapping (the capture keeps the full output).
    pub tool_output_history_cap: usize,
    /// Character threshold over the whole prior-message footprint above
    /// which preflight compression replaces history with a summary.
    pub preflight_compression_chars: usize,
    /// Model retry attempts for network-class failures.
    pub model_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context_window_messages: 10,
            background_context_window_messages: 15,
            tool_output_history_cap: 4000,
            preflight_compression_chars: 48_000,
            model_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacConfig {
    /// Base directory for per-user/per-session Terraform workspaces.
    /// `~` is expanded at load time.
    pub workdir: String,
    /// Timeout for `terraform plan` (seconds).
    pub plan_timeout_secs: u64,
    /// Timeout for `terraform apply` / `destroy` (seconds).
    pub apply_timeout_secs: u64,
}

impl Default for IacConfig {
    fn default() -> Self {
        Self {
            workdir: "/home/appuser/terraform_workdir".to_string(),
            plan_timeout_secs: 600,
            apply_timeout_secs: 1200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Token threshold above which a large list response triggers an
    /// automatic projection retry.
    pub projection_token_threshold: usize,
    /// Default timeout for quick commands (seconds).
    pub quick_timeout_secs: u64,
    /// Timeout for regular long-running operations (seconds).
    pub long_timeout_secs: u64,
    /// Timeout for very long operations: cluster and database
    /// create/delete/restore (seconds).
    pub very_long_timeout_secs: u64,
    /// Upper bound on parallel workers for AWS multi-account fan-out.
    pub multi_account_workers: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            projection_token_threshold: 30_000,
            quick_timeout_secs: 60,
            long_timeout_secs: 300,
            very_long_timeout_secs: 1200,
            multi_account_workers: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Background chats allowed per principal per window.
    pub rate_limit_max_requests: u32,
    /// Rate-limit window (seconds).
    pub rate_limit_window_secs: u64,
    /// Hard timeout for a background RCA task (seconds).
    pub task_timeout_secs: u64,
    /// Sessions still `in_progress` after this many seconds are swept to
    /// `failed`.
    pub stale_after_secs: u64,
    /// When true, confirmation gates auto-approve in background mode;
    /// when false they auto-cancel.
    #[serde(default = "default_true")]
    pub auto_approve: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_requests: 5,
            rate_limit_window_secs: 300,
            task_timeout_secs: 900,
            stale_after_secs: 1200,
            auto_approve: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Enable the MCP bridge (GitHub / AWS / Context7 stdio servers).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Handshake timeout for process-backed servers (seconds).
    pub init_timeout_secs: u64,
    /// Handshake timeout for Docker-backed servers (seconds).
    pub docker_init_timeout_secs: u64,
    /// Per-user discovered-tool cache lifetime (seconds).
    pub tool_cache_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_timeout_secs: 8,
            docker_init_timeout_secs: 30,
            tool_cache_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Send RCA completion emails when the user opted in.
    #[serde(default = "default_true")]
    pub email_enabled: bool,
    /// Send RCA Slack notifications when the workspace has Slack connected.
    #[serde(default = "default_true")]
    pub slack_enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            email_enabled: true,
            slack_enabled: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.model.default_model, cfg.model.default_model);
        assert_eq!(back.cloud.multi_account_workers, 10);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.background.rate_limit_max_requests, 5);
        assert_eq!(cfg.background.rate_limit_window_secs, 300);
        assert!(cfg.background.auto_approve);
    }

    #[test]
    fn provider_parse_accepts_cli_aliases() {
        assert_eq!(CloudProvider::parse("gcloud"), Some(CloudProvider::Gcp));
        assert_eq!(CloudProvider::parse("az"), Some(CloudProvider::Azure));
        assert_eq!(CloudProvider::parse("amazon"), Some(CloudProvider::Aws));
        assert_eq!(CloudProvider::parse("scw"), Some(CloudProvider::Scaleway));
        assert_eq!(CloudProvider::parse("hetzner"), None);
    }

    #[test]
    fn provider_display_matches_as_str() {
        for p in CloudProvider::all() {
            assert_eq!(p.to_string(), p.as_str());
        }
    }

    #[test]
    fn ask_mode_is_read_only() {
        assert!(SessionMode::Ask.is_read_only());
        assert!(!SessionMode::Agent.is_read_only());
        assert!(!SessionMode::Background.is_read_only());
    }

    #[test]
    fn background_mode_flag() {
        assert!(SessionMode::Background.is_background());
        assert!(!SessionMode::Agent.is_background());
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_yaml::to_string(&SessionMode::Ask).unwrap().trim(), "ask");
    }
}
