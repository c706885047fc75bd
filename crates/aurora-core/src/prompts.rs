// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Segmented system prompt assembly and prefix-cache registration.
//!
//! Five ordered segments build the system prompt; cache breakpoints align
//! with segment boundaries so only the ephemeral tail changes per turn.
//! Segments are pure functions of their inputs and are memoised by hash,
//! keyed by (provider, tenant), so a vendor prompt cache can reuse the
//! stable prefix across turns.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use aurora_config::{CloudProvider, SessionMode};

/// Structured RCA context injected into background investigation prompts.
#[derive(Debug, Clone)]
pub struct RcaContext {
    /// Alert source: grafana, netdata, datadog, slack...
    pub source: String,
    pub providers: Vec<CloudProvider>,
    /// Integration name → connected.
    pub integrations: Vec<(String, bool)>,
    /// Alert metadata rendered into the prompt (title, severity, service).
    pub trigger_summary: Option<String>,
}

/// The five ordered prompt segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSegments {
    pub tools_manifest: String,
    pub system_invariant: String,
    pub provider_constraints: String,
    pub regional_rules: String,
    /// The volatile tail: mode warnings, zip guidance, RCA context.
    pub ephemeral_rules: String,
}

impl PromptSegments {
    /// Segments in order, for iteration and breakpoint registration.
    pub fn ordered(&self) -> [&str; 5] {
        [
            &self.tools_manifest,
            &self.system_invariant,
            &self.provider_constraints,
            &self.regional_rules,
            &self.ephemeral_rules,
        ]
    }

    /// The stable prefix: everything except the ephemeral tail.
    pub fn stable_prefix(&self) -> String {
        [
            self.tools_manifest.as_str(),
            self.system_invariant.as_str(),
            self.provider_constraints.as_str(),
            self.regional_rules.as_str(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
    }
}

fn tools_manifest(tool_names: &[String]) -> String {
    if tool_names.is_empty() {
        return String::new();
    }
    format!(
        "You operate cloud infrastructure through tools. Available tools: {}.\n\
         Always prefer a tool call over guessing; never fabricate command output.",
        tool_names.join(", ")
    )
}

fn system_invariant() -> String {
    "You are Aurora, a cloud operations agent. You manage infrastructure \
     across the user's connected cloud providers on their behalf.\n\
     - Be precise and factual; report command results as they are.\n\
     - Use cloud_exec for one-off operations and iac_tool for declarative \
       infrastructure. Do not mix both for the same resource in one task.\n\
     - Destructive operations always go through user confirmation; never \
       try to work around a declined confirmation.\n\
     - When a tool reports an error, diagnose before retrying; do not retry \
       the identical command more than once."
        .to_string()
}

fn provider_constraints(preference: &[CloudProvider]) -> String {
    if preference.is_empty() {
        return "No cloud provider is connected. Tell the user to connect one before \
                attempting cloud operations."
            .to_string();
    }
    let mut sections: Vec<String> = vec![format!(
        "Connected providers (in priority order): {}.",
        preference
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )];
    for provider in preference {
        let rules = match provider {
            CloudProvider::Gcp => {
                "GCP: use gcloud/gsutil/bq. The project is injected automatically; \
                 do NOT run 'gcloud config set project'. Deletions get --quiet \
                 automatically."
            }
            CloudProvider::Aws => {
                "AWS: use the aws CLI. The region is injected automatically. With \
                 multiple connected accounts, commands fan out to all of them unless \
                 you pass account_id."
            }
            CloudProvider::Azure => {
                "Azure: use az. Login happens automatically via service principal; \
                 never run 'az login' or 'az account set' yourself."
            }
            CloudProvider::Ovh => {
                "OVH: use ovhcloud. Flavor and image parameters take the UUID 'id' \
                 field, never the display name."
            }
            CloudProvider::Scaleway => {
                "Scaleway: use scw. Region and project come from the connection; \
                 zones look like fr-par-1."
            }
            CloudProvider::Tailscale => {
                "Tailscale: commands are translated to the REST API. Supported verbs: \
                 device, auth-key, acl, dns, routes, status."
            }
        };
        sections.push(rules.to_string());
    }
    sections.join("\n")
}

fn regional_rules(preference: &[CloudProvider]) -> String {
    let mut rules: Vec<&str> = vec![
        "When the user names no region, ask once, then use the provider default.",
    ];
    for provider in preference {
        rules.push(match provider {
            CloudProvider::Gcp => "GCP default region us-central1, zone us-central1-a.",
            CloudProvider::Aws => "AWS default region us-east-1.",
            CloudProvider::Azure => "Azure default location eastus.",
            CloudProvider::Ovh => "OVH common regions: GRA7, SBG5, BHS5, US-EAST-VA-1.",
            CloudProvider::Scaleway => "Scaleway default region fr-par, zone fr-par-1.",
            CloudProvider::Tailscale => continue,
        });
    }
    rules.join("\n")
}

fn ephemeral_rules(
    mode: SessionMode,
    has_zip_reference: bool,
    rca: Option<&RcaContext>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    match mode {
        SessionMode::Ask => parts.push(
            "READ-ONLY SESSION: you may inspect and describe infrastructure but \
             must not modify it. Write commands are rejected with READ_ONLY_MODE; \
             do not attempt them."
                .to_string(),
        ),
        SessionMode::Background => parts.push(
            "UNATTENDED SESSION: no user is watching. Confirmation prompts resolve \
             automatically per policy. Make reasonable decisions yourself and \
             record the reasoning in your answers."
                .to_string(),
        ),
        SessionMode::Agent => {}
    }

    if has_zip_reference {
        parts.push(
            "The user referenced an uploaded archive. Use analyze_zip_file to \
             inspect it before acting on its contents; do not guess the layout."
                .to_string(),
        );
    }

    if let Some(rca) = rca {
        let providers = rca
            .providers
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let integrations = rca
            .integrations
            .iter()
            .map(|(name, connected)| {
                format!("{name}: {}", if *connected { "connected" } else { "not connected" })
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut rca_block = format!(
            "ROOT-CAUSE ANALYSIS: an alert from {} triggered this investigation. \
             Investigate the cause using read operations; collect evidence before \
             concluding. Providers: [{providers}]. Integrations: [{integrations}].",
            rca.source
        );
        if let Some(trigger) = &rca.trigger_summary {
            rca_block.push_str(&format!(" Alert: {trigger}"));
        }
        rca_block.push_str(
            " Your goal is a diagnosis with evidence, not a fix; propose remediation \
             as suggestions only.",
        );
        parts.push(rca_block);
    }

    parts.join("\n\n")
}

/// Build the five segments for a turn.
pub fn build_prompt_segments(
    tool_names: &[String],
    preference: &[CloudProvider],
    mode: SessionMode,
    has_zip_reference: bool,
    rca: Option<&RcaContext>,
) -> PromptSegments {
    PromptSegments {
        tools_manifest: tools_manifest(tool_names),
        system_invariant: system_invariant(),
        provider_constraints: provider_constraints(preference),
        regional_rules: regional_rules(preference),
        ephemeral_rules: ephemeral_rules(mode, has_zip_reference, rca),
    }
}

/// Concatenate all segments (stable prefix + ephemeral tail) in order.
pub fn assemble_system_prompt(segments: &PromptSegments) -> String {
    segments
        .ordered()
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn segment_hash(text: &str) -> String {
    hex::encode(&Sha256::digest(text.as_bytes())[..8])
}

/// Tracks segment hashes per (provider, tenant) so the caller knows whether
/// the cached prefix is still valid for the vendor prompt cache.
pub struct PrefixCacheManager {
    registered: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl PrefixCacheManager {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// Register the breakpoints for a turn.  Returns the number of leading
    /// segments unchanged since the last registration — the reusable cached
    /// prefix length in segments.
    pub fn register(&self, provider: &str, tenant: &str, segments: &PromptSegments) -> usize {
        let hashes: Vec<String> = segments.ordered().iter().map(|s| segment_hash(s)).collect();
        let key = (provider.to_string(), tenant.to_string());
        let mut registered = self.registered.lock().unwrap();
        let unchanged = match registered.get(&key) {
            Some(previous) => previous
                .iter()
                .zip(hashes.iter())
                .take_while(|(a, b)| a == b)
                .count(),
            None => 0,
        };
        registered.insert(key, hashes);
        unchanged
    }
}

impl Default for PrefixCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
