// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Projection-based output compression.
//!
//! When a rendered envelope exceeds the token threshold and the command
//! carries no narrowing filter, the dispatcher re-runs it with a generic
//! projection and returns a preview alongside a reference to the original.
//! AWS gets no automatic projection — JMESPath on nested outputs is
//! error-prone — so the envelope carries a note instead.

use regex::Regex;
use std::sync::OnceLock;

use aurora_config::CloudProvider;

/// True when the command already narrows its own output.
pub fn command_already_filtered(command: &str) -> bool {
    let lowered = command.to_ascii_lowercase();
    ["--filter", "--query", "--limit", "--page-size", "--max-items"]
        .iter()
        .any(|flag| lowered.contains(flag))
}

/// Build the projection retry command, plus a reason string.  `None` when no
/// safe generic projection exists for this provider/command.
pub fn build_projection_command(
    provider: CloudProvider,
    command: &str,
) -> Option<(String, &'static str)> {
    static FORMAT_RE: OnceLock<Regex> = OnceLock::new();
    let lowered = command.to_ascii_lowercase();
    match provider {
        CloudProvider::Gcp => {
            if lowered.contains(" list") {
                let re = FORMAT_RE.get_or_init(|| Regex::new(r"--format[=\s]+\S+").unwrap());
                let base = re.replace_all(command, "").trim().to_string();
                Some((
                    format!(r#"{base} --format="value(name,status)""#),
                    "Applied generic projection to reduce list output size",
                ))
            } else {
                None
            }
        }
        CloudProvider::Azure => {
            if lowered.contains(" list") && !lowered.contains("--query") {
                Some((
                    format!(r#"{command} --query "[].{{name:name,id:id,location:location}}" --output json"#),
                    "Applied generic projection to reduce list output size",
                ))
            } else {
                None
            }
        }
        // AWS: no generic projection; nested outputs make JMESPath guesses
        // worse than a large-output warning.
        _ => None,
    }
}

/// Note attached when the output stays large and no projection applies.
pub fn large_output_note(response_tokens: usize) -> String {
    format!(
        "Response is large ({response_tokens} tokens). UI may truncate to ~10KB per field. \
         Apply provider projections (e.g., --format/--query) to reduce payload size without limiting rows."
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
