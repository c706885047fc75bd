// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! State-conflict guard.
//!
//! Switching providers mid-session leaves `terraform.tfstate` full of
//! resources the new provider cannot manage, and `.terraform/` full of the
//! wrong plugins.  Before every `write`, the state file is inspected: when
//! its resources belong to a different provider than the currently selected
//! one, exactly `terraform.tfstate`, `.terraform.lock.hcl` and `.terraform/`
//! are wiped.  The guard is idempotent and logs the transition.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use aurora_config::CloudProvider;

/// Provider whose resources populate a state file, judged by resource-type
/// prefix.
fn state_provider(state: &Value) -> Option<CloudProvider> {
    for resource in state["resources"].as_array()? {
        let rtype = resource["type"].as_str().unwrap_or("");
        let detected = if rtype.starts_with("azurerm_") {
            Some(CloudProvider::Azure)
        } else if rtype.starts_with("aws_") {
            Some(CloudProvider::Aws)
        } else if rtype.starts_with("ovh_") {
            Some(CloudProvider::Ovh)
        } else if rtype.starts_with("scaleway_") {
            Some(CloudProvider::Scaleway)
        } else if rtype.starts_with("google_") {
            Some(CloudProvider::Gcp)
        } else {
            None
        };
        if detected.is_some() {
            return detected;
        }
    }
    None
}

fn wipe(dir: &Path) {
    let state_file = dir.join("terraform.tfstate");
    let lock_file = dir.join(".terraform.lock.hcl");
    let plugin_dir = dir.join(".terraform");
    if state_file.exists() {
        let _ = std::fs::remove_file(&state_file);
        info!("removed terraform.tfstate");
    }
    if lock_file.exists() {
        let _ = std::fs::remove_file(&lock_file);
        info!("removed .terraform.lock.hcl");
    }
    if plugin_dir.exists() {
        let _ = std::fs::remove_dir_all(&plugin_dir);
        info!("removed .terraform directory");
    }
}

/// Clear the workspace state when the selected provider differs from the one
/// the state was created for.  With no selected provider, everything is
/// cleared — stale state with no owner is worse than a clean re-init.
pub fn clear_state_if_provider_changed(dir: &Path, current: Option<CloudProvider>) {
    let state_file = dir.join("terraform.tfstate");
    if !state_file.exists() {
        debug!("no terraform state file, nothing to clear");
        return;
    }

    let Some(current) = current else {
        info!("no provider preference set; clearing terraform state to be safe");
        wipe(dir);
        return;
    };

    let state: Value = match std::fs::read_to_string(&state_file)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
    {
        Some(v) => v,
        None => {
            warn!("could not read terraform state file; clearing it to be safe");
            let _ = std::fs::remove_file(&state_file);
            return;
        }
    };

    match state_provider(&state) {
        Some(previous) if previous != current => {
            info!(from = %previous, to = %current, "provider switched; clearing terraform state");
            wipe(dir);
        }
        Some(_) => debug!(provider = %current, "provider unchanged; keeping existing state"),
        None => debug!("no recognisable resources in state file"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed_state(dir: &Path, resource_type: &str) {
        let state = json!({
            "version": 4,
            "resources": [{ "type": resource_type, "name": "x", "instances": [] }],
        });
        std::fs::write(dir.join("terraform.tfstate"), state.to_string()).unwrap();
        std::fs::write(dir.join(".terraform.lock.hcl"), "# lock").unwrap();
        std::fs::create_dir_all(dir.join(".terraform/providers")).unwrap();
        std::fs::write(dir.join(".terraform/providers/marker"), "").unwrap();
    }

    // ── Idempotence and the exact wipe set ────────────────────────────────────

    #[test]
    fn same_provider_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        seed_state(tmp.path(), "google_compute_instance");
        std::fs::write(tmp.path().join("main.tf"), "resource {}").unwrap();

        clear_state_if_provider_changed(tmp.path(), Some(CloudProvider::Gcp));
        // Running twice is a no-op (idempotent).
        clear_state_if_provider_changed(tmp.path(), Some(CloudProvider::Gcp));

        assert!(tmp.path().join("terraform.tfstate").exists());
        assert!(tmp.path().join(".terraform.lock.hcl").exists());
        assert!(tmp.path().join(".terraform").exists());
        assert!(tmp.path().join("main.tf").exists());
    }

    #[test]
    fn provider_switch_wipes_exactly_the_state_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        seed_state(tmp.path(), "aws_instance");
        std::fs::write(tmp.path().join("main.tf"), "resource {}").unwrap();

        clear_state_if_provider_changed(tmp.path(), Some(CloudProvider::Gcp));

        assert!(!tmp.path().join("terraform.tfstate").exists());
        assert!(!tmp.path().join(".terraform.lock.hcl").exists());
        assert!(!tmp.path().join(".terraform").exists());
        // User manifests are untouched.
        assert!(tmp.path().join("main.tf").exists());
    }

    #[test]
    fn missing_state_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        clear_state_if_provider_changed(tmp.path(), Some(CloudProvider::Aws));
        assert!(!tmp.path().join("terraform.tfstate").exists());
    }

    #[test]
    fn no_preference_clears_everything() {
        let tmp = tempfile::tempdir().unwrap();
        seed_state(tmp.path(), "scaleway_instance_server");
        clear_state_if_provider_changed(tmp.path(), None);
        assert!(!tmp.path().join("terraform.tfstate").exists());
    }

    #[test]
    fn unreadable_state_is_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("terraform.tfstate"), "not json at all {").unwrap();
        clear_state_if_provider_changed(tmp.path(), Some(CloudProvider::Aws));
        assert!(!tmp.path().join("terraform.tfstate").exists());
    }

    #[test]
    fn azure_state_detected_by_azurerm_prefix() {
        let state = json!({"resources": [{"type": "azurerm_linux_virtual_machine"}]});
        assert_eq!(state_provider(&state), Some(CloudProvider::Azure));
    }

    #[test]
    fn empty_resources_detect_nothing() {
        let state = json!({"resources": []});
        assert_eq!(state_provider(&state), None);
    }
}
