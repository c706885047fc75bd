// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

/// Per-session Terraform workspace: `base / user_<principal> / session_<id>`.
/// Every IaC operation is scoped to this directory.
pub fn terraform_directory(base: &str, user_id: &str, session_id: &str) -> PathBuf {
    Path::new(base)
        .join(format!("user_{user_id}"))
        .join(format!("session_{session_id}"))
}

/// The `.tf` files currently in a workspace, sorted by name.
pub fn list_tf_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "tf").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Names (not paths) of the workspace's `.tf` files, for envelopes.
pub fn tf_file_names(dir: &Path) -> Vec<String> {
    list_tf_files(dir)
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
