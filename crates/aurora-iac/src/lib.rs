// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `iac_tool` dispatcher.
//!
//! A unified Terraform entry with per-session workspaces, provider
//! inference from HCL content, a state-conflict guard that wipes stale
//! provider state, and the plan/apply/destroy protocol with confirmation
//! gates and a GitHub commit hand-off after successful applies.

pub mod exec;
pub mod provider;
pub mod state_guard;
pub mod workspace;

mod tool;

pub use tool::{CommitSuggestion, GitHubPort, IacTool, NullGitHub};
