// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential broker and isolation layer.
//!
//! For a (principal, provider, optional target) triple the broker mints
//! short-lived credentials and returns them as an [`IsolatedEnv`] bundle
//! handed to subprocesses via `env=`.  Nothing in this crate ever writes to
//! the process environment, and bundle values are never logged.

mod broker;
mod env;
pub mod minters;
mod providers;
mod store;

pub use broker::{AccountEnv, CredentialBroker};
pub use env::{CredSetup, IsolatedEnv};
pub use store::{AwsConnection, CredentialStore, InMemoryCredentialStore};

use aurora_config::CloudProvider;

/// Typed failure taxonomy for credential setup.  No exception escapes the
/// broker: every failure maps onto one of these.
#[derive(Debug, thiserror::Error)]
pub enum CredError {
    #[error("no active {provider} connection for this user")]
    MissingConnection { provider: CloudProvider },
    #[error("{provider} token expired and no refresh path is available")]
    ExpiredToken { provider: CloudProvider },
    #[error("{provider} token refresh failed: {reason}")]
    RefreshFailed {
        provider: CloudProvider,
        reason: String,
    },
    #[error("STS assume-role denied: {0}")]
    StsDenied(String),
    #[error("incomplete {provider} credentials: {detail}")]
    IncompleteCredentials {
        provider: CloudProvider,
        detail: &'static str,
    },
}

impl CredError {
    /// True for failures the user fixes by (re-)connecting the provider.
    pub fn requires_connection(&self) -> bool {
        matches!(
            self,
            CredError::MissingConnection { .. }
                | CredError::ExpiredToken { .. }
                | CredError::RefreshFailed { .. }
        )
    }
}

/// Restrictive session policy layered onto a write-capable AWS base role in
/// read-only mode when no dedicated read-only role is configured.  Session
/// policies intersect with the base role's permissions, so this can fail at
/// runtime if the base role lacks read permissions — which is why the setup
/// result marks the auth method so the UI can recommend a dedicated role.
pub fn read_only_session_policy() -> &'static str {
    r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["Get*","List*","Describe*","BatchGet*","Search*","View*"],"Resource":"*"}]}"#
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
