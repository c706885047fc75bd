// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token-minting ports.
//!
//! STS assume-role, GCP service-account impersonation and Azure
//! service-principal generation live behind vendor APIs this repo does not
//! own; the broker consumes them through these traits.  Fakes ship in-tree
//! for tests and local runs.

use async_trait::async_trait;
use aurora_config::SessionMode;

/// GCP impersonation token for a selected project.
#[derive(Debug, Clone)]
pub struct GcpToken {
    pub access_token: String,
    pub project_id: String,
    pub service_account_email: String,
}

/// Azure service-principal triple for a selected subscription.
#[derive(Debug, Clone)]
pub struct AzureServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
}

#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Mint an OAuth access token impersonating a service account for the
    /// user's selected (or given) project.  Read-only modes may switch to a
    /// restricted service account.
    async fn gcp_access_token(
        &self,
        user_id: &str,
        selected_project: Option<&str>,
        mode: SessionMode,
    ) -> anyhow::Result<GcpToken>;

    /// Generate a service-principal credential set for the subscription.
    async fn azure_service_principal(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        mode: SessionMode,
    ) -> anyhow::Result<AzureServicePrincipal>;
}

/// Temporary STS credentials from an assume-role call.
#[derive(Debug, Clone)]
pub struct StsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// RFC3339 expiry; bundles die with the token (≤ 1 hour).
    pub expiration: String,
}

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
}

#[async_trait]
pub trait StsClient: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        external_id: &str,
        region: &str,
        session_policy: Option<&str>,
    ) -> anyhow::Result<StsCredentials>;

    /// Validate credentials; the account id is stashed in the bundle for UI
    /// display.
    async fn get_caller_identity(
        &self,
        creds: &StsCredentials,
        region: &str,
    ) -> anyhow::Result<CallerIdentity>;

    /// Friendly IAM account alias, when one exists.  Failures here are
    /// non-fatal and must not fail the setup.
    async fn account_alias(&self, creds: &StsCredentials, region: &str) -> Option<String>;
}

// ─── Fakes ───────────────────────────────────────────────────────────────────

/// Deterministic fake minter for tests and local runs.
#[derive(Default)]
pub struct FakeTokenMinter;

#[async_trait]
impl TokenMinter for FakeTokenMinter {
    async fn gcp_access_token(
        &self,
        user_id: &str,
        selected_project: Option<&str>,
        _mode: SessionMode,
    ) -> anyhow::Result<GcpToken> {
        Ok(GcpToken {
            access_token: format!("ya29.fake-{user_id}"),
            project_id: selected_project.unwrap_or("test-project").to_string(),
            service_account_email: "aurora-agent@test-project.iam.gserviceaccount.com".into(),
        })
    }

    async fn azure_service_principal(
        &self,
        _user_id: &str,
        subscription_id: Option<&str>,
        _mode: SessionMode,
    ) -> anyhow::Result<AzureServicePrincipal> {
        Ok(AzureServicePrincipal {
            tenant_id: "tenant-1".into(),
            client_id: "client-1".into(),
            client_secret: "sp-secret".into(),
            subscription_id: subscription_id.unwrap_or("sub-1").to_string(),
        })
    }
}

/// Fake STS client.  Role ARNs containing "deny" are rejected, which lets
/// tests exercise the denial path.
#[derive(Default)]
pub struct FakeStsClient;

#[async_trait]
impl StsClient for FakeStsClient {
    async fn assume_role(
        &self,
        role_arn: &str,
        _external_id: &str,
        _region: &str,
        session_policy: Option<&str>,
    ) -> anyhow::Result<StsCredentials> {
        if role_arn.contains("deny") {
            anyhow::bail!("AccessDenied: not authorized to assume {role_arn}");
        }
        Ok(StsCredentials {
            access_key_id: "ASIAFAKEKEY".into(),
            secret_access_key: "fake-secret".into(),
            session_token: if session_policy.is_some() {
                "fake-session-token-scoped".into()
            } else {
                "fake-session-token".into()
            },
            expiration: "2099-01-01T00:00:00Z".into(),
        })
    }

    async fn get_caller_identity(
        &self,
        _creds: &StsCredentials,
        _region: &str,
    ) -> anyhow::Result<CallerIdentity> {
        Ok(CallerIdentity {
            account_id: "123456789012".into(),
            arn: "arn:aws:sts::123456789012:assumed-role/aurora/session".into(),
        })
    }

    async fn account_alias(&self, _creds: &StsCredentials, _region: &str) -> Option<String> {
        Some("prod-main".into())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
