// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-provider isolated environment builders.
//!
//! Each builder returns a [`CredSetup`] whose env bundle is complete for the
//! target CLI or API client.  Token values flow store → bundle → subprocess
//! and are never logged or written to the process environment.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use aurora_config::{CloudProvider, SessionMode};

use crate::env::{CredSetup, IsolatedEnv};
use crate::minters::{StsClient, TokenMinter};
use crate::store::CredentialStore;
use crate::{read_only_session_policy, CredError};

/// Refresh an OVH token this close to expiry (seconds).
const OVH_REFRESH_BUFFER_SECS: i64 = 300;

pub(crate) async fn setup_gcp(
    minter: &dyn TokenMinter,
    home: &str,
    user_id: &str,
    selected_project: Option<&str>,
    mode: SessionMode,
) -> Result<CredSetup, CredError> {
    let token = minter
        .gcp_access_token(user_id, selected_project, mode)
        .await
        .map_err(|_| CredError::MissingConnection {
            provider: CloudProvider::Gcp,
        })?;

    let mut env = IsolatedEnv::with_base(home);
    // Two aliases for the token and the SA: gcloud and the client SDKs read
    // different variables.
    env.set("GOOGLE_OAUTH_ACCESS_TOKEN", &token.access_token);
    env.set("CLOUDSDK_AUTH_ACCESS_TOKEN", &token.access_token);
    env.set("GOOGLE_CLOUD_PROJECT", &token.project_id);
    env.set(
        "CLOUDSDK_AUTH_IMPERSONATE_SERVICE_ACCOUNT",
        &token.service_account_email,
    );
    env.set(
        "CLOUDSDK_IMPERSONATE_SERVICE_ACCOUNT",
        &token.service_account_email,
    );
    env.set("CLOUDSDK_CONFIG", "/tmp/.gcloud");

    info!(project = %token.project_id, "gcp isolated environment configured");
    Ok(CredSetup {
        resource_id: token.project_id,
        auth_method: "impersonated",
        env,
        auth_command: None,
    })
}

pub(crate) async fn setup_aws(
    store: &dyn CredentialStore,
    sts: &dyn StsClient,
    home: &str,
    user_id: &str,
    selected_region: Option<&str>,
    target_account_id: Option<&str>,
    mode: SessionMode,
) -> Result<CredSetup, CredError> {
    let connections = store.aws_connections(user_id).await;
    let conn = match target_account_id {
        Some(acct) => connections
            .into_iter()
            .find(|c| c.account_id == acct)
            .ok_or(CredError::MissingConnection {
                provider: CloudProvider::Aws,
            })?,
        None => connections
            .into_iter()
            .next()
            .ok_or(CredError::MissingConnection {
                provider: CloudProvider::Aws,
            })?,
    };

    let external_id =
        store
            .workspace_external_id(user_id)
            .await
            .ok_or(CredError::IncompleteCredentials {
                provider: CloudProvider::Aws,
                detail: "workspace is missing its external id",
            })?;

    let region = selected_region
        .map(str::to_string)
        .or(conn.region.clone())
        .unwrap_or_else(|| "us-east-1".to_string());

    // Read-only mode: a dedicated read-only role wins; otherwise intersect
    // the base role with a restrictive session policy and mark the method so
    // the UI can recommend a dedicated role.
    let mut role_arn = conn.role_arn.clone();
    let mut session_policy = None;
    let mut auth_method: &'static str = "access_key";
    if mode.is_read_only() {
        match &conn.read_only_role_arn {
            Some(ro) => {
                role_arn = ro.clone();
                info!(account = %conn.account_id, "using dedicated aws read-only role");
            }
            None => {
                session_policy = Some(read_only_session_policy());
                auth_method = "session_policy";
                warn!(
                    account = %conn.account_id,
                    "read-only mode without a dedicated role; layering a session policy \
                     (may fail if the base role lacks read permissions)"
                );
            }
        }
    }

    let creds = sts
        .assume_role(&role_arn, &external_id, &region, session_policy)
        .await
        .map_err(|e| CredError::StsDenied(e.to_string()))?;

    let mut env = IsolatedEnv::with_base(home);
    env.set("AWS_ACCESS_KEY_ID", &creds.access_key_id);
    env.set("AWS_SECRET_ACCESS_KEY", &creds.secret_access_key);
    env.set("AWS_SESSION_TOKEN", &creds.session_token);
    // Legacy alias for older CLI versions.
    env.set("AWS_SECURITY_TOKEN", &creds.session_token);
    env.set("AWS_DEFAULT_REGION", &region);

    // Validate and stash the account id (plus friendly alias) for UI labels.
    let identity = sts
        .get_caller_identity(&creds, &region)
        .await
        .map_err(|e| CredError::StsDenied(format!("credential validation failed: {e}")))?;
    env.set("AURORA_AWS_ACCOUNT_ID", &identity.account_id);
    if let Some(alias) = sts.account_alias(&creds, &region).await {
        env.set("AURORA_AWS_ACCOUNT_ALIAS", &alias);
    }

    info!(region = %region, account = %identity.account_id, "aws isolated environment configured");
    Ok(CredSetup {
        resource_id: region,
        auth_method,
        env,
        auth_command: None,
    })
}

pub(crate) async fn setup_azure(
    minter: &dyn TokenMinter,
    home: &str,
    user_id: &str,
    subscription_id: Option<&str>,
    mode: SessionMode,
) -> Result<CredSetup, CredError> {
    let sp = minter
        .azure_service_principal(user_id, subscription_id, mode)
        .await
        .map_err(|_| CredError::MissingConnection {
            provider: CloudProvider::Azure,
        })?;

    if sp.tenant_id.is_empty() || sp.client_id.is_empty() || sp.client_secret.is_empty() {
        return Err(CredError::IncompleteCredentials {
            provider: CloudProvider::Azure,
            detail: "service principal triple is incomplete",
        });
    }

    let mut env = IsolatedEnv::with_base(home);
    env.set("AZURE_CLIENT_ID", &sp.client_id);
    env.set("AZURE_CLIENT_SECRET", &sp.client_secret);
    env.set("AZURE_TENANT_ID", &sp.tenant_id);
    env.set("AZURE_CONFIG_DIR", format!("{home}/.azure"));

    // The dispatcher runs this before the user command, in the same env.
    let auth_command = format!(
        "az login --service-principal --username {} --password {} --tenant {} --output none",
        sp.client_id, sp.client_secret, sp.tenant_id
    );

    info!(subscription = %sp.subscription_id, "azure isolated environment configured (auth command built with --password [REDACTED])");
    Ok(CredSetup {
        resource_id: sp.subscription_id,
        auth_method: "service_principal",
        env,
        auth_command: Some(auth_command),
    })
}

pub(crate) async fn setup_ovh(
    store: &dyn CredentialStore,
    http: &reqwest::Client,
    home: &str,
    user_id: &str,
    selected_project: Option<&str>,
) -> Result<CredSetup, CredError> {
    let data = store
        .get_credentials(user_id, CloudProvider::Ovh)
        .await
        .ok_or(CredError::MissingConnection {
            provider: CloudProvider::Ovh,
        })?;

    let endpoint = data["endpoint"].as_str().unwrap_or("ovh-us").to_string();
    let mut access_token = data["access_token"].as_str().unwrap_or_default().to_string();
    let expires_at = data["expires_at"].as_i64().unwrap_or(0);
    let refresh_token = data["refresh_token"].as_str().map(str::to_string);
    let project_id = selected_project
        .map(str::to_string)
        .or_else(|| data["projectId"].as_str().map(str::to_string));

    // Refresh when expired or within the buffer of expiry.
    let now = Utc::now().timestamp();
    if expires_at != 0 && now >= expires_at - OVH_REFRESH_BUFFER_SECS {
        let Some(refresh) = refresh_token else {
            return Err(CredError::ExpiredToken {
                provider: CloudProvider::Ovh,
            });
        };
        info!("ovh access token expiring; refreshing");
        let token_url = ovh_token_endpoint(&endpoint);
        let client_id = data["client_id"].as_str().unwrap_or_default().to_string();
        let client_secret = data["client_secret"].as_str().unwrap_or_default().to_string();
        let resp = http
            .post(token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| CredError::RefreshFailed {
                provider: CloudProvider::Ovh,
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CredError::RefreshFailed {
                provider: CloudProvider::Ovh,
                reason: format!("token endpoint returned {}", resp.status()),
            });
        }
        let new_tokens: Value = resp.json().await.map_err(|e| CredError::RefreshFailed {
            provider: CloudProvider::Ovh,
            reason: e.to_string(),
        })?;
        access_token = new_tokens["access_token"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let expires_in = new_tokens["expires_in"].as_i64().unwrap_or(3600);
        let new_refresh = new_tokens["refresh_token"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(refresh);

        // Persist the rotated token set.
        let mut updated = json!({
            "endpoint": endpoint,
            "client_id": client_id,
            "access_token": access_token,
            "token_type": new_tokens["token_type"].as_str().unwrap_or("Bearer"),
            "expires_at": now + expires_in,
            "refresh_token": new_refresh,
            "client_secret": client_secret,
            "auth_method": "authorization_code",
        });
        if let Some(pid) = &project_id {
            updated["projectId"] = json!(pid);
        }
        store.store_tokens(user_id, CloudProvider::Ovh, updated).await;
        info!("ovh access token refreshed");
    }

    if access_token.is_empty() {
        return Err(CredError::IncompleteCredentials {
            provider: CloudProvider::Ovh,
            detail: "no access token available",
        });
    }

    let mut env = IsolatedEnv::with_base(home);
    env.set("OVH_ACCESS_TOKEN", &access_token);
    env.set("OVH_ENDPOINT", &endpoint);
    if let Some(pid) = &project_id {
        env.set("OVH_CLOUD_PROJECT_SERVICE", pid);
    }

    info!(endpoint = %endpoint, "ovh isolated environment configured");
    Ok(CredSetup {
        resource_id: project_id.unwrap_or_else(|| endpoint.clone()),
        auth_method: "oauth2_access_token",
        env,
        auth_command: None,
    })
}

fn ovh_token_endpoint(endpoint: &str) -> &'static str {
    match endpoint {
        "ovh-eu" => "https://www.ovh.com/auth/oauth2/token",
        "ovh-ca" => "https://ca.ovhcloud.com/auth/oauth2/token",
        _ => "https://us.ovhcloud.com/auth/oauth2/token",
    }
}

pub(crate) async fn setup_scaleway(
    store: &dyn CredentialStore,
    home: &str,
    user_id: &str,
    selected_project: Option<&str>,
) -> Result<CredSetup, CredError> {
    let data = store
        .get_credentials(user_id, CloudProvider::Scaleway)
        .await
        .ok_or(CredError::MissingConnection {
            provider: CloudProvider::Scaleway,
        })?;

    let access_key = data["access_key"].as_str().unwrap_or_default();
    let secret_key = data["secret_key"].as_str().unwrap_or_default();
    if access_key.is_empty() || secret_key.is_empty() {
        return Err(CredError::IncompleteCredentials {
            provider: CloudProvider::Scaleway,
            detail: "access_key or secret_key missing",
        });
    }

    let project_id = selected_project
        .map(str::to_string)
        .or_else(|| data["default_project_id"].as_str().map(str::to_string));

    let mut env = IsolatedEnv::with_base(home);
    env.set("SCW_ACCESS_KEY", access_key);
    env.set("SCW_SECRET_KEY", secret_key);
    if let Some(org) = data["organization_id"].as_str() {
        env.set("SCW_DEFAULT_ORGANIZATION_ID", org);
    }
    if let Some(pid) = &project_id {
        env.set("SCW_DEFAULT_PROJECT_ID", pid);
    }
    if let Some(region) = data["default_region"].as_str() {
        env.set("SCW_DEFAULT_REGION", region);
    }
    if let Some(zone) = data["default_zone"].as_str() {
        env.set("SCW_DEFAULT_ZONE", zone);
    }

    info!("scaleway isolated environment configured");
    Ok(CredSetup {
        resource_id: project_id.unwrap_or_default(),
        auth_method: "api_key",
        env,
        auth_command: None,
    })
}

pub(crate) async fn setup_tailscale(
    store: &dyn CredentialStore,
    http: &reqwest::Client,
    user_id: &str,
    selected_tailnet: Option<&str>,
) -> Result<CredSetup, CredError> {
    let data = store
        .get_credentials(user_id, CloudProvider::Tailscale)
        .await
        .ok_or(CredError::MissingConnection {
            provider: CloudProvider::Tailscale,
        })?;

    let client_id = data["client_id"].as_str().unwrap_or_default();
    let client_secret = data["client_secret"].as_str().unwrap_or_default();
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(CredError::IncompleteCredentials {
            provider: CloudProvider::Tailscale,
            detail: "client credentials missing",
        });
    }

    let tailnet = selected_tailnet
        .map(str::to_string)
        .or_else(|| data["tailnet"].as_str().map(str::to_string))
        .unwrap_or_else(|| "-".to_string());
    let tailnet_name = data["tailnet_name"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| tailnet.clone());

    // Reuse the stored access token while fresh; otherwise run the
    // client-credentials grant.
    let token_data = &data["token_data"];
    let stored_token = token_data["access_token"].as_str().unwrap_or_default();
    let expires_at = token_data["expires_at"].as_i64().unwrap_or(0);
    let now = Utc::now().timestamp();
    let access_token = if !stored_token.is_empty() && now < expires_at - 60 {
        stored_token.to_string()
    } else {
        let resp = http
            .post("https://api.tailscale.com/api/v2/oauth/token")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| CredError::RefreshFailed {
                provider: CloudProvider::Tailscale,
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CredError::RefreshFailed {
                provider: CloudProvider::Tailscale,
                reason: format!("oauth endpoint returned {}", resp.status()),
            });
        }
        let tokens: Value = resp.json().await.map_err(|e| CredError::RefreshFailed {
            provider: CloudProvider::Tailscale,
            reason: e.to_string(),
        })?;
        let token = tokens["access_token"].as_str().unwrap_or_default().to_string();
        if token.is_empty() {
            return Err(CredError::IncompleteCredentials {
                provider: CloudProvider::Tailscale,
                detail: "oauth response carried no access token",
            });
        }
        token
    };

    // No CLI behind this provider: the bundle carries the token and tailnet
    // for the REST translator, not subprocess env.
    let mut env = IsolatedEnv::default();
    env.set("TAILSCALE_ACCESS_TOKEN", &access_token);
    env.set("TAILSCALE_TAILNET", &tailnet);
    env.set("TAILSCALE_TAILNET_NAME", &tailnet_name);

    info!(tailnet = %tailnet_name, "tailscale isolated environment configured");
    Ok(CredSetup {
        resource_id: tailnet,
        auth_method: "oauth",
        env,
        auth_command: None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
