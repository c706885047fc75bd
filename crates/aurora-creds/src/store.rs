// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential storage port.
//!
//! Secret storage is an external collaborator; the broker consumes it
//! through this trait and never reads the backing store directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use aurora_config::CloudProvider;

/// One AWS account connection for a user.
#[derive(Debug, Clone)]
pub struct AwsConnection {
    pub account_id: String,
    pub role_arn: String,
    /// Dedicated read-only role, when the user configured one.
    pub read_only_role_arn: Option<String>,
    pub region: Option<String>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Stored token data for (user, provider); `None` when not connected.
    async fn get_credentials(&self, user_id: &str, provider: CloudProvider) -> Option<Value>;

    /// Persist refreshed token data (OVH refresh flow).
    async fn store_tokens(&self, user_id: &str, provider: CloudProvider, data: Value);

    /// All active AWS connections for a user, in connection order.
    async fn aws_connections(&self, user_id: &str) -> Vec<AwsConnection>;

    /// Workspace external id used for STS assume-role.
    async fn workspace_external_id(&self, user_id: &str) -> Option<String>;

    /// Providers with an active connection, in connection order.
    async fn connected_providers(&self, user_id: &str) -> Vec<CloudProvider>;

    /// Token data for non-cloud services (github, splunk, dynatrace, coroot,
    /// confluence, bitbucket, slack).  `None` when not connected.
    async fn get_service_credentials(&self, _user_id: &str, _service: &str) -> Option<Value> {
        None
    }
}

/// In-memory store for tests and the worker binary.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    tokens: Mutex<HashMap<(String, CloudProvider), Value>>,
    service_tokens: Mutex<HashMap<(String, String), Value>>,
    aws: Mutex<HashMap<String, Vec<AwsConnection>>>,
    external_ids: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tokens(&self, user_id: &str, provider: CloudProvider, data: Value) {
        self.tokens
            .lock()
            .unwrap()
            .insert((user_id.to_string(), provider), data);
    }

    pub fn insert_aws_connection(&self, user_id: &str, conn: AwsConnection) {
        self.aws
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .push(conn);
    }

    pub fn set_external_id(&self, user_id: &str, external_id: &str) {
        self.external_ids
            .lock()
            .unwrap()
            .insert(user_id.to_string(), external_id.to_string());
    }

    pub fn insert_service_credentials(&self, user_id: &str, service: &str, data: Value) {
        self.service_tokens
            .lock()
            .unwrap()
            .insert((user_id.to_string(), service.to_string()), data);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_credentials(&self, user_id: &str, provider: CloudProvider) -> Option<Value> {
        self.tokens
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), provider))
            .cloned()
    }

    async fn store_tokens(&self, user_id: &str, provider: CloudProvider, data: Value) {
        self.insert_tokens(user_id, provider, data);
    }

    async fn aws_connections(&self, user_id: &str) -> Vec<AwsConnection> {
        self.aws.lock().unwrap().get(user_id).cloned().unwrap_or_default()
    }

    async fn workspace_external_id(&self, user_id: &str) -> Option<String> {
        self.external_ids.lock().unwrap().get(user_id).cloned()
    }

    async fn get_service_credentials(&self, user_id: &str, service: &str) -> Option<Value> {
        self.service_tokens
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), service.to_string()))
            .cloned()
    }

    async fn connected_providers(&self, user_id: &str) -> Vec<CloudProvider> {
        let mut providers: Vec<CloudProvider> = Vec::new();
        {
            let tokens = self.tokens.lock().unwrap();
            for ((uid, provider), _) in tokens.iter() {
                if uid == user_id && !providers.contains(provider) {
                    providers.push(*provider);
                }
            }
        }
        if !self.aws.lock().unwrap().get(user_id).map(Vec::is_empty).unwrap_or(true)
            && !providers.contains(&CloudProvider::Aws)
        {
            providers.push(CloudProvider::Aws);
        }
        providers
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
