// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{info, warn};

use aurora_config::{CloudProvider, SessionMode};

use crate::env::{CredSetup, IsolatedEnv};
use crate::minters::{StsClient, TokenMinter};
use crate::providers;
use crate::store::CredentialStore;
use crate::CredError;

/// Setup results are cached this long; read-mostly, invalidated explicitly
/// on connect/disconnect.
const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAPACITY: usize = 256;

type CacheKey = (
    String,
    CloudProvider,
    SessionMode,
    Option<String>,
    Option<String>,
);

/// One per-account environment from the AWS multi-account fan-out.
#[derive(Debug, Clone)]
pub struct AccountEnv {
    pub account_id: String,
    pub region: String,
    pub env: IsolatedEnv,
}

/// The credential broker.  Holds the storage and minting ports plus a short
/// TTL cache; never mutates process state.
pub struct CredentialBroker {
    store: Arc<dyn CredentialStore>,
    minter: Arc<dyn TokenMinter>,
    sts: Arc<dyn StsClient>,
    http: reqwest::Client,
    /// Writable home for CLI config state inside the execution pod.
    home: String,
    cache: Mutex<LruCache<CacheKey, (Instant, CredSetup)>>,
}

impl CredentialBroker {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        minter: Arc<dyn TokenMinter>,
        sts: Arc<dyn StsClient>,
    ) -> Self {
        Self {
            store,
            minter,
            sts,
            http: reqwest::Client::new(),
            home: "/home/appuser".to_string(),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = home.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Set up an isolated environment for (principal, provider).
    ///
    /// `selected` is the project / subscription / region / tailnet override;
    /// `target_account` narrows AWS to one account.  Failures carry a typed
    /// reason and never leave partial state behind.
    pub async fn setup(
        &self,
        provider: CloudProvider,
        user_id: &str,
        selected: Option<&str>,
        mode: SessionMode,
        target_account: Option<&str>,
    ) -> Result<CredSetup, CredError> {
        let key: CacheKey = (
            user_id.to_string(),
            provider,
            mode,
            selected.map(str::to_string),
            target_account.map(str::to_string),
        );
        if let Some(setup) = self.cache_get(&key) {
            return Ok(setup);
        }

        let setup = match provider {
            CloudProvider::Gcp => {
                providers::setup_gcp(self.minter.as_ref(), &self.home, user_id, selected, mode)
                    .await?
            }
            CloudProvider::Aws => {
                providers::setup_aws(
                    self.store.as_ref(),
                    self.sts.as_ref(),
                    &self.home,
                    user_id,
                    selected,
                    target_account,
                    mode,
                )
                .await?
            }
            CloudProvider::Azure => {
                providers::setup_azure(self.minter.as_ref(), &self.home, user_id, selected, mode)
                    .await?
            }
            CloudProvider::Ovh => {
                providers::setup_ovh(self.store.as_ref(), &self.http, &self.home, user_id, selected)
                    .await?
            }
            CloudProvider::Scaleway => {
                providers::setup_scaleway(self.store.as_ref(), &self.home, user_id, selected)
                    .await?
            }
            CloudProvider::Tailscale => {
                providers::setup_tailscale(self.store.as_ref(), &self.http, user_id, selected)
                    .await?
            }
        };

        self.cache_put(key, setup.clone());
        Ok(setup)
    }

    /// Assume roles across every connected AWS account.  Failed accounts are
    /// logged and skipped; the caller receives only the accounts that
    /// succeeded.
    pub async fn setup_aws_all_accounts(&self, user_id: &str, mode: SessionMode) -> Vec<AccountEnv> {
        let connections = self.store.aws_connections(user_id).await;
        if connections.is_empty() {
            warn!(user_id, "no active aws connections for multi-account setup");
            return Vec::new();
        }

        let mut envs = Vec::new();
        for conn in &connections {
            let region = conn.region.clone().unwrap_or_else(|| "us-east-1".into());
            match self
                .setup(
                    CloudProvider::Aws,
                    user_id,
                    Some(&region),
                    mode,
                    Some(&conn.account_id),
                )
                .await
            {
                Ok(setup) => envs.push(AccountEnv {
                    account_id: conn.account_id.clone(),
                    region,
                    env: setup.env,
                }),
                Err(e) => {
                    warn!(account = %conn.account_id, error = %e, "skipping account; role assumption failed");
                }
            }
        }
        info!(
            assumed = envs.len(),
            total = connections.len(),
            "assumed roles for aws accounts"
        );
        envs
    }

    /// All AWS connections for a user (dispatcher decides on fan-out).
    pub async fn aws_connections(&self, user_id: &str) -> Vec<crate::AwsConnection> {
        self.store.aws_connections(user_id).await
    }

    /// Providers this user has connected, in connection order.
    pub async fn connected_providers(&self, user_id: &str) -> Vec<CloudProvider> {
        self.store.connected_providers(user_id).await
    }

    /// Drop all cached setups for a user — called when a connection is
    /// added or removed.
    pub fn invalidate_user(&self, user_id: &str) {
        let mut cache = self.cache.lock().unwrap();
        let keys: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.0 == user_id)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            cache.pop(&k);
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<CredSetup> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some((inserted, setup)) if inserted.elapsed() < CACHE_TTL => Some(setup.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: CacheKey, setup: CredSetup) {
        self.cache.lock().unwrap().put(key, (Instant::now(), setup));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
