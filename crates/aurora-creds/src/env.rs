// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

/// A self-contained environment bundle for one subprocess.
///
/// The bundle owns its secrets: nothing here may be copied into the process
/// environment, and the `Debug` impl prints key names only so bundles can
/// appear in trace output without leaking values.
#[derive(Clone, Default)]
pub struct IsolatedEnv {
    vars: BTreeMap<String, String>,
}

impl IsolatedEnv {
    /// Start from the minimal inherited base: PATH, HOME override and USER.
    /// `home` points at a writable home for CLI config state.
    pub fn with_base(home: &str) -> Self {
        let mut env = Self::default();
        env.set("PATH", std::env::var("PATH").unwrap_or_default());
        env.set("HOME", home);
        env.set("USER", std::env::var("USER").unwrap_or_default());
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Iterate (key, value) pairs for `Command::envs`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl std::fmt::Debug for IsolatedEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys only.  Values are secrets.
        f.debug_struct("IsolatedEnv")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Successful credential setup for one provider call.
#[derive(Debug, Clone)]
pub struct CredSetup {
    /// Project id, region, subscription id or tailnet, depending on provider.
    pub resource_id: String,
    /// How the credentials were obtained ("impersonated", "access_key",
    /// "session_policy", "service_principal", "oauth2_access_token",
    /// "api_key", "oauth").
    pub auth_method: &'static str,
    pub env: IsolatedEnv,
    /// One-shot login command the dispatcher runs before the user command
    /// (Azure only).  Contains the client secret; never logged.
    pub auth_command: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
