// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP server lifecycle.
//!
//! Servers start lazily per (user, server-kind) and live until they die;
//! a dead server is restarted on the next call.  One tokio mutex per server
//! serialises both the request/response round-trip and restarts, because
//! stdio MCP is strictly sequential.  Discovered tool lists are cached per
//! user for ten minutes and invalidated when a relevant credential is
//! connected.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{json, Value};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use aurora_config::McpConfig;
use aurora_creds::CredentialStore;

use crate::protocol::{handshake, JsonRpcClient, McpToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKind {
    /// GitHub official MCP server, Docker-backed (slow to start).
    Github,
    /// AWS API MCP server (python module).
    Aws,
    /// Context7 documentation server (npx) — surfaced once OVH is
    /// connected, for CLI/Terraform docs.
    Context7,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Github => "github",
            ServerKind::Aws => "aws",
            ServerKind::Context7 => "context7",
        }
    }

    fn command(&self) -> Vec<String> {
        match self {
            ServerKind::Github => [
                "docker",
                "run",
                "-i",
                "--rm",
                "-e",
                "GITHUB_PERSONAL_ACCESS_TOKEN",
                "ghcr.io/github/github-mcp-server",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ServerKind::Aws => ["python", "-m", "awslabs.aws_api_mcp_server.server"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ServerKind::Context7 => ["npx", "-y", "@upstash/context7-mcp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn all() -> &'static [ServerKind] {
        &[ServerKind::Github, ServerKind::Aws, ServerKind::Context7]
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LiveServer {
    child: Child,
    client: JsonRpcClient<ChildStdout, ChildStdin>,
    tools: Vec<McpToolSpec>,
}

type ServerSlot = Arc<Mutex<Option<LiveServer>>>;

pub struct McpServerManager {
    cfg: McpConfig,
    store: Arc<dyn CredentialStore>,
    servers: StdMutex<HashMap<(String, ServerKind), ServerSlot>>,
    tool_cache: StdMutex<HashMap<String, (Instant, Vec<(ServerKind, McpToolSpec)>)>>,
}

impl McpServerManager {
    pub fn new(cfg: McpConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            cfg,
            store,
            servers: StdMutex::new(HashMap::new()),
            tool_cache: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, user_id: &str, kind: ServerKind) -> ServerSlot {
        let mut servers = self.servers.lock().unwrap();
        servers
            .entry((user_id.to_string(), kind))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn init_timeout(&self, kind: ServerKind) -> Duration {
        // Docker pulls and container start dominate the GitHub server.
        if kind == ServerKind::Github {
            Duration::from_secs(self.cfg.docker_init_timeout_secs)
        } else {
            Duration::from_secs(self.cfg.init_timeout_secs)
        }
    }

    /// Which servers apply to this user, judged by connected credentials.
    async fn available_kinds(&self, user_id: &str) -> Vec<ServerKind> {
        let mut kinds = Vec::new();
        for kind in ServerKind::all() {
            let available = match kind {
                ServerKind::Github => self
                    .store
                    .get_service_credentials(user_id, "github")
                    .await
                    .is_some(),
                ServerKind::Aws => !self.store.aws_connections(user_id).await.is_empty(),
                ServerKind::Context7 => self
                    .store
                    .get_credentials(user_id, aurora_config::CloudProvider::Ovh)
                    .await
                    .is_some(),
            };
            if available {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// Environment for one server, built from stored credentials — never the
    /// parent process environment beyond PATH/HOME.
    async fn server_env(&self, user_id: &str, kind: ServerKind) -> Vec<(String, String)> {
        let mut env = vec![
            ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
            ("HOME".to_string(), std::env::var("HOME").unwrap_or_default()),
        ];
        match kind {
            ServerKind::Github => {
                if let Some(creds) = self.store.get_service_credentials(user_id, "github").await {
                    if let Some(token) = creds["access_token"].as_str() {
                        env.push(("GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), token.to_string()));
                    }
                }
            }
            ServerKind::Aws => {
                // The AWS MCP server reads the standard credential variables.
                // Static fallbacks are not minted here; the server only lists
                // read APIs until the broker refreshes the session.
                if let Some(conn) = self.store.aws_connections(user_id).await.first() {
                    if let Some(region) = &conn.region {
                        env.push(("AWS_DEFAULT_REGION".to_string(), region.clone()));
                    }
                }
            }
            ServerKind::Context7 => {}
        }
        env
    }

    async fn start_server(&self, user_id: &str, kind: ServerKind) -> anyhow::Result<LiveServer> {
        let argv = kind.command();
        info!(server = %kind, "starting mcp server");
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env_clear()
            .envs(self.server_env(user_id, kind).await)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning mcp server {kind}"))?;
        let stdin = child.stdin.take().context("mcp server stdin unavailable")?;
        let stdout = child.stdout.take().context("mcp server stdout unavailable")?;
        let mut client = JsonRpcClient::new(stdout, stdin);

        let tools = match handshake(&mut client, self.init_timeout(kind)).await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e.context(format!("mcp handshake failed for {kind}")));
            }
        };
        info!(server = %kind, tools = tools.len(), "mcp server ready");
        Ok(LiveServer {
            child,
            client,
            tools,
        })
    }

    /// Discovered tools for a user, from the ten-minute cache when fresh.
    ///
    /// An empty cached list alongside now-present credentials is treated as
    /// stale — the cache was filled before the user connected.
    pub async fn tools_for_user(&self, user_id: &str) -> Vec<(ServerKind, McpToolSpec)> {
        let kinds = self.available_kinds(user_id).await;
        {
            let cache = self.tool_cache.lock().unwrap();
            if let Some((inserted, tools)) = cache.get(user_id) {
                let fresh = inserted.elapsed() < Duration::from_secs(self.cfg.tool_cache_secs);
                let stale_empty = tools.is_empty() && !kinds.is_empty();
                if fresh && !stale_empty {
                    return tools.clone();
                }
            }
        }

        let mut discovered = Vec::new();
        for kind in kinds {
            let slot = self.slot(user_id, kind);
            let mut guard = slot.lock().await;
            if guard.is_none() {
                match self.start_server(user_id, kind).await {
                    Ok(server) => *guard = Some(server),
                    Err(e) => {
                        warn!(server = %kind, error = %e, "mcp server unavailable");
                        continue;
                    }
                }
            }
            if let Some(server) = guard.as_ref() {
                for tool in &server.tools {
                    discovered.push((kind, tool.clone()));
                }
            }
        }

        self.tool_cache
            .lock()
            .unwrap()
            .insert(user_id.to_string(), (Instant::now(), discovered.clone()));
        discovered
    }

    /// Call one tool.  A dead server is restarted once; the second failure
    /// surfaces to the caller.
    pub async fn call_tool(
        &self,
        user_id: &str,
        kind: ServerKind,
        tool_name: &str,
        arguments: Value,
    ) -> anyhow::Result<Value> {
        let slot = self.slot(user_id, kind);
        let mut guard = slot.lock().await;

        for attempt in 0..2 {
            // (Re)start when missing or exited.
            let needs_start = match guard.as_mut() {
                None => true,
                Some(server) => server.child.try_wait().ok().flatten().is_some(),
            };
            if needs_start {
                if attempt > 0 || guard.is_some() {
                    warn!(server = %kind, "mcp server died; restarting");
                }
                *guard = Some(self.start_server(user_id, kind).await?);
            }

            let server = guard.as_mut().expect("server just ensured");
            match server
                .client
                .request(
                    "tools/call",
                    json!({ "name": tool_name, "arguments": arguments }),
                    Duration::from_secs(60),
                )
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if attempt == 0 => {
                    warn!(server = %kind, error = %e, "mcp call failed; restarting server");
                    if let Some(mut dead) = guard.take() {
                        let _ = dead.child.kill().await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on the second attempt")
    }

    /// Drop the cached tool list for a user — called when a relevant
    /// credential is added (e.g. an OVH connect makes Context7 available).
    pub fn invalidate_user(&self, user_id: &str) {
        self.tool_cache.lock().unwrap().remove(user_id);
    }

    /// Kill all running servers (shutdown path).
    pub async fn shutdown(&self) {
        let slots: Vec<ServerSlot> = {
            let servers = self.servers.lock().unwrap();
            servers.values().cloned().collect()
        };
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(mut server) = guard.take() {
                let _ = server.child.kill().await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_creds::{AwsConnection, InMemoryCredentialStore};

    fn manager_with(store: InMemoryCredentialStore) -> McpServerManager {
        McpServerManager::new(McpConfig::default(), Arc::new(store))
    }

    #[tokio::test]
    async fn no_credentials_means_no_servers() {
        let m = manager_with(InMemoryCredentialStore::new());
        assert!(m.available_kinds("u1").await.is_empty());
        assert!(m.tools_for_user("u1").await.is_empty());
    }

    #[tokio::test]
    async fn github_credentials_unlock_the_github_server() {
        let store = InMemoryCredentialStore::new();
        store.insert_service_credentials("u1", "github", json!({"access_token": "ghp_x"}));
        let m = manager_with(store);
        assert_eq!(m.available_kinds("u1").await, vec![ServerKind::Github]);
    }

    #[tokio::test]
    async fn aws_connection_unlocks_the_aws_server() {
        let store = InMemoryCredentialStore::new();
        store.insert_aws_connection(
            "u1",
            AwsConnection {
                account_id: "1".into(),
                role_arn: "arn".into(),
                read_only_role_arn: None,
                region: Some("us-east-1".into()),
            },
        );
        let m = manager_with(store);
        assert_eq!(m.available_kinds("u1").await, vec![ServerKind::Aws]);
    }

    #[tokio::test]
    async fn ovh_connection_unlocks_context7() {
        let store = InMemoryCredentialStore::new();
        store.insert_tokens(
            "u1",
            aurora_config::CloudProvider::Ovh,
            json!({"access_token": "t"}),
        );
        let m = manager_with(store);
        assert_eq!(m.available_kinds("u1").await, vec![ServerKind::Context7]);
    }

    #[tokio::test]
    async fn github_env_carries_the_token() {
        let store = InMemoryCredentialStore::new();
        store.insert_service_credentials("u1", "github", json!({"access_token": "ghp_secret"}));
        let m = manager_with(store);
        let env = m.server_env("u1", ServerKind::Github).await;
        assert!(env
            .iter()
            .any(|(k, v)| k == "GITHUB_PERSONAL_ACCESS_TOKEN" && v == "ghp_secret"));
    }

    #[test]
    fn github_gets_the_docker_timeout() {
        let m = manager_with(InMemoryCredentialStore::new());
        assert_eq!(m.init_timeout(ServerKind::Github), Duration::from_secs(30));
        assert_eq!(m.init_timeout(ServerKind::Context7), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn invalidate_drops_the_cached_list() {
        let m = manager_with(InMemoryCredentialStore::new());
        // Seed an (empty) cache entry.
        let _ = m.tools_for_user("u1").await;
        assert!(m.tool_cache.lock().unwrap().contains_key("u1"));
        m.invalidate_user("u1");
        assert!(!m.tool_cache.lock().unwrap().contains_key("u1"));
    }

    #[tokio::test]
    async fn cache_entry_is_written_even_when_empty() {
        let m = manager_with(InMemoryCredentialStore::new());
        let _ = m.tools_for_user("u1").await;
        let cached = m.tool_cache.lock().unwrap().get("u1").cloned();
        assert!(cached.unwrap().1.is_empty());
    }
}
