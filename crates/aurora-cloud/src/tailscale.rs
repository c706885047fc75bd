// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tailscale command translation.
//!
//! Tailscale has no CLI in the execution pod; text commands are parsed and
//! dispatched to the REST API, with the response shaped into the same
//! envelope as CLI providers.  Unknown verbs are rejected with the list of
//! supported forms.

use async_trait::async_trait;
use serde_json::{json, Value};

use aurora_creds::IsolatedEnv;

/// REST surface the translator dispatches to.  The HTTP client lives behind
/// this trait; tests script it.
#[async_trait]
pub trait TailscaleApi: Send + Sync {
    async fn list_devices(&self, token: &str, tailnet: &str) -> anyhow::Result<Value>;
    async fn get_device(&self, token: &str, device_id: &str) -> anyhow::Result<Value>;
    async fn authorize_device(&self, token: &str, device_id: &str) -> anyhow::Result<()>;
    async fn delete_device(&self, token: &str, device_id: &str) -> anyhow::Result<()>;
    async fn set_device_tags(&self, token: &str, device_id: &str, tags: &[String]) -> anyhow::Result<()>;
    async fn list_keys(&self, token: &str, tailnet: &str) -> anyhow::Result<Value>;
    async fn create_key(
        &self,
        token: &str,
        tailnet: &str,
        reusable: bool,
        ephemeral: bool,
        tags: &[String],
    ) -> anyhow::Result<Value>;
    async fn delete_key(&self, token: &str, tailnet: &str, key_id: &str) -> anyhow::Result<()>;
    async fn get_acl(&self, token: &str, tailnet: &str) -> anyhow::Result<Value>;
    async fn dns(&self, token: &str, tailnet: &str, kind: &str) -> anyhow::Result<Value>;
    async fn routes(&self, token: &str, tailnet: &str) -> anyhow::Result<Value>;
}

/// HTTP-backed client against the public v2 API.
pub struct TailscaleClient {
    http: reqwest::Client,
    base_url: String,
}

impl TailscaleClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.tailscale.com/api/v2".to_string(),
        }
    }

    async fn get(&self, token: &str, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("tailscale API returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("tailscale API returned {}", resp.status());
        }
        Ok(resp.json().await.unwrap_or(json!({})))
    }

    async fn delete(&self, token: &str, path: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("tailscale API returned {}", resp.status());
        }
        Ok(())
    }
}

impl Default for TailscaleClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TailscaleApi for TailscaleClient {
    async fn list_devices(&self, token: &str, tailnet: &str) -> anyhow::Result<Value> {
        Ok(self.get(token, &format!("/tailnet/{tailnet}/devices")).await?["devices"].clone())
    }
    async fn get_device(&self, token: &str, device_id: &str) -> anyhow::Result<Value> {
        self.get(token, &format!("/device/{device_id}")).await
    }
    async fn authorize_device(&self, token: &str, device_id: &str) -> anyhow::Result<()> {
        self.post(
            token,
            &format!("/device/{device_id}/authorized"),
            json!({"authorized": true}),
        )
        .await
        .map(|_| ())
    }
    async fn delete_device(&self, token: &str, device_id: &str) -> anyhow::Result<()> {
        self.delete(token, &format!("/device/{device_id}")).await
    }
    async fn set_device_tags(&self, token: &str, device_id: &str, tags: &[String]) -> anyhow::Result<()> {
        self.post(token, &format!("/device/{device_id}/tags"), json!({"tags": tags}))
            .await
            .map(|_| ())
    }
    async fn list_keys(&self, token: &str, tailnet: &str) -> anyhow::Result<Value> {
        self.get(token, &format!("/tailnet/{tailnet}/keys")).await
    }
    async fn create_key(
        &self,
        token: &str,
        tailnet: &str,
        reusable: bool,
        ephemeral: bool,
        tags: &[String],
    ) -> anyhow::Result<Value> {
        self.post(
            token,
            &format!("/tailnet/{tailnet}/keys"),
            json!({
                "capabilities": { "devices": { "create": {
                    "reusable": reusable,
                    "ephemeral": ephemeral,
                    "tags": tags,
                }}}
            }),
        )
        .await
    }
    async fn delete_key(&self, token: &str, tailnet: &str, key_id: &str) -> anyhow::Result<()> {
        self.delete(token, &format!("/tailnet/{tailnet}/keys/{key_id}")).await
    }
    async fn get_acl(&self, token: &str, tailnet: &str) -> anyhow::Result<Value> {
        self.get(token, &format!("/tailnet/{tailnet}/acl")).await
    }
    async fn dns(&self, token: &str, tailnet: &str, kind: &str) -> anyhow::Result<Value> {
        self.get(token, &format!("/tailnet/{tailnet}/dns/{kind}")).await
    }
    async fn routes(&self, token: &str, tailnet: &str) -> anyhow::Result<Value> {
        self.get(token, &format!("/tailnet/{tailnet}/routes")).await
    }
}

const SUPPORTED_FORMS: &str = "device list | device get <id> | device authorize <id> | \
device delete <id> | device tags <id> <tag...> | auth-key list | \
auth-key create [--reusable] [--ephemeral] [--tags t1,t2] | auth-key delete <id> | \
acl get | dns nameservers|searchpaths|preferences | routes list | status";

fn ok_json(output: Value) -> Value {
    let rendered = serde_json::to_string_pretty(&output).unwrap_or_default();
    json!({
        "success": true,
        "output": rendered,
        "chat_output": rendered,
        "return_code": 0,
    })
}

fn ok_text(message: String) -> Value {
    json!({
        "success": true,
        "output": message.clone(),
        "chat_output": message,
        "return_code": 0,
    })
}

fn err(message: String) -> Value {
    json!({ "success": false, "error": message, "return_code": 1 })
}

/// Parse and dispatch a Tailscale command against the REST API, returning
/// the common envelope fields.
pub async fn execute_tailscale_command(api: &dyn TailscaleApi, command: &str, env: &IsolatedEnv) -> Value {
    let Some(token) = env.get("TAILSCALE_ACCESS_TOKEN") else {
        return err("No Tailscale access token available".into());
    };
    let tailnet = env.get("TAILSCALE_TAILNET").unwrap_or("-");

    let mut cmd = command.trim();
    if let Some(rest) = cmd.strip_prefix("tailscale ") {
        cmd = rest.trim();
    }
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    let Some(&action) = parts.first() else {
        return err("Empty command".into());
    };
    let args = &parts[1..];

    let result: anyhow::Result<Value> = match action.to_ascii_lowercase().as_str() {
        "device" | "devices" => match args.first().map(|s| s.to_ascii_lowercase()) {
            None => api.list_devices(token, tailnet).await.map(ok_json),
            Some(sub) => match (sub.as_str(), args.get(1)) {
                ("list", _) => api.list_devices(token, tailnet).await.map(ok_json),
                ("get", Some(id)) => api.get_device(token, id).await.map(ok_json),
                ("authorize", Some(id)) => api
                    .authorize_device(token, id)
                    .await
                    .map(|_| ok_text(format!("Device {id} authorized successfully"))),
                ("delete", Some(id)) => api
                    .delete_device(token, id)
                    .await
                    .map(|_| ok_text(format!("Device {id} deleted successfully"))),
                ("tags", Some(id)) => {
                    let tags: Vec<String> = args[2..].iter().map(|s| s.to_string()).collect();
                    api.set_device_tags(token, id, &tags)
                        .await
                        .map(|_| ok_text(format!("Tags updated for device {id}")))
                }
                _ => {
                    return err(format!(
                        "Unsupported device command. Supported forms: {SUPPORTED_FORMS}"
                    ))
                }
            },
        },
        "auth-key" | "keys" => {
            let sub = args.first().map(|s| s.to_ascii_lowercase());
            match sub.as_deref() {
                None | Some("list") => api.list_keys(token, tailnet).await.map(ok_json),
                Some("create") => {
                    let reusable = args.contains(&"--reusable");
                    let ephemeral = args.contains(&"--ephemeral");
                    let tags: Vec<String> = args
                        .iter()
                        .position(|a| *a == "--tags")
                        .and_then(|i| args.get(i + 1))
                        .map(|t| t.split(',').map(str::to_string).collect())
                        .unwrap_or_default();
                    api.create_key(token, tailnet, reusable, ephemeral, &tags)
                        .await
                        .map(ok_json)
                }
                Some("delete") => match args.get(1) {
                    Some(id) => api
                        .delete_key(token, tailnet, id)
                        .await
                        .map(|_| ok_text(format!("Auth key {id} deleted successfully"))),
                    None => return err("auth-key delete requires a key id".into()),
                },
                Some(_) => {
                    return err(format!(
                        "Unsupported auth-key command. Supported forms: {SUPPORTED_FORMS}"
                    ))
                }
            }
        }
        "acl" => api.get_acl(token, tailnet).await.map(ok_json),
        "dns" => {
            let kind = match args.first().map(|s| s.to_ascii_lowercase()) {
                Some(k) if ["nameservers", "searchpaths", "preferences"].contains(&k.as_str()) => k,
                _ => {
                    return err(format!(
                        "Unsupported dns command. Supported forms: {SUPPORTED_FORMS}"
                    ))
                }
            };
            api.dns(token, tailnet, &kind).await.map(ok_json)
        }
        "routes" => api.routes(token, tailnet).await.map(ok_json),
        "status" => api.list_devices(token, tailnet).await.map(|devices| {
            let count = devices.as_array().map(Vec::len).unwrap_or(0);
            let mut v = ok_json(devices);
            v["chat_output"] = json!(format!("Tailnet {tailnet}: {count} devices"));
            v
        }),
        "settings" => api.dns(token, tailnet, "preferences").await.map(ok_json),
        other => {
            return err(format!(
                "Unknown Tailscale command '{other}'. Supported forms: {SUPPORTED_FORMS}"
            ))
        }
    };

    match result {
        Ok(v) => v,
        Err(e) => err(e.to_string()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
