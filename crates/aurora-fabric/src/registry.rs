// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide connection registry.
//!
//! Maps (user, session) to the currently-active sender.  On reconnect the
//! newer entry supersedes the older one whole; sends are serialised by a
//! per-registry mutex so frames from parallel tools never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::sink::Sink;

#[derive(Clone)]
pub struct ConnectionEntry {
    pub sink: Arc<dyn Sink>,
    /// Monotonic id assigned by the transport; newer wins on reconnect.
    pub connection_id: u64,
}

pub struct ConnectionRegistry {
    entries: Mutex<HashMap<(String, String), ConnectionEntry>>,
    /// Serialises all sends through this registry.
    send_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            send_lock: Mutex::new(()),
        }
    }

    /// Register (or replace) the connection for a session.  An entry with a
    /// lower connection id never replaces a newer one — a late register from
    /// a stale socket is dropped.
    pub async fn register(
        &self,
        user_id: &str,
        session_id: &str,
        sink: Arc<dyn Sink>,
        connection_id: u64,
    ) {
        let key = (user_id.to_string(), session_id.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            if existing.connection_id > connection_id {
                warn!(
                    user_id,
                    session_id,
                    stale = connection_id,
                    active = existing.connection_id,
                    "ignoring stale connection registration"
                );
                return;
            }
        }
        debug!(user_id, session_id, connection_id, "registered connection");
        entries.insert(
            key,
            ConnectionEntry {
                sink,
                connection_id,
            },
        );
    }

    pub async fn unregister(&self, user_id: &str, session_id: &str) {
        let key = (user_id.to_string(), session_id.to_string());
        self.entries.lock().await.remove(&key);
    }

    pub async fn get(&self, user_id: &str, session_id: &str) -> Option<ConnectionEntry> {
        let key = (user_id.to_string(), session_id.to_string());
        self.entries.lock().await.get(&key).cloned()
    }

    /// Validated send: the payload must round-trip through the JSON encoder;
    /// otherwise a minimal fallback envelope stating the tool completed is
    /// sent instead.  Missing connections are silently dropped — tools never
    /// fail because the user navigated away.
    pub async fn send_validated(
        &self,
        user_id: &str,
        session_id: &str,
        payload: Value,
        tool_name: &str,
    ) {
        let Some(entry) = self.get(user_id, session_id).await else {
            debug!(user_id, session_id, tool_name, "no active connection; event dropped");
            return;
        };

        let validated = match serde_json::to_string(&payload)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        {
            Some(_) => payload,
            None => {
                warn!(tool_name, "payload failed JSON validation; sending fallback");
                json!({
                    "type": "tool_result",
                    "data": {
                        "tool_name": tool_name,
                        "output": format!("{tool_name} completed"),
                        "status": "completed",
                    }
                })
            }
        };

        let _guard = self.send_lock.lock().await;
        if let Err(e) = entry.sink.send(validated).await {
            warn!(user_id, session_id, tool_name, error = %e, "socket send failed");
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let reg = ConnectionRegistry::new();
        let old = Arc::new(CollectingSink::default());
        let new = Arc::new(CollectingSink::default());
        reg.register("u", "s", old.clone(), 1).await;
        reg.register("u", "s", new.clone(), 2).await;

        reg.send_validated("u", "s", json!({"n": 1}), "t").await;
        assert!(old.sent.lock().unwrap().is_empty());
        assert_eq!(new.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_registration_is_ignored() {
        let reg = ConnectionRegistry::new();
        let active = Arc::new(CollectingSink::default());
        let stale = Arc::new(CollectingSink::default());
        reg.register("u", "s", active.clone(), 5).await;
        reg.register("u", "s", stale.clone(), 3).await;

        reg.send_validated("u", "s", json!({}), "t").await;
        assert_eq!(active.sent.lock().unwrap().len(), 1);
        assert!(stale.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_connection_is_dropped() {
        let reg = ConnectionRegistry::new();
        // No panic, no error.
        reg.send_validated("u", "s", json!({"x": 1}), "t").await;
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let reg = ConnectionRegistry::new();
        let sink = Arc::new(CollectingSink::default());
        reg.register("u", "s", sink.clone(), 1).await;
        reg.unregister("u", "s").await;
        assert!(reg.get("u", "s").await.is_none());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let reg = ConnectionRegistry::new();
        let a = Arc::new(CollectingSink::default());
        let b = Arc::new(CollectingSink::default());
        reg.register("u", "s1", a.clone(), 1).await;
        reg.register("u", "s2", b.clone(), 1).await;
        reg.send_validated("u", "s2", json!({"to": "s2"}), "t").await;
        assert!(a.sent.lock().unwrap().is_empty());
        assert_eq!(b.sent.lock().unwrap().len(), 1);
    }
}
