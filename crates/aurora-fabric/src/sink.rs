// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Where events for one session go.  The interactive transport implements
/// this over its WebSocket sender; background sessions use [`NoopSink`].
#[async_trait]
pub trait Sink: Send + Sync {
    /// Send one already-validated JSON payload.  Errors are swallowed by
    /// callers — a dropped frame must never fail a tool.
    async fn send(&self, payload: Value) -> anyhow::Result<()>;
}

/// Sink for background sessions: accepts and discards everything.
pub struct NoopSink;

#[async_trait]
impl Sink for NoopSink {
    async fn send(&self, _payload: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink backed by an mpsc channel; the transport (or a test) drains the
/// receiver half.
pub struct ChannelSink {
    tx: mpsc::Sender<Value>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn send(&self, payload: Value) -> anyhow::Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("socket receiver dropped"))
    }
}

/// Test sink that records every payload.
#[derive(Default)]
pub struct CollectingSink {
    pub sent: Mutex<Vec<Value>>,
}

#[async_trait]
impl Sink for CollectingSink {
    async fn send(&self, payload: Value) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
