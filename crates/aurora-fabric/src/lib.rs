// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket / notification fabric.
//!
//! The transport owns the actual sockets; this crate owns the process-wide
//! registry mapping (user, session) to an active sender, the validated-send
//! path that guarantees every frame is encodable JSON, and the confirmation
//! gates that route destructive-action prompts through the transport.

mod confirm;
mod registry;
mod sink;

pub use confirm::{BackgroundGate, ChannelConfirmationGate, ConfirmationRequest};
pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use sink::{ChannelSink, CollectingSink, NoopSink, Sink};
