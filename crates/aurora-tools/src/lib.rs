// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool execution primitives for the aurora agent.
//!
//! A tool is a trait object with a name, a JSON-Schema parameter contract
//! and an async `execute` that always returns a JSON envelope — errors are
//! folded into the envelope, never raised across the wrapper boundary.
//! Every invocation is recorded in the session's [`ToolCapture`] keyed by a
//! deterministic signature id so start/completion events pair up even when
//! the model runs tools in parallel.

pub mod capture;
pub mod events;
pub mod runner;
pub mod sanitize;
pub mod signature;

mod registry;
mod tool;

pub use capture::{ToolCapture, ToolCallRecord};
pub use registry::ToolRegistry;
pub use tool::{AutoApproveGate, AutoCancelGate, ConfirmationGate, Tool, ToolCtx, ToolOutput};
