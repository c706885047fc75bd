// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `cloud_exec` dispatcher.
//!
//! One pipeline serves six control planes: resolve the provider from
//! context, mint an isolated environment, classify the command, gate writes
//! behind mode policy and user confirmation, execute the CLI in the bundle
//! (or translate to REST for Tailscale), shape the result into the common
//! JSON envelope, and capture the outcome for the transcript.

pub mod classify;
pub mod context;
pub mod flags;
pub mod projection;
pub mod shape;
pub mod tailscale;

mod tool;

pub use aurora_tools::runner::{CommandRunner, RunOutcome, ScriptedRunner, SubprocessRunner};
pub use tool::CloudExecTool;
