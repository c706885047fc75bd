// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model provider abstraction for the aurora agent.
//!
//! Every LLM the orchestrator talks to — the agentic turn model, the RCA
//! model, the one-shot summarisers — is reached through [`ModelProvider`].
//! Two drivers ship in-tree: an Anthropic driver for direct vendor mode and
//! an OpenAI-compatible driver for gateway mode (OpenRouter).  The factory
//! in [`factory`] picks between them based on configuration and vendor
//! prefix.

mod anthropic;
pub mod factory;
pub mod mock;
mod openai_compat;
mod provider;
pub mod retry;
mod types;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAICompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use types::*;
