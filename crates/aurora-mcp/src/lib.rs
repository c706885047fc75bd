// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP (Model-Context-Protocol) stdio bridge.
//!
//! External MCP servers expand the tool set: the GitHub server (Docker),
//! the AWS API server (python module) and the Context7 documentation server
//! (npx).  Each server speaks JSON-RPC over stdio, strictly sequentially —
//! a per-server lock serialises requests and restarts.  Discovered tools
//! surface as `mcp_`-prefixed [`aurora_tools::Tool`]s routed through the
//! same confirmation gate as cloud writes.

pub mod manager;
pub mod protocol;
pub mod tools;

pub use manager::{McpServerManager, ServerKind};
pub use protocol::{JsonRpcClient, McpToolSpec};
pub use tools::{is_destructive_mcp_tool, summarize_mcp_tool_action, McpBridgedTool};
