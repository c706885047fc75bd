// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "aurora",
    about = "Agentic cloud-ops orchestrator worker",
    version
)]
pub struct Cli {
    /// Explicit config file path (merged over the discovered layers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background worker: periodic stale-session sweeping until
    /// interrupted
    Worker {
        /// Sweep interval in seconds
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
    /// Run one stale-session sweep and exit
    Sweep,
    /// Print the effective merged configuration as YAML
    ShowConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_subcommand_parses_with_interval() {
        let cli = Cli::parse_from(["aurora", "worker", "--interval-secs", "60"]);
        match cli.command {
            Commands::Worker { interval_secs } => assert_eq!(interval_secs, 60),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::parse_from(["aurora", "sweep", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Sweep));
    }
}
