// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use aurora_rca::{cleanup_stale_background_chats, InMemoryIncidentStore, InMemorySessionStore};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(aurora_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
            Ok(())
        }
        Commands::Sweep => {
            let (sessions, incidents) = stores();
            let swept = cleanup_stale_background_chats(
                sessions.as_ref(),
                incidents.as_ref(),
                Duration::from_secs(config.background.stale_after_secs),
            )
            .await;
            info!(swept, "stale-session sweep complete");
            Ok(())
        }
        Commands::Worker { interval_secs } => {
            let (sessions, incidents) = stores();
            info!(interval_secs, "aurora worker started");
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = cleanup_stale_background_chats(
                            sessions.as_ref(),
                            incidents.as_ref(),
                            Duration::from_secs(config.background.stale_after_secs),
                        )
                        .await;
                        if swept > 0 {
                            info!(swept, "stale sessions failed by sweeper");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down worker");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Development stores.  Production deployments replace these through the
/// transport's dependency injection; the worker binary stays runnable
/// standalone.
fn stores() -> (Arc<InMemorySessionStore>, Arc<InMemoryIncidentStore>) {
    (
        Arc::new(InMemorySessionStore::new()),
        Arc::new(InMemoryIncidentStore::new()),
    )
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
