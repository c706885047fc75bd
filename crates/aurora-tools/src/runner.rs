// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subprocess execution in an isolated environment.
//!
//! The child never sees the parent environment: `env_clear()` plus the
//! credential bundle is the whole world.  stdin is /dev/null and
//! `kill_on_drop` reaps children when a timeout fires.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use aurora_creds::IsolatedEnv;

/// Outcome of one subprocess run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finished {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// The binary is not on PATH.
    NotFound,
    TimedOut,
    SpawnError(String),
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], env: &IsolatedEnv, timeout: Duration) -> RunOutcome;

    /// Probe for a CLI binary.  Default: `which <cli>` with a short timeout.
    async fn cli_available(&self, cli: &str, env: &IsolatedEnv) -> bool {
        let argv = vec!["which".to_string(), cli.to_string()];
        matches!(
            self.run(&argv, env, Duration::from_secs(5)).await,
            RunOutcome::Finished { code: 0, .. }
        )
    }
}

/// The real runner.
#[derive(Default)]
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, argv: &[String], env: &IsolatedEnv, timeout: Duration) -> RunOutcome {
        let Some((program, args)) = argv.split_first() else {
            return RunOutcome::SpawnError("empty command".into());
        };
        debug!(program = %program, args = args.len(), "spawning cloud CLI");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(env.iter());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Ok(Ok(output)) => RunOutcome::Finished {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code().unwrap_or(-1),
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => RunOutcome::NotFound,
            Ok(Err(e)) => RunOutcome::SpawnError(e.to_string()),
            Err(_) => RunOutcome::TimedOut,
        }
    }
}

/// Scripted runner for tests: maps a joined command line to an outcome and
/// records every invocation.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<HashMap<String, RunOutcome>>,
    fallback: Mutex<Option<RunOutcome>>,
    pub invocations: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, command_line: &str, outcome: RunOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(command_line.to_string(), outcome);
    }

    pub fn fallback(&self, outcome: RunOutcome) {
        *self.fallback.lock().unwrap() = Some(outcome);
    }

    pub fn ok(&self, command_line: &str, stdout: &str) {
        self.on(
            command_line,
            RunOutcome::Finished {
                stdout: stdout.to_string(),
                stderr: String::new(),
                code: 0,
            },
        );
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, argv: &[String], _env: &IsolatedEnv, _timeout: Duration) -> RunOutcome {
        self.invocations.lock().unwrap().push(argv.to_vec());
        let line = argv.join(" ");
        if let Some(outcome) = self.outcomes.lock().unwrap().get(&line) {
            return outcome.clone();
        }
        if let Some(fallback) = self.fallback.lock().unwrap().clone() {
            return fallback;
        }
        RunOutcome::Finished {
            stdout: String::new(),
            stderr: format!("unscripted command: {line}"),
            code: 127,
        }
    }

    async fn cli_available(&self, _cli: &str, _env: &IsolatedEnv) -> bool {
        // Probes do not count as invocations in tests.
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
