// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The background chat task and the stale-session sweeper.
//!
//! A task runs the same agent loop as an interactive session, with no
//! socket and auto-resolving confirmation gates.  The hard timeout maps to
//! `failed`, the incident's `aurora_status` follows the DAG, and the final
//! guard ensures no session is ever left `in_progress`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use aurora_config::{CloudProvider, Config, SessionMode};
use aurora_core::{Agent, RcaContext, Session};
use aurora_creds::CredentialStore;
use aurora_fabric::ConnectionRegistry;
use aurora_model::ModelProvider;
use aurora_tools::{ConfirmationGate, ToolCtx, ToolRegistry};

use crate::citations::extract_citations;
use crate::incident::{
    AuroraStatus, IncidentStatus, IncidentStore, SessionRow, SessionStatus, SessionStore, Severity,
};
use crate::notify::{dispatch, Notifier, RcaEvent};
use crate::ratelimit::RateLimiter;
use crate::summarize::{
    build_rca_summary_prompt, build_transcript_summary_prompt, cited_subset, complete_text,
    determine_severity, extract_suggestions,
};

/// Alert sources that get the RCA prompt treatment.
const RCA_SOURCES: &[&str] = &["grafana", "netdata", "datadog", "coroot", "slack"];

/// Everything a background task needs, dependency-injected at startup —
/// background workers receive the same handles the request scope uses.
pub struct BackgroundDeps {
    pub config: Arc<Config>,
    pub agent: Arc<Agent>,
    pub registry: Arc<ToolRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub sessions: Arc<dyn SessionStore>,
    pub incidents: Arc<dyn IncidentStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub notifier: Arc<dyn Notifier>,
    pub cred_store: Arc<dyn CredentialStore>,
    /// Pinned one-shot summariser model.
    pub summary_model: Arc<dyn ModelProvider>,
    /// Gate used inside the background session (auto-approve or
    /// auto-cancel per policy).
    pub gate: Arc<dyn ConfirmationGate>,
}

pub struct BackgroundChatParams {
    pub user_id: String,
    pub session_id: String,
    pub initial_message: String,
    pub trigger_metadata: Value,
    pub provider_preference: Vec<CloudProvider>,
    pub incident_id: Option<String>,
    pub send_notifications: bool,
    pub mode: SessionMode,
}

#[derive(Debug, Clone)]
pub struct BackgroundChatResult {
    pub session_id: String,
    pub status: &'static str,
    pub error: Option<String>,
}

/// Build the RCA context for the prompt's ephemeral segment; `None` for
/// non-RCA trigger sources.
async fn build_rca_context(
    deps: &BackgroundDeps,
    user_id: &str,
    trigger_metadata: &Value,
    preference: &[CloudProvider],
) -> Option<RcaContext> {
    let source = trigger_metadata["source"].as_str()?.to_ascii_lowercase();
    if !RCA_SOURCES.contains(&source.as_str()) {
        return None;
    }
    let providers = if preference.is_empty() {
        deps.cred_store.connected_providers(user_id).await
    } else {
        preference.to_vec()
    };
    let mut integrations = Vec::new();
    for service in ["splunk", "github"] {
        let connected = deps
            .cred_store
            .get_service_credentials(user_id, service)
            .await
            .is_some();
        integrations.push((service.to_string(), connected));
    }
    let trigger_summary = trigger_metadata["title"]
        .as_str()
        .map(str::to_string)
        .or_else(|| trigger_metadata["alert_id"].as_str().map(|a| format!("alert {a}")));
    Some(RcaContext {
        source,
        providers,
        integrations,
        trigger_summary,
    })
}

/// Run a chat session in the background without a socket.
pub async fn run_background_chat(
    deps: &BackgroundDeps,
    params: BackgroundChatParams,
) -> BackgroundChatResult {
    let session_id = params.session_id.clone();
    info!(user = %params.user_id, session = %session_id, "background chat starting");

    // Alert floods must not spawn unbounded investigations.
    if !deps.rate_limiter.check(&params.user_id).await {
        return BackgroundChatResult {
            session_id,
            status: "rate_limited",
            error: Some("background chat rate limit exceeded".into()),
        };
    }

    deps.sessions
        .create(SessionRow {
            id: session_id.clone(),
            user_id: params.user_id.clone(),
            status: SessionStatus::InProgress,
            incident_id: params.incident_id.clone(),
            updated_at: Utc::now(),
        })
        .await;

    if let Some(incident_id) = &params.incident_id {
        deps.incidents.link_session(incident_id, &session_id).await;
        deps.incidents
            .set_aurora_status(incident_id, AuroraStatus::Running, false)
            .await;
        deps.incidents
            .set_status(incident_id, IncidentStatus::Investigating)
            .await;
        if params.send_notifications {
            dispatch(
                deps.notifier.as_ref(),
                &params.user_id,
                incident_id,
                RcaEvent::Started,
            )
            .await;
        }
    }

    let timeout = Duration::from_secs(deps.config.background.task_timeout_secs);
    let outcome = tokio::time::timeout(timeout, execute_chat(deps, &params)).await;

    match outcome {
        Ok(Ok(())) => {
            deps.sessions
                .set_status(&session_id, SessionStatus::Completed)
                .await;
            if let Some(incident_id) = &params.incident_id {
                deps.incidents
                    .set_status(incident_id, IncidentStatus::Analyzed)
                    .await;
                deps.incidents
                    .set_aurora_status(incident_id, AuroraStatus::Complete, false)
                    .await;

                // Post-RCA enrichment is best-effort; a failed summary must
                // never fail the task.
                if let Err(e) =
                    generate_incident_summary_from_chat(deps, incident_id, &params.user_id, &session_id)
                        .await
                {
                    error!(incident = %incident_id, error = %e, "post-rca summarisation failed");
                }
                if params.send_notifications {
                    dispatch(
                        deps.notifier.as_ref(),
                        &params.user_id,
                        incident_id,
                        RcaEvent::Completed,
                    )
                    .await;
                }
            }
            info!(session = %session_id, "background chat completed");
            BackgroundChatResult {
                session_id,
                status: "completed",
                error: None,
            }
        }
        Ok(Err(e)) => {
            error!(session = %session_id, error = %e, "background chat failed");
            fail(deps, &params, &session_id, params.send_notifications).await;
            BackgroundChatResult {
                session_id,
                status: "failed",
                error: Some(e.to_string()),
            }
        }
        Err(_) => {
            error!(session = %session_id, "background chat exceeded its hard timeout");
            fail(deps, &params, &session_id, params.send_notifications).await;
            BackgroundChatResult {
                session_id,
                status: "failed",
                error: Some(format!(
                    "background chat exceeded {} s timeout",
                    timeout.as_secs()
                )),
            }
        }
    }
}

async fn fail(
    deps: &BackgroundDeps,
    params: &BackgroundChatParams,
    session_id: &str,
    send_notifications: bool,
) {
    // The session is never left in_progress, whatever went wrong.
    deps.sessions
        .set_status(session_id, SessionStatus::Failed)
        .await;
    if let Some(incident_id) = &params.incident_id {
        deps.incidents
            .set_aurora_status(incident_id, AuroraStatus::Error, false)
            .await;
        if send_notifications {
            dispatch(deps.notifier.as_ref(), &params.user_id, incident_id, RcaEvent::Failed).await;
        }
    }
}

/// The inner workflow: the interactive loop with a no-op sink and the
/// background gate, plus the larger context window.
async fn execute_chat(deps: &BackgroundDeps, params: &BackgroundChatParams) -> anyhow::Result<()> {
    let preference = if params.provider_preference.is_empty() {
        deps.cred_store.connected_providers(&params.user_id).await
    } else {
        params.provider_preference.clone()
    };

    let mut session = Session::new(&params.session_id, &params.user_id, params.mode);
    session.preference = preference.clone();
    session.incident_id = params.incident_id.clone();
    // RCA chats run pinned to the RCA model, whatever mode they use.
    session.model_override = Some(deps.config.model.rca_model.clone());

    let rca = build_rca_context(deps, &params.user_id, &params.trigger_metadata, &preference).await;

    let ctx = ToolCtx {
        user_id: params.user_id.clone(),
        session_id: params.session_id.clone(),
        mode: params.mode,
        preference,
        selected_project: None,
        incident_id: params.incident_id.clone(),
        recent_user_messages: vec![params.initial_message.clone()],
        capture: session.capture.clone(),
        confirm: deps.gate.clone(),
    };

    deps.agent
        .run_turn(
            &mut session,
            deps.registry.clone(),
            &ctx,
            &params.initial_message,
            vec![],
            rca.as_ref(),
        )
        .await?;

    deps.sessions
        .save_transcript(&params.session_id, session.transcript.clone())
        .await;
    Ok(())
}

/// Regenerate the incident summary from the finished RCA chat, persisting
/// only the citations the summary references, then extract suggestions.
pub async fn generate_incident_summary_from_chat(
    deps: &BackgroundDeps,
    incident_id: &str,
    user_id: &str,
    session_id: &str,
) -> anyhow::Result<()> {
    let Some(incident) = deps.incidents.get(incident_id).await else {
        warn!(incident = incident_id, "incident not found; skipping chat-based summary");
        return Ok(());
    };
    let transcript = deps.sessions.transcript(session_id).await;
    let citations = extract_citations(&transcript);
    info!(
        incident = incident_id,
        citations = citations.len(),
        "extracted potential citations"
    );

    let severity_label = format!("{:?}", incident.severity).to_lowercase();
    let prompt = if citations.is_empty() {
        let text: String = transcript
            .iter()
            .filter_map(|m| m.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        build_transcript_summary_prompt(&incident.title, &incident.service, &text)
    } else {
        build_rca_summary_prompt(&incident.title, &severity_label, &incident.service, &citations)
    };

    let summary = complete_text(deps.summary_model.as_ref(), &prompt).await?;

    // Persist only the cited subset.
    let used = cited_subset(&summary, &citations);
    if !used.is_empty() {
        info!(incident = incident_id, used = used.len(), "saving cited citations");
        deps.incidents.save_citations(incident_id, used.clone()).await;
    }

    let suggestions = extract_suggestions(
        deps.summary_model.as_ref(),
        &summary,
        if used.is_empty() { &citations } else { &used },
        &incident.service,
    )
    .await;
    if !suggestions.is_empty() {
        deps.incidents.save_suggestions(incident_id, suggestions).await;
    }

    deps.incidents.set_summary(incident_id, &summary).await;

    // Re-evaluate severity from the investigation when still unknown.
    if incident.severity == Severity::Unknown {
        let excerpt: String = transcript
            .iter()
            .take(10)
            .filter_map(|m| m.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(severity) = determine_severity(deps.summary_model.as_ref(), &excerpt).await {
            if severity != Severity::Unknown {
                deps.incidents.set_severity(incident_id, severity).await;
            }
        }
    }
    Ok(())
}

/// Pre-RCA alert-only summary: no session, no tools.
pub async fn generate_incident_summary(
    deps: &BackgroundDeps,
    incident_id: &str,
    raw_payload: &Value,
) -> anyhow::Result<()> {
    let Some(incident) = deps.incidents.get(incident_id).await else {
        anyhow::bail!("incident {incident_id} not found");
    };
    let severity_label = format!("{:?}", incident.severity).to_lowercase();
    let prompt = crate::summarize::build_alert_summary_prompt(
        &incident.source,
        &incident.title,
        &severity_label,
        &incident.service,
        raw_payload,
    );
    let summary = complete_text(deps.summary_model.as_ref(), &prompt).await?;
    // Only the summary is updated here: a concurrent RCA run owns
    // aurora_status.
    deps.incidents.set_summary(incident_id, &summary).await;
    Ok(())
}

/// Periodic sweeper: sessions stuck `in_progress` past the threshold are
/// failed and their incidents marked errored.
pub async fn cleanup_stale_background_chats(
    sessions: &dyn SessionStore,
    incidents: &dyn IncidentStore,
    stale_after: Duration,
) -> usize {
    let stale = sessions
        .stale_in_progress(chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::minutes(20)))
        .await;
    for row in &stale {
        warn!(session = %row.id, "sweeping stale background chat");
        sessions.set_status(&row.id, SessionStatus::Failed).await;
        if let Some(incident_id) = &row.incident_id {
            incidents
                .set_aurora_status(incident_id, AuroraStatus::Error, false)
                .await;
        }
    }
    stale.len()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{InMemoryIncidentStore, InMemorySessionStore, Incident};
    use crate::notify::RecordingNotifier;
    use crate::ratelimit::InMemoryRateLimiter;
    use aurora_core::WrappedTool;
    use aurora_creds::InMemoryCredentialStore;
    use aurora_fabric::BackgroundGate;
    use aurora_model::mock::ScriptedMockProvider;
    use aurora_model::ResponseEvent;
    use aurora_tools::{Tool, ToolCtx, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubCloudExec;

    #[async_trait]
    impl Tool for StubCloudExec {
        fn name(&self) -> &str {
            "cloud_exec"
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolCtx) -> ToolOutput {
            ToolOutput::ok(r#"{"success":true,"chat_output":"cpu at 97%"}"#)
        }
    }

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    struct Fixture {
        deps: BackgroundDeps,
        incidents: Arc<InMemoryIncidentStore>,
        sessions: Arc<InMemorySessionStore>,
        notifier: Arc<RecordingNotifier>,
    }

    /// Agent scripted to make one tool call, then conclude with a cited
    /// diagnosis; the summary model then produces a cited report and a
    /// suggestion array.
    fn fixture() -> Fixture {
        std::env::set_var("AGENT_RECURSION_LIMIT", "10");
        let connections = Arc::new(ConnectionRegistry::new());
        let config = Arc::new(Config::default());

        let agent_provider = Arc::new(ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "c1".into(),
                    name: "cloud_exec".into(),
                    arguments: r#"{"provider":"gcp","command":"compute instances list"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta("The data-processor VM is CPU-saturated.".into()),
                ResponseEvent::Done,
            ],
        ]));
        let agent = Arc::new(
            Agent::new(config.clone(), connections.clone()).with_provider(agent_provider),
        );

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WrappedTool::new(
            Arc::new(StubCloudExec),
            connections.clone(),
        )));

        let summary_model = Arc::new(ScriptedMockProvider::new(vec![
            // Post-RCA summary citing evidence [1].
            vec![
                ResponseEvent::TextDelta(
                    "CPU saturation caused the alert [1]. The instance list confirms one overloaded VM [1].".into(),
                ),
                ResponseEvent::Done,
            ],
            // Suggestion extraction.
            vec![
                ResponseEvent::TextDelta(
                    r#"[{"title":"Resize the VM","description":"Move to e2-standard-4","type":"command","risk":"medium","command":"gcloud compute instances set-machine-type"}]"#.into(),
                ),
                ResponseEvent::Done,
            ],
        ]));

        let incidents = Arc::new(InMemoryIncidentStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new(true, true, true));
        let cred_store = Arc::new(InMemoryCredentialStore::new());

        let deps = BackgroundDeps {
            config,
            agent,
            registry: Arc::new(registry),
            connections,
            sessions: sessions.clone(),
            incidents: incidents.clone(),
            rate_limiter: Arc::new(InMemoryRateLimiter::new(5, Duration::from_secs(300))),
            notifier: notifier.clone(),
            cred_store,
            summary_model,
            gate: Arc::new(BackgroundGate::new(true)),
        };
        Fixture {
            deps,
            incidents,
            sessions,
            notifier,
        }
    }

    fn params(incident_id: Option<String>) -> BackgroundChatParams {
        BackgroundChatParams {
            user_id: "u1".into(),
            session_id: "bg-sess-1".into(),
            initial_message: "investigate the HighCPU alert".into(),
            trigger_metadata: json!({"source": "grafana", "title": "HighCPU on data-processor"}),
            provider_preference: vec![CloudProvider::Gcp],
            incident_id,
            send_notifications: true,
            mode: SessionMode::Ask,
        }
    }

    // ── Scenario 6: the full grafana-triggered pipeline ───────────────────────

    #[tokio::test]
    async fn grafana_rca_runs_to_completion_with_citations_and_suggestions() {
        let _env = env_guard();
        let f = fixture();
        let incident = Incident::new("u1", "grafana", "HighCPU", Severity::Unknown, "data-processor");
        let incident_id = incident.id.clone();
        f.incidents.create(incident).await;

        let result = run_background_chat(&f.deps, params(Some(incident_id.clone()))).await;
        assert_eq!(result.status, "completed");

        let incident = f.incidents.get(&incident_id).await.unwrap();
        // Status walked pending → running → complete.
        assert_eq!(incident.aurora_status, AuroraStatus::Complete);
        assert_eq!(incident.status, IncidentStatus::Analyzed);
        assert_eq!(incident.chat_session_id.as_deref(), Some("bg-sess-1"));
        assert!(incident.summary.as_ref().unwrap().contains("[1]"));

        // Only the cited citation row is persisted.
        let citations = f.incidents.citations(&incident_id).await;
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].index, 1);
        assert_eq!(citations[0].command, "compute instances list");

        let suggestions = f.incidents.suggestions(&incident_id).await;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].title, "Resize the VM");

        // Session completed; transcript persisted for later inspection.
        let row = f.sessions.get("bg-sess-1").await.unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        assert!(!f.sessions.transcript("bg-sess-1").await.is_empty());

        // Started + completed notifications went out on both channels.
        let sent = f.notifier.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, e, c)| *e == RcaEvent::Started && *c == "email"));
        assert!(sent.iter().any(|(_, e, c)| *e == RcaEvent::Completed && *c == "slack"));
    }

    #[tokio::test]
    async fn rate_limited_requests_never_create_sessions() {
        let _env = env_guard();
        let f = fixture();
        for _ in 0..5 {
            assert!(f.deps.rate_limiter.check("u1").await);
        }
        let result = run_background_chat(&f.deps, params(None)).await;
        assert_eq!(result.status, "rate_limited");
        assert!(f.sessions.get("bg-sess-1").await.is_none());
    }

    #[tokio::test]
    async fn agent_failure_marks_session_failed_and_incident_errored() {
        let _env = env_guard();
        let mut f = fixture();
        // Replace the agent with one whose provider always fails.
        struct DeadProvider;
        #[async_trait]
        impl ModelProvider for DeadProvider {
            fn name(&self) -> &str {
                "dead"
            }
            fn model_name(&self) -> &str {
                "dead"
            }
            async fn complete(
                &self,
                _req: aurora_model::CompletionRequest,
            ) -> anyhow::Result<aurora_model::ResponseStream> {
                anyhow::bail!("connection reset by peer")
            }
        }
        // A provider that always fails with a network error exhausts the
        // retry budget; the agent then ends the turn gracefully with an
        // error assistant message — so the task still completes.  Force a
        // hard failure instead by making the recursion limit unparseable.
        std::env::set_var("AGENT_RECURSION_LIMIT", "not-a-number");
        f.deps.agent = Arc::new(
            Agent::new(f.deps.config.clone(), f.deps.connections.clone())
                .with_provider(Arc::new(DeadProvider)),
        );

        let incident = Incident::new("u1", "grafana", "HighCPU", Severity::Medium, "svc");
        let incident_id = incident.id.clone();
        f.incidents.create(incident).await;

        let result = run_background_chat(&f.deps, params(Some(incident_id.clone()))).await;
        assert_eq!(result.status, "failed");

        let row = f.sessions.get("bg-sess-1").await.unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(
            f.incidents.get(&incident_id).await.unwrap().aurora_status,
            AuroraStatus::Error
        );
        std::env::set_var("AGENT_RECURSION_LIMIT", "10");
    }

    // ── Sweeper ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sweeper_fails_stale_sessions_and_errors_their_incidents() {
        let _env = env_guard();
        let f = fixture();
        let incident = Incident::new("u1", "grafana", "t", Severity::Low, "svc");
        let incident_id = incident.id.clone();
        f.incidents.create(incident).await;
        f.incidents
            .set_aurora_status(&incident_id, AuroraStatus::Running, false)
            .await;

        f.sessions
            .create(SessionRow {
                id: "stuck".into(),
                user_id: "u1".into(),
                status: SessionStatus::InProgress,
                incident_id: Some(incident_id.clone()),
                updated_at: Utc::now(),
            })
            .await;
        f.sessions.backdate("stuck", chrono::Duration::minutes(30));

        let swept = cleanup_stale_background_chats(
            f.sessions.as_ref(),
            f.incidents.as_ref(),
            Duration::from_secs(1200),
        )
        .await;
        assert_eq!(swept, 1);
        assert_eq!(
            f.sessions.get("stuck").await.unwrap().status,
            SessionStatus::Failed
        );
        assert_eq!(
            f.incidents.get(&incident_id).await.unwrap().aurora_status,
            AuroraStatus::Error
        );
    }

    #[tokio::test]
    async fn non_rca_sources_get_no_rca_context() {
        let _env = env_guard();
        let f = fixture();
        let ctx = build_rca_context(
            &f.deps,
            "u1",
            &json!({"source": "manual"}),
            &[CloudProvider::Gcp],
        )
        .await;
        assert!(ctx.is_none());

        let ctx = build_rca_context(
            &f.deps,
            "u1",
            &json!({"source": "grafana", "title": "HighCPU"}),
            &[CloudProvider::Gcp],
        )
        .await;
        let ctx = ctx.unwrap();
        assert_eq!(ctx.source, "grafana");
        assert_eq!(ctx.trigger_summary.as_deref(), Some("HighCPU"));
    }
}
