// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incident summarisation.
//!
//! Two flavours: an alert-only summary produced right after the webhook
//! (no tools, raw payload in, 2–3 factual paragraphs out), and a post-RCA
//! summary built over an evidence index of citations whose `[n]` markers
//! are re-parsed so only the cited subset is persisted.

use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use aurora_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};

use crate::citations::parse_used_citations;
use crate::incident::{Citation, Severity, Suggestion, SuggestionKind};

/// One-shot non-streaming completion: collect the text deltas.
pub async fn complete_text(provider: &dyn ModelProvider, prompt: &str) -> anyhow::Result<String> {
    let request = CompletionRequest {
        messages: vec![Message::user(prompt)],
        stream: true,
        ..Default::default()
    };
    let mut stream = provider.complete(request).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::Done => break,
            _ => {}
        }
    }
    Ok(text.trim().to_string())
}

/// Prompt for the pre-RCA alert summary.
pub fn build_alert_summary_prompt(
    source: &str,
    title: &str,
    severity: &str,
    service: &str,
    raw_payload: &Value,
) -> String {
    format!(
        "You are summarising a monitoring alert for an SRE. Write 2-3 short \
         factual paragraphs: what fired, which service is affected, and what \
         the payload says about scope and timing. No speculation about root \
         cause, no remediation advice.\n\n\
         Source: {source}\nTitle: {title}\nSeverity: {severity}\nService: {service}\n\n\
         Raw payload:\n{}",
        serde_json::to_string_pretty(raw_payload).unwrap_or_default()
    )
}

/// Prompt for the post-RCA summary over indexed evidence.  The model must
/// reference evidence with `[n]` markers; uncited evidence is dropped.
pub fn build_rca_summary_prompt(
    title: &str,
    severity: &str,
    service: &str,
    citations: &[Citation],
) -> String {
    let mut evidence = String::new();
    for citation in citations {
        evidence.push_str(&format!(
            "[{}] {} `{}`:\n{}\n\n",
            citation.index, citation.tool_name, citation.command, citation.output_excerpt
        ));
    }
    format!(
        "Write a factual incident report from the investigation evidence below. \
         Cite evidence with bracketed indices like [1] or [2, 3] immediately \
         after each claim they support. Only make claims the evidence supports. \
         Structure: what happened, what the evidence shows, the most likely \
         cause. Keep it under 300 words.\n\n\
         Incident: {title}\nSeverity: {severity}\nService: {service}\n\n\
         Evidence:\n{evidence}"
    )
}

/// Fallback prompt when the investigation produced no tool calls.
pub fn build_transcript_summary_prompt(title: &str, service: &str, transcript_text: &str) -> String {
    format!(
        "Write a factual incident report from the investigation transcript \
         below. Only state what the transcript supports. Keep it under 300 \
         words.\n\nIncident: {title}\nService: {service}\n\nTranscript:\n{transcript_text}"
    )
}

/// Deterministic severity call over the first transcript entries.
pub async fn determine_severity(
    provider: &dyn ModelProvider,
    transcript_excerpt: &str,
) -> anyhow::Result<Severity> {
    let prompt = format!(
        "Based on this incident investigation, answer with exactly one word - \
         critical, high, medium or low - describing the severity.\n\n{transcript_excerpt}"
    );
    let answer = complete_text(provider, &prompt).await?;
    let severity = Severity::parse(
        answer
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_ascii_alphabetic()),
    );
    info!(answer = %answer, ?severity, "severity determined from rca");
    Ok(severity)
}

/// Extract structured follow-up suggestions from the summary + evidence.
/// The model returns a JSON array; unparseable output yields no suggestions
/// rather than an error.
pub async fn extract_suggestions(
    provider: &dyn ModelProvider,
    summary: &str,
    citations: &[Citation],
    service: &str,
) -> Vec<Suggestion> {
    let mut evidence = String::new();
    for citation in citations.iter().take(10) {
        evidence.push_str(&format!("[{}] {}\n", citation.index, citation.command));
    }
    let prompt = format!(
        "From this incident report, extract up to 3 concrete follow-up actions \
         as a JSON array. Each item: {{\"title\", \"description\", \
         \"type\": \"fix\"|\"command\", \"risk\": \"low\"|\"medium\"|\"high\", \
         \"repository\" (optional), \"file_path\" (optional), \
         \"suggested_content\" (optional), \"command\" (optional)}}. \
         Output ONLY the JSON array.\n\n\
         Service: {service}\n\nReport:\n{summary}\n\nCommands run:\n{evidence}"
    );

    let response = match complete_text(provider, &prompt).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "suggestion extraction call failed");
            return Vec::new();
        }
    };
    parse_suggestions(&response)
}

/// Parse the model's suggestion array, tolerating surrounding prose and
/// code fences.
pub fn parse_suggestions(response: &str) -> Vec<Suggestion> {
    let start = response.find('[');
    let end = response.rfind(']');
    let json_slice = match (start, end) {
        (Some(s), Some(e)) if e > s => &response[s..=e],
        _ => return Vec::new(),
    };
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(json_slice) else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let title = item["title"].as_str()?.to_string();
            let kind = match item["type"].as_str().unwrap_or("fix") {
                "command" => SuggestionKind::Command,
                _ => SuggestionKind::Fix,
            };
            Some(Suggestion {
                title,
                description: item["description"].as_str().unwrap_or("").to_string(),
                kind,
                risk: item["risk"].as_str().unwrap_or("medium").to_string(),
                repository: item["repository"].as_str().map(str::to_string),
                file_path: item["file_path"].as_str().map(str::to_string),
                suggested_content: item["suggested_content"].as_str().map(str::to_string),
                command: item["command"].as_str().map(str::to_string),
                pr_url: None,
            })
        })
        .collect()
}

/// Keep only the citations the summary actually references.
pub fn cited_subset(summary: &str, citations: &[Citation]) -> Vec<Citation> {
    let used = parse_used_citations(summary);
    citations
        .iter()
        .filter(|c| used.contains(&c.index))
        .cloned()
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
