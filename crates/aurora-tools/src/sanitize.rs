// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Output sanitisation for tool results.
//!
//! Two audiences with different needs: the model always receives the full
//! JSON structure a tool produced, while the socket path truncates
//! individual string fields so oversized command output cannot break frame
//! encoding.  Both paths strip ANSI sequences and NULs.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Per-field ceiling applied on the socket path (bytes).
pub const FIELD_TRUNCATE_LIMIT: usize = 10_000;

/// Whole-output ceiling for plain text (bytes).
pub const OUTPUT_TRUNCATE_LIMIT: usize = 50_000;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap())
}

/// Strip ANSI escape sequences and NUL bytes.
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").replace('\0', "")
}

/// Sanitise command output for transmission: strip ANSI/NULs and truncate
/// past `max_len` with an explicit marker.
pub fn sanitize_command_output(output: &str, max_len: usize) -> String {
    if output.is_empty() {
        return String::new();
    }
    let cleaned = strip_ansi(output);
    if cleaned.len() > max_len {
        let total = cleaned.len();
        let cut = floor_char_boundary(&cleaned, max_len);
        tracing::warn!(from = total, to = max_len, "truncating large command output");
        format!(
            "{}\n\n... [output truncated from {total} bytes to {max_len} bytes]",
            &cleaned[..cut]
        )
    } else {
        cleaned
    }
}

/// Sanitise without truncating — serial-port logs want full content.
pub fn sanitize_no_truncate(output: &str) -> String {
    strip_ansi(output)
}

/// Recursively truncate string fields of a JSON structure while preserving
/// the structure itself, so nested keys remain navigable.  Keys longer than
/// 200 bytes are also clipped.
pub fn truncate_json_fields(data: &Value, max_field_len: usize) -> Value {
    match data {
        Value::String(s) => {
            if s.len() > max_field_len {
                let cut = floor_char_boundary(s, max_field_len);
                Value::String(format!("{}... [field truncated]", &s[..cut]))
            } else {
                data.clone()
            }
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = if k.len() > 200 {
                        let cut = floor_char_boundary(k, 200);
                        format!("{}...", &k[..cut])
                    } else {
                        k.clone()
                    };
                    (key, truncate_json_fields(v, max_field_len))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| truncate_json_fields(v, max_field_len))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Sanitise a payload for the socket: parse JSON strings if possible, clip
/// individual fields, and validate the result round-trips through the JSON
/// encoder.  Returns a minimal fallback on any failure.
pub fn sanitize_for_socket(data: &Value) -> Value {
    let cleaned = match data {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => truncate_json_fields(&parsed, FIELD_TRUNCATE_LIMIT),
            Err(_) => {
                let text = strip_ansi(s);
                if text.len() > FIELD_TRUNCATE_LIMIT {
                    let cut = floor_char_boundary(&text, FIELD_TRUNCATE_LIMIT);
                    Value::String(format!("{}... [field truncated]", &text[..cut]))
                } else {
                    Value::String(text)
                }
            }
        },
        other => truncate_json_fields(other, FIELD_TRUNCATE_LIMIT),
    };
    match serde_json::to_string(&cleaned) {
        Ok(_) => cleaned,
        Err(_) => Value::String("[content sanitized for transmission]".into()),
    }
}

/// Largest index `<= max` that is a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ─── stderr heuristics ───────────────────────────────────────────────────────

fn ovh_timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}").unwrap())
}

/// OVH CLI writes timestamped debug output and the echoed request JSON to
/// stderr before the actual error.
fn is_ovh_debug_line(line: &str) -> bool {
    let trimmed = line.trim();
    if ovh_timestamp_re().is_match(trimmed) {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    if matches!(lower.as_str(), "{" | "}" | "},") {
        return true;
    }
    if lower.starts_with('"') && lower.contains(':') {
        const JSON_FIELDS: &[&str] = &[
            "billingperiod",
            "bootfrom",
            "imageid",
            "flavor",
            "network",
            "public",
            "private",
            "name",
            "id",
        ];
        if JSON_FIELDS.iter().any(|f| lower.contains(&format!("\"{f}\""))) {
            return true;
        }
    }
    lower.contains("final parameters:")
}

/// Filter stderr to the lines that are actual errors, excluding warnings,
/// SDK notices and OVH debug output.  Falls back to the last three
/// non-warning lines when nothing matches.
pub fn filter_error_messages(stderr: &str) -> String {
    if stderr.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let mut error_lines: Vec<String> = Vec::new();

    let is_warning_noise = |line: &str| {
        line.starts_with("WARNING:")
            || line.contains("WARNING:")
            || line.starts_with("As of Cloud SDK")
            || line.starts_with("You can disable")
            || line.starts_with("To learn more about")
            || line.contains("is no longer supported")
            || line.contains("will be deprecated")
            || line.contains("All API calls will be executed as")
            || line.contains("service account impersonation")
    };

    for raw in &lines {
        let line = raw.trim();
        if line.is_empty() || is_ovh_debug_line(line) {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if line.contains("ERROR:") || line.contains("FATAL:") {
            error_lines.push(line.to_string());
        } else if ["exception:", "traceback", "failed:", "invalid value"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            error_lines.push(line.to_string());
        } else if is_warning_noise(line) {
            continue;
        } else if ["error", "fail", "denied", "not found", "invalid", "required"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            error_lines.push(line.to_string());
        }
    }

    if error_lines.is_empty() {
        for raw in lines.iter().rev() {
            let line = raw.trim();
            if !line.is_empty() && !is_warning_noise(line) && !is_ovh_debug_line(line) {
                error_lines.insert(0, line.to_string());
                if error_lines.len() >= 3 {
                    break;
                }
            }
        }
    }

    if error_lines.is_empty() {
        stderr.to_string()
    } else {
        error_lines.join("\n")
    }
}

/// Extract the real error trailing an OVH debug block, if any.
fn extract_ovh_error(stderr: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)failed to [^:]+: (.+)").unwrap(),
            Regex::new(r"(?im)error[:\s]+(.+)").unwrap(),
            Regex::new(r"(?m)(?:^|\n)([A-Z][^{}\n]+(?:not found|denied|failed|invalid|missing)[^{}\n]*)").unwrap(),
        ]
    });
    for re in patterns {
        if let Some(m) = re.find(stderr) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

/// Detect errors in stderr even when the return code is 0.
/// Returns `(has_error, error_message)` — only explicit error keywords flag
/// an error; OVH debug-only output is benign.
pub fn detect_errors_in_stderr(stderr: &str) -> (bool, Option<String>) {
    if stderr.trim().is_empty() {
        return (false, None);
    }
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("final parameters:") {
        if let Some(err) = extract_ovh_error(stderr) {
            return (true, Some(err));
        }
        return (false, None);
    }

    if lower.contains("error:") || lower.contains("fatal:") {
        return (true, Some(stderr.trim().to_string()));
    }

    (false, None)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── ANSI / truncation ─────────────────────────────────────────────────────

    #[test]
    fn strip_ansi_removes_color_codes() {
        let s = "\x1b[31mred\x1b[0m plain\0";
        assert_eq!(strip_ansi(s), "red plain");
    }

    #[test]
    fn short_output_passes_through() {
        assert_eq!(sanitize_command_output("hello", 100), "hello");
    }

    #[test]
    fn oversized_output_gets_truncation_marker() {
        let big = "x".repeat(200);
        let out = sanitize_command_output(&big, 100);
        assert!(out.contains("truncated from 200 bytes to 100 bytes"));
        assert!(out.len() < big.len() + 80);
    }

    #[test]
    fn no_truncate_variant_keeps_everything() {
        let big = "y".repeat(OUTPUT_TRUNCATE_LIMIT * 2);
        assert_eq!(sanitize_no_truncate(&big).len(), big.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = format!("{}é", "a".repeat(99));
        // Cutting at byte 100 would split the 2-byte é.
        let out = sanitize_command_output(&s, 100);
        assert!(out.starts_with(&"a".repeat(99)));
    }

    // ── JSON field truncation ─────────────────────────────────────────────────

    #[test]
    fn json_structure_survives_field_truncation() {
        let v = json!({
            "small": "ok",
            "big": "z".repeat(50),
            "nested": { "also_big": "w".repeat(50) },
            "list": ["v".repeat(50)],
            "num": 42,
        });
        let out = truncate_json_fields(&v, 10);
        assert_eq!(out["small"], "ok");
        assert!(out["big"].as_str().unwrap().contains("[field truncated]"));
        assert!(out["nested"]["also_big"].as_str().unwrap().contains("[field truncated]"));
        assert!(out["list"][0].as_str().unwrap().contains("[field truncated]"));
        assert_eq!(out["num"], 42);
    }

    #[test]
    fn socket_sanitiser_parses_embedded_json() {
        let payload = Value::String(r#"{"success":true,"chat_output":"done"}"#.into());
        let out = sanitize_for_socket(&payload);
        assert_eq!(out["success"], true);
    }

    #[test]
    fn socket_sanitiser_round_trips() {
        let v = json!({"a": 1, "b": ["x", {"c": true}]});
        let out = sanitize_for_socket(&v);
        let encoded = serde_json::to_string(&out).unwrap();
        let back: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, out);
    }

    // ── stderr heuristics ─────────────────────────────────────────────────────

    #[test]
    fn filter_keeps_errors_drops_warnings() {
        let stderr = "WARNING: something deprecated\nERROR: quota exceeded\nAs of Cloud SDK 420 this changed";
        let out = filter_error_messages(stderr);
        assert!(out.contains("ERROR: quota exceeded"));
        assert!(!out.contains("WARNING"));
        assert!(!out.contains("Cloud SDK"));
    }

    #[test]
    fn filter_falls_back_to_trailing_lines() {
        let stderr = "doing things\nmore progress\nsomething unexpected happened here";
        let out = filter_error_messages(stderr);
        assert!(out.contains("something unexpected happened here"));
    }

    #[test]
    fn detect_flags_explicit_error_tokens() {
        let (has, msg) = detect_errors_in_stderr("error: permission denied on project");
        assert!(has);
        assert!(msg.unwrap().contains("permission denied"));
    }

    #[test]
    fn detect_ignores_benign_stderr() {
        let (has, _) = detect_errors_in_stderr("Deleted [https://compute.googleapis.com/instance/x]");
        assert!(!has);
    }

    #[test]
    fn ovh_debug_block_alone_is_benign() {
        let stderr = "2025/12/09 21:42:06 Final parameters:\n{\n  \"flavor\": \"b2-7\"\n}\n";
        let (has, _) = detect_errors_in_stderr(stderr);
        assert!(!has);
    }

    #[test]
    fn ovh_debug_block_with_trailing_failure_is_an_error() {
        let stderr = "2025/12/09 21:42:06 Final parameters:\n{\n  \"flavor\": \"b2-7\"\n}\nfailed to create instance: quota exceeded";
        let (has, msg) = detect_errors_in_stderr(stderr);
        assert!(has);
        assert!(msg.unwrap().contains("quota exceeded"));
    }

    #[test]
    fn filter_skips_ovh_debug_lines() {
        let stderr = "2025/12/09 21:42:06 Final parameters:\n{\n\"billingPeriod\": \"hourly\"\n}\nERROR: real problem";
        let out = filter_error_messages(stderr);
        assert_eq!(out, "ERROR: real problem");
    }
}
