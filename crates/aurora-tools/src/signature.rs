// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic tool-call signatures.
//!
//! A signature pairs `tool_start` with `tool_result` events when the model
//! emits several calls in one step.  It must be stable across retries and
//! invariant under key-order permutation of the kwargs, so the payload is
//! serialised with recursively sorted keys before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Kwarg keys that carry injected context rather than model-chosen input.
/// They are excluded from signatures so a retry with refreshed context still
/// matches the original start event.
const CONTEXT_KEYS: &[&str] = &[
    "user_id",
    "session_id",
    "provider_preference",
    "timeout",
    "state",
];

/// Remove context keys from a kwargs object (non-objects pass through).
pub fn sanitize_kwargs(kwargs: &Value) -> Value {
    match kwargs {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !CONTEXT_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Serialise a JSON value with recursively sorted object keys.
pub fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// The raw signature string for a (tool, kwargs) pair.
pub fn tool_signature(tool_name: &str, kwargs: &Value) -> String {
    format!("{tool_name}_{}", canonical_json(&sanitize_kwargs(kwargs)))
}

/// The signature id used on the socket: `<tool>_<16 hex chars>`.
pub fn signature_id(tool_name: &str, kwargs: &Value) -> String {
    let sig = tool_signature(tool_name, kwargs);
    let digest = Sha256::digest(sig.as_bytes());
    format!("{tool_name}_{}", &hex::encode(digest)[..16])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Key-order invariance ──────────────────────────────────────────────────

    #[test]
    fn signature_invariant_under_key_order() {
        let a = json!({"provider": "gcp", "command": "compute instances list"});
        let b = json!({"command": "compute instances list", "provider": "gcp"});
        assert_eq!(signature_id("cloud_exec", &a), signature_id("cloud_exec", &b));
    }

    #[test]
    fn signature_invariant_for_nested_objects() {
        let a = json!({"vars": {"x": 1, "y": 2}, "action": "plan"});
        let b = json!({"action": "plan", "vars": {"y": 2, "x": 1}});
        assert_eq!(signature_id("iac_tool", &a), signature_id("iac_tool", &b));
    }

    #[test]
    fn different_kwargs_produce_different_ids() {
        let a = json!({"command": "a"});
        let b = json!({"command": "b"});
        assert_ne!(signature_id("cloud_exec", &a), signature_id("cloud_exec", &b));
    }

    #[test]
    fn different_tools_produce_different_ids() {
        let args = json!({"command": "a"});
        assert_ne!(signature_id("cloud_exec", &args), signature_id("iac_tool", &args));
    }

    // ── Context-key stripping ─────────────────────────────────────────────────

    #[test]
    fn context_keys_do_not_affect_signature() {
        let bare = json!({"command": "ls"});
        let ctxed = json!({"command": "ls", "user_id": "u1", "session_id": "s1", "timeout": 30});
        assert_eq!(
            signature_id("cloud_exec", &bare),
            signature_id("cloud_exec", &ctxed)
        );
    }

    // ── Format ────────────────────────────────────────────────────────────────

    #[test]
    fn id_is_tool_name_plus_16_hex() {
        let id = signature_id("cloud_exec", &json!({"command": "x"}));
        let suffix = id.strip_prefix("cloud_exec_").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let v = json!({"b": 1, "a": [ {"z": 0, "y": 1} ]});
        assert_eq!(canonical_json(&v), r#"{"a":[{"y":1,"z":0}],"b":1}"#);
    }

    #[test]
    fn arrays_preserve_order() {
        let a = json!({"list": [1, 2]});
        let b = json!({"list": [2, 1]});
        assert_ne!(signature_id("t", &a), signature_id("t", &b));
    }
}
