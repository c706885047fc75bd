// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Network-error classification and retry backoff for model calls.
//!
//! The agent retries a failed completion up to three times, but only for
//! transport-level failures: a 4xx from the vendor is a real error and
//! retrying would just repeat it.

use std::time::Duration;

/// Return true when the error string describes a network-class failure that
/// is worth retrying: connection reset, incomplete chunked read, remote
/// protocol violation, timeout.
pub fn is_network_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    const NETWORK_MARKERS: &[&str] = &[
        "ReadError",
        "ConnectError",
        "Timeout",
        "timed out",
        "RemoteProtocolError",
        "incomplete chunked read",
        "peer closed connection",
        "connection reset",
        "error sending request",
    ];
    NETWORK_MARKERS.iter().any(|kw| msg.contains(kw))
}

/// Backoff before retry attempt `k` (0-based): 2·(k+1) seconds.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(2 * (attempt as u64 + 1))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_keywords_are_retryable() {
        for msg in [
            "httpx.ReadError: connection dropped",
            "ConnectError: dns failure",
            "operation timed out",
            "RemoteProtocolError: peer closed connection without sending complete message body (incomplete chunked read)",
            "connection reset by peer",
        ] {
            assert!(
                is_network_error(&anyhow::anyhow!("{msg}")),
                "expected retryable: {msg}"
            );
        }
    }

    #[test]
    fn api_errors_are_not_retryable() {
        for msg in [
            "anthropic error 400: invalid tool schema",
            "openrouter error 401: bad key",
            "model not found",
        ] {
            assert!(
                !is_network_error(&anyhow::anyhow!("{msg}")),
                "expected non-retryable: {msg}"
            );
        }
    }

    #[test]
    fn backoff_grows_linearly() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(6));
    }
}
