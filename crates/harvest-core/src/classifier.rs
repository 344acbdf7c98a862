//! Maps raw transport results to [`Outcome`]s.
//!
//! This is a pure function: identical inputs always produce identical
//! outcomes, so the retry loop stays a flat state machine with no
//! exception-driven control flow.

use crate::outcome::{Outcome, TransportKind, TransportResult};

/// Literal markers the CDN embeds in anti-bot interstitials, matched
/// case-insensitively against the body.
const INTERSTITIAL_MARKERS: &[&str] = &[
    "just a moment",
    "error 1015",
    "error code: 1015",
    "rate limited",
];

/// Markers in transport fault text, checked in order.
const UNSUPPORTED_MARKERS: &[&str] = &["not supported"];
const CONNECT_MARKERS: &[&str] = &[
    "connection failed",
    "connection refused",
    "failed to connect",
    "dns error",
    "proxy connect",
];
const TLS_MARKERS: &[&str] = &["tls", "handshake", "certificate"];
const RESET_MARKERS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "incomplete message",
    "connection closed",
];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out"];

/// How much of an error body survives into the raw dump.
const SNIPPET_LIMIT: usize = 2048;

/// Classify a single fetch attempt.
pub fn classify(result: TransportResult) -> Outcome {
    match result {
        Err(fault) => classify_fault(&fault.message),
        Ok(resp) => {
            let lower = resp.body.to_lowercase();
            let interstitial = contains_any(&lower, INTERSTITIAL_MARKERS);
            match resp.status {
                200 if !interstitial && is_json_object(&resp.body) => Outcome::Success(resp.body),
                200 => Outcome::Blocked,
                429 => Outcome::RateLimited { status: 429 },
                403 if interstitial => Outcome::RateLimited { status: 403 },
                403 => Outcome::Blocked,
                status => Outcome::PermanentFailure {
                    status,
                    snippet: snippet(&resp.body),
                },
            }
        }
    }
}

fn classify_fault(message: &str) -> Outcome {
    let lower = message.to_lowercase();
    if contains_any(&lower, UNSUPPORTED_MARKERS) {
        Outcome::FingerprintUnsupported
    } else if contains_any(&lower, CONNECT_MARKERS) {
        Outcome::Transport(TransportKind::Connect)
    } else if contains_any(&lower, TLS_MARKERS) {
        Outcome::Transport(TransportKind::Tls)
    } else if contains_any(&lower, RESET_MARKERS) {
        Outcome::Transport(TransportKind::Reset)
    } else if contains_any(&lower, TIMEOUT_MARKERS) {
        Outcome::Timeout
    } else {
        Outcome::Transport(TransportKind::Other)
    }
}

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.contains(m))
}

/// Success requires the payload to be a JSON object; anything else that
/// slipped past the markers (HTML, plain text, JSON arrays) is not a record.
fn is_json_object(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .map(|v| v.is_object())
        .unwrap_or(false)
}

fn snippet(body: &str) -> String {
    if body.len() <= SNIPPET_LIMIT {
        return body.to_string();
    }
    let mut end = SNIPPET_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
