use crate::remote::RemoteErrorKind;
use once_cell::sync::Lazy;
use regex::Regex;

static RESOURCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)resource[\s_-]*exhausted").expect("valid regex"),
        Regex::new(r"(?i)rate[\s_-]*limit").expect("valid regex"),
        Regex::new(r"(?i)too many requests").expect("valid regex"),
        Regex::new(r"(?i)\bquota\b").expect("valid regex"),
        Regex::new(r"(?i)\b429\b").expect("valid regex"),
    ]
});

static CONNECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)failed to fetch").expect("valid regex"),
        Regex::new(r"(?i)connection (refused|reset|closed|aborted)").expect("valid regex"),
        Regex::new(r"(?i)\bnetwork\b").expect("valid regex"),
        Regex::new(r"(?i)timed?\s*out|timeout").expect("valid regex"),
        Regex::new(r"(?i)\bdns\b").expect("valid regex"),
        Regex::new(r"(?i)\b5\d\d\b").expect("valid regex"),
    ]
});

/// Maps an HTTP-equivalent status to an error kind.
pub fn classify_status(status: u16) -> RemoteErrorKind {
    match status {
        429 => RemoteErrorKind::ResourceExhausted,
        408 | 500..=599 => RemoteErrorKind::ConnectionError,
        _ => RemoteErrorKind::RemoteRejected,
    }
}

/// Maps a structured backend error code, when the backend provides one.
pub fn classify_code(code: &str) -> Option<RemoteErrorKind> {
    match code.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "resource-exhausted" | "rate-limited" | "too-many-requests" => Some(RemoteErrorKind::ResourceExhausted),
        "unavailable" | "deadline-exceeded" | "connection-error" | "timeout" => Some(RemoteErrorKind::ConnectionError),
        "network-unavailable" | "offline" => Some(RemoteErrorKind::NetworkUnavailable),
        "invalid-argument" | "already-exists" | "failed-precondition" | "permission-denied" | "not-found"
        | "unauthenticated" | "conflict" => Some(RemoteErrorKind::RemoteRejected),
        _ => None,
    }
}

/// Last-resort classification by message text.
///
/// Only used when a failure carries neither a status nor a structured code.
pub fn classify_message(message: &str) -> RemoteErrorKind {
    let kind = if RESOURCE_PATTERNS.iter().any(|pattern| pattern.is_match(message)) {
        RemoteErrorKind::ResourceExhausted
    } else if CONNECTION_PATTERNS.iter().any(|pattern| pattern.is_match(message)) {
        RemoteErrorKind::ConnectionError
    } else {
        RemoteErrorKind::RemoteRejected
    };
    tracing::debug!(fallback = true, kind = kind.as_str(), message = %message, "classified error by message text");
    kind
}

/// Structured signals first (code, then status), message text last.
pub fn classify(status: Option<u16>, code: Option<&str>, message: &str) -> RemoteErrorKind {
    if let Some(kind) = code.and_then(classify_code) {
        return kind;
    }
    if let Some(status) = status {
        return classify_status(status);
    }
    classify_message(message)
}
