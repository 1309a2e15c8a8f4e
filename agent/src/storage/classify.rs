//! Connectivity error triage
//!
//! Best-effort: backend errors carry no reliable taxonomy, so a message is
//! treated as a lost connection when it mentions any of the markers below.
//! A data-level error whose text happens to contain a marker is
//! misclassified; that is accepted.

const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "enotfound",
    "not found",
    "timeout",
    "timed out",
    "socket",
    "terminated",
    "broken pipe",
    "no active connection",
    "connect",
];

/// Whether `message` looks like a lost connection rather than a rejected operation.
pub fn is_connection_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
