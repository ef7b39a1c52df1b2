//! Shared primitive aliases, identifier rules and the epoch clock.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

/// Column name to scalar value mapping used for `values` and `where`.
pub type Row = Map<String, Value>;
/// Open key/value map carried by a request for downstream collaborators.
pub type Metadata = Map<String, Value>;
/// Globally unique request identifier.
pub type RequestId = String;
/// Identifier of the submitting client host.
pub type ClientId = String;

/// Longest identifier accepted for mailbox file names.
pub const MAX_IDENTIFIER_LEN: usize = 200;

/// Current wall-clock time as fractional epoch seconds.
///
/// Only used for diagnostics and retention; hosts are not assumed to agree.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Returns true for SQL identifiers the executor is willing to quote:
/// an ASCII letter or underscore followed by letters, digits or underscores.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true when `id` can be used verbatim as a mailbox file stem.
pub fn is_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Replaces every character that is not allowed in a request id with `-`
/// and caps the segment at 64 characters.
pub fn sanitize_id_part(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "anon".to_string()
    } else {
        cleaned
    }
}

/// Whether a JSON value can be bound as a single SQL parameter.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
