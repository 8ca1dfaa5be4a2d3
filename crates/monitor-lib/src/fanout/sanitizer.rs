//! Redaction of secrets in log events before they leave the process

use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::OnceLock;

use super::LogEvent;

pub const REDACTED: &str = "[REDACTED]";

static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn patterns() -> &'static [Regex] {
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)(?:api[_-]?key|apikey|secret|password|token)\s*[:=]\s*['"]?[^\s'"]+"#,
            r#"(?i)authorization\s*[:=]\s*['"]?.+"#,
            r#"(?i)bearer\s+[^\s'"]+"#,
            r"sk-[a-zA-Z0-9]{20,}",
            r"ghp_[a-zA-Z0-9]{36}",
            r"eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]*",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static redaction pattern"))
        .collect()
    })
}

/// Replace every secret-looking substring with `[REDACTED]`
pub fn sanitize_str(content: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(content);
    for pattern in patterns() {
        let replaced = match pattern.replace_all(&result, REDACTED) {
            Cow::Owned(s) => Some(s),
            Cow::Borrowed(_) => None,
        };
        if let Some(s) = replaced {
            result = Cow::Owned(s);
        }
    }
    result
}

/// Sanitize every string inside `value`, recursing into arrays and objects
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(s).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Sanitized copy of `event`; the input is left untouched
pub fn sanitize_event(event: &LogEvent) -> LogEvent {
    LogEvent {
        timestamp: sanitize_str(&event.timestamp).into_owned(),
        fields: event
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), sanitize_value(v)))
            .collect(),
    }
}
