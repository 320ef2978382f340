use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub const ROOT_LOGGER_PREFIX: &str = "maubot.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogEvent {
    #[serde(default, deserialize_with = "string_loose")]
    pub name: String,
    #[serde(default, deserialize_with = "string_loose")]
    pub levelname: String,
    #[serde(default, deserialize_with = "opt_string_loose")]
    pub time: Option<String>,
    #[serde(default, deserialize_with = "opt_string_loose")]
    pub msg: Option<String>,
    #[serde(default, deserialize_with = "opt_string_loose")]
    pub exc_info: Option<String>,
    #[serde(default, deserialize_with = "opt_http_request_loose")]
    pub matrix_http_request: Option<HttpRequestInfo>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestInfo {
    #[serde(default, deserialize_with = "string_loose")]
    pub method: String,
    #[serde(default, deserialize_with = "string_loose")]
    pub path: String,
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    AuthResult { success: bool },
    HistoryBatch(Vec<RawLogEvent>),
    SingleEvent(RawLogEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object: got {0}")]
    NotAnObject(String),
}

/// Classifies an inbound text frame by field presence: an `auth_success` key
/// marks the auth acknowledgment, a `history` key marks the backfill batch,
/// anything else is a single log record.
pub fn classify_frame(text: &str) -> Result<LogFrame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject(value_kind(&value).to_string()));
    }

    if let Some(flag) = value.get("auth_success") {
        return Ok(LogFrame::AuthResult {
            success: flag.as_bool().unwrap_or(false),
        });
    }

    if let Some(history) = value.get("history") {
        let batch = history
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        return Ok(LogFrame::HistoryBatch(batch));
    }

    let raw = serde_json::from_value(value).map_err(|err| FrameError::Malformed(err.to_string()))?;
    Ok(LogFrame::SingleEvent(raw))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub id: u64,
    pub time: Option<DateTime<FixedOffset>>,
    pub level: String,
    pub name: String,
    pub nav_target: Option<String>,
    pub message: Option<String>,
    pub http_request: Option<HttpRequestInfo>,
    pub exc_info: Option<String>,
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct Normalizer {
    next_id: u64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shapes a raw record into a display event. Never fails: a missing or
    /// unparseable field leaves the derived field empty.
    pub fn normalize(&mut self, raw: RawLogEvent) -> LogEvent {
        self.next_id += 1;
        let (name, nav_target) = derive_logger_name(&raw.name);
        LogEvent {
            id: self.next_id,
            time: raw.time.as_deref().and_then(parse_event_time),
            level: raw.levelname,
            name,
            nav_target,
            message: raw.msg,
            http_request: raw.matrix_http_request,
            exc_info: raw.exc_info,
            extra: raw.extra,
        }
    }

    pub fn normalize_batch(&mut self, batch: Vec<RawLogEvent>) -> Vec<LogEvent> {
        batch.into_iter().map(|raw| self.normalize(raw)).collect()
    }
}

/// Strips the root logger prefix and derives the navigation target. A
/// `client.` segment is removed from the display name; an `instance.` segment
/// stays in the display name. The two cases are mutually exclusive.
pub fn derive_logger_name(raw_name: &str) -> (String, Option<String>) {
    let stripped = raw_name.strip_prefix(ROOT_LOGGER_PREFIX).unwrap_or(raw_name);
    if let Some(id) = stripped.strip_prefix("client.") {
        return (id.to_string(), Some(format!("/client/{id}")));
    }
    if let Some(id) = stripped.strip_prefix("instance.") {
        return (stripped.to_string(), Some(format!("/instance/{id}")));
    }
    (stripped.to_string(), None)
}

pub fn parse_event_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
}

fn string_loose<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn opt_string_loose<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn opt_http_request_loose<'de, D>(deserializer: D) -> Result<Option<HttpRequestInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value::<HttpRequestInfo>(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn raw_event(name: &str, msg: &str) -> RawLogEvent {
        RawLogEvent {
            name: name.to_string(),
            levelname: "INFO".to_string(),
            time: Some("2023-05-01T12:30:45.123456+00:00".to_string()),
            msg: Some(msg.to_string()),
            exc_info: None,
            matrix_http_request: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn classify_auth_ack_by_field_presence() {
        let granted = classify_frame(r#"{"auth_success": true}"#).expect("classify");
        assert_eq!(granted, LogFrame::AuthResult { success: true });

        let denied = classify_frame(r#"{"auth_success": false}"#).expect("classify");
        assert_eq!(denied, LogFrame::AuthResult { success: false });
    }

    #[test]
    fn auth_flag_with_non_bool_value_reads_as_failure() {
        let frame = classify_frame(r#"{"auth_success": "yes"}"#).expect("classify");
        assert_eq!(frame, LogFrame::AuthResult { success: false });
    }

    #[test]
    fn classify_history_batch_preserves_order() {
        let frame = classify_frame(
            r#"{"history": [
                {"name": "maubot.init", "levelname": "INFO", "msg": "first"},
                {"name": "maubot.init", "levelname": "INFO", "msg": "second"}
            ]}"#,
        )
        .expect("classify");
        let LogFrame::HistoryBatch(batch) = frame else {
            panic!("expected history batch")
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].msg.as_deref(), Some("first"));
        assert_eq!(batch[1].msg.as_deref(), Some("second"));
    }

    #[test]
    fn history_drops_entries_that_are_not_objects() {
        let frame = classify_frame(r#"{"history": [{"msg": "kept"}, 42, "nope"]}"#)
            .expect("classify");
        let LogFrame::HistoryBatch(batch) = frame else {
            panic!("expected history batch")
        };
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].msg.as_deref(), Some("kept"));
    }

    #[test]
    fn classify_bare_object_as_single_event() {
        let frame = classify_frame(
            r#"{"name": "maubot.server", "levelname": "WARNING", "time": "2023-05-01T12:30:45+00:00", "msg": "slow"}"#,
        )
        .expect("classify");
        let LogFrame::SingleEvent(raw) = frame else {
            panic!("expected single event")
        };
        assert_eq!(raw.name, "maubot.server");
        assert_eq!(raw.levelname, "WARNING");
    }

    #[test]
    fn classify_rejects_non_json_text() {
        let err = classify_frame("not json at all").expect_err("should fail");
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn classify_rejects_non_object_payload() {
        let err = classify_frame("[1, 2, 3]").expect_err("should fail");
        assert_eq!(err, FrameError::NotAnObject("array".to_string()));
    }

    #[test]
    fn client_logger_strips_segment_and_derives_target() {
        let (name, target) = derive_logger_name("maubot.client.@bot:example.com");
        assert_eq!(name, "@bot:example.com");
        assert_eq!(target.as_deref(), Some("/client/@bot:example.com"));
    }

    #[test]
    fn instance_logger_keeps_segment_in_display_name() {
        let (name, target) = derive_logger_name("maubot.instance.myinstance");
        assert_eq!(name, "instance.myinstance");
        assert_eq!(target.as_deref(), Some("/instance/myinstance"));
    }

    #[test]
    fn unprefixed_logger_passes_through_without_target() {
        let (name, target) = derive_logger_name("aiohttp.access");
        assert_eq!(name, "aiohttp.access");
        assert_eq!(target, None);
    }

    #[test]
    fn normalize_parses_wire_timestamp() {
        let mut normalizer = Normalizer::new();
        let event = normalizer.normalize(raw_event("maubot.init", "ready"));
        let time = event.time.expect("parsed time");
        assert_eq!(time.hour(), 12);
        assert_eq!(time.minute(), 30);
        assert_eq!(time.second(), 45);
    }

    #[test]
    fn normalize_accepts_offset_without_colon() {
        let time = parse_event_time("2023-05-01T12:30:45.123456+0000").expect("parsed");
        assert_eq!(time.hour(), 12);
    }

    #[test]
    fn normalize_tolerates_missing_and_malformed_fields() {
        let frame = classify_frame(r#"{"time": "not a date", "name": 42}"#).expect("classify");
        let LogFrame::SingleEvent(raw) = frame else {
            panic!("expected single event")
        };
        let mut normalizer = Normalizer::new();
        let event = normalizer.normalize(raw);
        assert_eq!(event.time, None);
        assert_eq!(event.name, "42");
        assert_eq!(event.level, "");
        assert_eq!(event.message, None);
        assert_eq!(event.nav_target, None);
    }

    #[test]
    fn normalizer_assigns_monotonic_ids_across_batches() {
        let mut normalizer = Normalizer::new();
        let batch = normalizer.normalize_batch(vec![
            raw_event("maubot.init", "a"),
            raw_event("maubot.init", "b"),
        ]);
        let single = normalizer.normalize(raw_event("maubot.init", "c"));
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[1].id, 2);
        assert_eq!(single.id, 3);
    }

    #[test]
    fn unknown_fields_ride_in_extra() {
        let frame = classify_frame(
            r#"{"name": "maubot.client.x", "msg": "m", "lineno": 33, "module": "client"}"#,
        )
        .expect("classify");
        let LogFrame::SingleEvent(raw) = frame else {
            panic!("expected single event")
        };
        assert_eq!(raw.extra.get("lineno"), Some(&serde_json::json!(33)));
        assert_eq!(raw.extra.get("module"), Some(&serde_json::json!("client")));
    }

    #[test]
    fn http_request_event_parses_structured_payload() {
        let frame = classify_frame(
            r#"{"name": "maubot.server", "matrix_http_request": {"method": "GET", "path": "/version"}}"#,
        )
        .expect("classify");
        let LogFrame::SingleEvent(raw) = frame else {
            panic!("expected single event")
        };
        let request = raw.matrix_http_request.expect("request info");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/version");
        assert_eq!(request.content, None);
    }

    #[test]
    fn malformed_http_request_degrades_to_none() {
        let frame = classify_frame(r#"{"name": "maubot.server", "matrix_http_request": "zzz"}"#)
            .expect("classify");
        let LogFrame::SingleEvent(raw) = frame else {
            panic!("expected single event")
        };
        assert_eq!(raw.matrix_http_request, None);
    }
}
