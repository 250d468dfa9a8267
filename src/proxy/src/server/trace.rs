//! Per-statement tracing, surfaced as a synthetic warning.
//!
//! When tracing is on, the router records a small span tree around each
//! forwarded command and appends it to the statement's warning list as
//! `("Note", 4600, <json>)`; `SHOW WARNINGS` returns it as the final row.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

/// Warning code of the router's trace note.
pub const TRACE_WARNING_CODE: u16 = 4600;

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl TraceEvent {
    pub fn new(name: &'static str) -> Self {
        let now = Utc::now();
        Self {
            name,
            start: now,
            end: now,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn finish(&mut self) {
        self.end = Utc::now();
    }

    pub fn attr(&mut self, key: &str, value: serde_json::Value) {
        self.attributes.insert(key.to_string(), value);
    }
}

/// One traced command, from classification to the last response byte.
#[derive(Debug, Clone)]
pub struct CommandTrace {
    start: DateTime<Utc>,
    events: Vec<TraceEvent>,
    sharing_blocked: bool,
    remote_connected: bool,
    failed: bool,
}

impl CommandTrace {
    pub fn start() -> Self {
        Self {
            start: Utc::now(),
            events: Vec::new(),
            sharing_blocked: false,
            remote_connected: false,
            failed: false,
        }
    }

    pub fn push_event(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn set_sharing_blocked(&mut self, blocked: bool) {
        self.sharing_blocked = blocked;
    }

    pub fn set_remote_connected(&mut self, connected: bool) {
        self.remote_connected = connected;
    }

    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    /// Render the finished span as the JSON document the warning row
    /// carries.
    pub fn to_json(&self) -> String {
        let end = Utc::now();
        let events: Vec<serde_json::Value> = self
            .events
            .iter()
            .map(|event| {
                json!({
                    "name": event.name,
                    "timestamp": event.start.to_rfc3339_opts(SecondsFormat::Micros, true),
                    "end_timestamp": event.end.to_rfc3339_opts(SecondsFormat::Micros, true),
                    "attributes": event.attributes,
                })
            })
            .collect();

        json!({
            "name": "mysql/query",
            "status_code": if self.failed { "ERROR" } else { "OK" },
            "start_time": self.start.to_rfc3339_opts(SecondsFormat::Micros, true),
            "end_time": end.to_rfc3339_opts(SecondsFormat::Micros, true),
            "events": events,
            "attributes": {
                "mysql.sharing_blocked": self.sharing_blocked,
                "mysql.remote.is_connected": self.remote_connected,
            },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_json_shape() {
        let mut trace = CommandTrace::start();
        let mut classify = TraceEvent::new("mysql/query_classify");
        classify.attr("mysql.query.classification", json!("read"));
        classify.finish();
        trace.push_event(classify);

        let mut forward = TraceEvent::new("mysql/connect_and_forward");
        forward.finish();
        trace.push_event(forward);
        trace.set_remote_connected(true);

        let doc: serde_json::Value = serde_json::from_str(&trace.to_json()).unwrap();
        assert_eq!(doc["name"], "mysql/query");
        assert_eq!(doc["status_code"], "OK");
        assert_eq!(doc["events"][0]["name"], "mysql/query_classify");
        assert_eq!(doc["events"][1]["name"], "mysql/connect_and_forward");
        assert_eq!(doc["attributes"]["mysql.sharing_blocked"], false);
        assert_eq!(doc["attributes"]["mysql.remote.is_connected"], true);
        assert!(doc["start_time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn failed_command_reports_error_status() {
        let mut trace = CommandTrace::start();
        trace.set_failed();
        let doc: serde_json::Value = serde_json::from_str(&trace.to_json()).unwrap();
        assert_eq!(doc["status_code"], "ERROR");
    }
}
