//! Lifecycle events emitted to session subscribers

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

use crate::types::Page;

/// Higher-level events produced by a remote debugging session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The targeted application reported a new page listing.
    #[serde(rename_all = "camelCase")]
    PageChanged {
        /// Application id with any `PID:` prefix stripped.
        app_id: String,
        pages: Vec<Page>,
    },
    /// The last application went away or the transport closed.
    Disconnected,
}

/// A `Timeline.eventRecorded` record forwarded to a timeline listener.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRecord {
    pub received_at: DateTime<Local>,
    pub record: Value,
}

impl TimelineRecord {
    pub fn new(record: Value) -> Self {
        Self {
            received_at: Local::now(),
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_changed_serializes_camel_case() {
        let event = SessionEvent::PageChanged {
            app_id: "42".to_string(),
            pages: vec![Page::new("1", "x", "http://x")],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "pageChanged");
        assert_eq!(value["appId"], "42");
        assert_eq!(value["pages"][0]["isKey"], false);
    }

    #[test]
    fn test_disconnected_serializes_tag_only() {
        let value = serde_json::to_value(SessionEvent::Disconnected).unwrap();
        assert_eq!(value, json!({ "event": "disconnected" }));
    }

    #[test]
    fn test_timeline_record_keeps_payload() {
        let record = TimelineRecord::new(json!({ "type": "Layout" }));
        assert_eq!(record.record["type"], "Layout");
    }
}
