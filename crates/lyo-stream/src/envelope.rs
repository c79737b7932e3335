//! JSON envelope carried in text frames
//!
//! `{"type": "...", "data": {...}, "timestamp": "2026-01-01T00:00:00Z"}`.
//! Unknown `type` strings are kept as [`EventKind::Custom`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::Frame;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    FeedUpdate,
    CourseProgress,
    Notification,
    UserActivity,
    LiveChat,
    SystemAnnouncement,
    Connection,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::FeedUpdate => "feed_update",
            EventKind::CourseProgress => "course_progress",
            EventKind::Notification => "notification",
            EventKind::UserActivity => "user_activity",
            EventKind::LiveChat => "live_chat",
            EventKind::SystemAnnouncement => "system_announcement",
            EventKind::Connection => "connection",
            EventKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for EventKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "feed_update" => EventKind::FeedUpdate,
            "course_progress" => EventKind::CourseProgress,
            "notification" => EventKind::Notification,
            "user_activity" => EventKind::UserActivity,
            "live_chat" => EventKind::LiveChat,
            "system_announcement" => EventKind::SystemAnnouncement,
            "connection" => EventKind::Connection,
            _ => EventKind::Custom(kind),
        }
    }
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        EventKind::from(kind.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Envelope stamped with the current time.
    pub fn new(kind: impl Into<EventKind>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decode a text frame; binary frames and non-envelope text yield `None`.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Text(text) => Self::parse(text).ok(),
            Frame::Binary(_) => None,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kind_with_timestamp() {
        let envelope = Envelope::parse(
            r#"{"type":"course_progress","data":{"course_id":"c1","percent":40},"timestamp":"2026-03-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, EventKind::CourseProgress);
        assert_eq!(envelope.data["percent"], 40);
        assert_eq!(
            envelope.timestamp.unwrap().to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn unknown_kind_is_custom_and_round_trips_its_name() {
        let envelope = Envelope::parse(r#"{"type":"quiz_started"}"#).unwrap();
        assert_eq!(envelope.kind, EventKind::Custom("quiz_started".into()));
        assert!(envelope.data.is_null());
        assert!(envelope.timestamp.is_none());

        let json: serde_json::Value = serde_json::from_str(&envelope.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "quiz_started");
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn new_envelope_is_stamped() {
        let envelope = Envelope::new(EventKind::LiveChat, serde_json::json!({"text": "hi"}));
        let json: serde_json::Value = serde_json::from_str(&envelope.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "live_chat");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn only_text_frames_carry_envelopes() {
        let text = Frame::Text(r#"{"type":"notification","data":{}}"#.into());
        assert_eq!(
            Envelope::from_frame(&text).map(|e| e.kind),
            Some(EventKind::Notification)
        );
        assert!(Envelope::from_frame(&Frame::Text("plain".into())).is_none());
        assert!(Envelope::from_frame(&Frame::Binary(bytes::Bytes::from_static(b"{}"))).is_none());
    }
}
