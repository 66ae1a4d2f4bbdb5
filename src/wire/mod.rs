//! Line-delimited JSON command/event protocol (spec.md §6).
//!
//! Replaces the teacher's WebSocket/IPC transport (`ws/mod.rs`) with a
//! stdin/stdout transport, but keeps the same shape: a tagged-union wire
//! schema, camelCase field names, and unknown fields tolerated on ingest.

mod command_reader;
mod event_writer;

pub use command_reader::CommandReader;
pub use event_writer::EventWriter;

/// The concrete transport this binary uses: one editor connection per
/// process. Boxed so tests can swap in an in-memory sink without making
/// every component that holds an `Events` generic over the writer type.
pub type Events = EventWriter<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>;

use serde::{Deserialize, Serialize};

use crate::error::StreamStopReason;

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandPayload {
    AddStream(AddStreamParams),
    RemoveStream(RemoveStreamParams),
    SwitchFile(SwitchFileParams),
    NextPreview(NextPreviewParams),
    Input(InputParams),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddStreamParams {
    pub file: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoveStreamParams {}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchFileParams {
    pub file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NextPreviewParams {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputParams {
    TouchDown { x: f64, y: f64 },
    TouchMove { x: f64, y: f64 },
    TouchUp { x: f64, y: f64 },
    Tap { x: f64, y: f64 },
    Swipe {
        #[serde(rename = "fromX")]
        from_x: f64,
        #[serde(rename = "fromY")]
        from_y: f64,
        #[serde(rename = "toX")]
        to_x: f64,
        #[serde(rename = "toY")]
        to_y: f64,
        #[serde(rename = "durationMs")]
        duration_ms: Option<u64>,
    },
    Text { value: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    StreamStatus(StreamStatus),
    StreamStarted(StreamStarted),
    StreamStopped(StreamStopped),
    Frame(Frame),
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Booting,
    Building,
    Installing,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStarted {
    #[serde(rename = "previewCount")]
    pub preview_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStopped {
    pub reason: StreamStopReasonWire,
    pub message: String,
    pub diagnostic: Option<String>,
}

/// Wraps [`StreamStopReason`] so it serializes bare (not nested) under
/// `streamStopped.reason`, matching spec.md §6 exactly.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(transparent)]
pub struct StreamStopReasonWire(pub StreamStopReason);

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub device: String,
    pub file: String,
    pub data: String,
}

impl Event {
    pub fn status(stream_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            stream_id: stream_id.into(),
            payload: EventPayload::StreamStatus(StreamStatus { phase }),
        }
    }

    pub fn started(stream_id: impl Into<String>, preview_count: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            payload: EventPayload::StreamStarted(StreamStarted { preview_count }),
        }
    }

    pub fn stopped(
        stream_id: impl Into<String>,
        reason: StreamStopReason,
        message: impl Into<String>,
        diagnostic: Option<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            payload: EventPayload::StreamStopped(StreamStopped {
                reason: StreamStopReasonWire(reason),
                message: message.into(),
                diagnostic,
            }),
        }
    }

    pub fn frame(stream_id: impl Into<String>, device: String, file: String, data: String) -> Self {
        Self {
            stream_id: stream_id.into(),
            payload: EventPayload::Frame(Frame { device, file, data }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_unknown_fields_are_ignored() {
        let json = r#"{"streamId":"s1","addStream":{"file":"/p/V.swift","deviceType":"DT","runtime":"RT","bogus":1}}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.stream_id, "s1");
        match cmd.payload {
            CommandPayload::AddStream(p) => assert_eq!(p.device_type, "DT"),
            _ => panic!("expected AddStream"),
        }
    }

    #[test]
    fn event_serializes_camel_case_tagged_union() {
        let event = Event::status("s1", Phase::Booting);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"streamId":"s1","streamStatus":{"phase":"booting"}}"#);
    }

    #[test]
    fn stopped_event_serializes_snake_case_reason() {
        let event = Event::stopped("s1", StreamStopReason::BuildError, "xcodebuild failed", None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""reason":"build_error""#));
    }
}
