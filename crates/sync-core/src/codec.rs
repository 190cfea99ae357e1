//! JSON envelope encoding for push-channel frames.

use serde_json::Value;
use thiserror::Error;

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{ChannelEvent, OutboundFrame},
};

/// Envelope types this client decodes into typed variants.
const KNOWN_TYPES: &[&str] = &[
    "connected",
    "conversation_updated",
    "conversation_escalated",
    "stats_updated",
    "message",
    "typing",
    "status",
    "handoff",
    "error",
    "ping",
    "pong",
];

/// Errors produced while decoding or encoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("invalid `{kind}` frame: {reason}")]
    InvalidBody { kind: String, reason: String },
    #[error("failed to encode outbound frame: {0}")]
    Encode(String),
}

impl From<FrameError> for SyncError {
    fn from(err: FrameError) -> Self {
        let code = match err {
            FrameError::Encode(_) => "frame_encode_error",
            _ => "frame_decode_error",
        };
        SyncError::new(SyncErrorCategory::Serialization, code, err.to_string())
    }
}

/// Decode one inbound text frame.
///
/// Envelopes with an unknown `type` decode to [`ChannelEvent::Unrecognized`]
/// so observers still see them.
pub fn decode_frame(text: &str) -> Result<ChannelEvent, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::InvalidJson(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_owned();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(ChannelEvent::Unrecognized {
            kind,
            payload: value,
        });
    }

    serde_json::from_value(value).map_err(|err| FrameError::InvalidBody {
        kind,
        reason: err.to_string(),
    })
}

/// Encode one outbound frame as JSON text.
pub fn encode_frame(frame: &OutboundFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationStatus, MessageRole};

    #[test]
    fn decodes_dashboard_update_frame() {
        let event = decode_frame(
            r#"{"type":"conversation_updated","conversation":{
                "id":"c1","agent_id":"a1","channel":"web","status":"NEEDS_HUMAN",
                "created_at":"2026-01-05T10:00:00Z","updated_at":"2026-01-05T10:05:00Z"}}"#,
        )
        .expect("frame should decode");

        match event {
            ChannelEvent::ConversationUpdated { conversation } => {
                assert_eq!(conversation.id, "c1");
                assert_eq!(conversation.status, ConversationStatus::NeedsHuman);
                assert_eq!(conversation.external_user_name, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_chat_message_frame_with_optional_fields_missing() {
        let event = decode_frame(r#"{"type":"message","role":"agent","content":"hello"}"#)
            .expect("frame should decode");
        match event {
            ChannelEvent::MessageAdded(added) => {
                assert_eq!(added.role, MessageRole::Agent);
                assert_eq!(added.id, None);
                assert_eq!(added.client_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unit_frames_ignore_extra_fields() {
        assert_eq!(
            decode_frame(r#"{"type":"ping","ts":1}"#).expect("ping"),
            ChannelEvent::Ping
        );
        assert_eq!(
            decode_frame(r#"{"type":"typing","role":"agent"}"#).expect("typing"),
            ChannelEvent::Typing
        );
    }

    #[test]
    fn unknown_types_are_forwarded_as_unrecognized() {
        let event = decode_frame(r#"{"type":"presence","online":3}"#).expect("decode");
        match event {
            ChannelEvent::Unrecognized { kind, payload } => {
                assert_eq!(kind, "presence");
                assert_eq!(payload["online"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            decode_frame("not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert_eq!(decode_frame(r#"{"kind":"ping"}"#), Err(FrameError::MissingType));
        assert!(matches!(
            decode_frame(r#"{"type":"conversation_updated"}"#),
            Err(FrameError::InvalidBody { kind, .. }) if kind == "conversation_updated"
        ));
    }

    #[test]
    fn encodes_pong_as_bare_envelope() {
        assert_eq!(
            encode_frame(&OutboundFrame::Pong).expect("encode"),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn decode_errors_map_to_serialization_category() {
        let err: SyncError = FrameError::MissingType.into();
        assert_eq!(err.category, SyncErrorCategory::Serialization);
        assert_eq!(err.code, "frame_decode_error");
    }
}
