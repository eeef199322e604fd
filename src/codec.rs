//! Signaling message codec
//!
//! Encodes and decodes the JSON envelope exchanged with the signaling
//! server: `{"type": "<discriminator>", "data": {...}}`. Audio payloads are
//! base64 text inside the envelope so the whole message stays text-safe on
//! the wire. This is a pure, stateless transform; decoding returns a typed
//! error for malformed input so the channel can log-and-drop instead of
//! crashing.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// Codec errors for inbound wire messages
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no type field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("data field is not an object")]
    MalformedData,

    #[error("missing payload field: {0}")]
    MissingField(&'static str),

    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Wire message discriminators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Register,
    Ready,
    CallRequest,
    CallAccepted,
    CallRejected,
    CallEnded,
    AudioData,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Ready => "ready",
            MessageType::CallRequest => "call-request",
            MessageType::CallAccepted => "call-accepted",
            MessageType::CallRejected => "call-rejected",
            MessageType::CallEnded => "call-ended",
            MessageType::AudioData => "audio-data",
            MessageType::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "register" => MessageType::Register,
            "ready" => MessageType::Ready,
            "call-request" => MessageType::CallRequest,
            "call-accepted" => MessageType::CallAccepted,
            "call-rejected" => MessageType::CallRejected,
            "call-ended" => MessageType::CallEnded,
            "audio-data" => MessageType::AudioData,
            "error" => MessageType::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signaling message: a type discriminator plus a key/value payload.
///
/// Constructed once and never mutated after send.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    kind: MessageType,
    data: Map<String, Value>,
}

impl SignalingMessage {
    pub fn new(kind: MessageType, data: Map<String, Value>) -> Self {
        Self { kind, data }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// `register` — announce this user to the server
    pub fn register(user_id: &str, role: &str) -> Self {
        let mut data = Map::new();
        data.insert("userId".into(), Value::String(user_id.to_string()));
        data.insert("role".into(), Value::String(role.to_string()));
        Self::new(MessageType::Register, data)
    }

    /// `call-request` — ask to call a peer
    pub fn call_request(to: &str) -> Self {
        let mut data = Map::new();
        data.insert("to".into(), Value::String(to.to_string()));
        Self::new(MessageType::CallRequest, data)
    }

    /// `call-accepted` — answer an incoming request
    pub fn call_accepted(to: &str) -> Self {
        let mut data = Map::new();
        data.insert("to".into(), Value::String(to.to_string()));
        Self::new(MessageType::CallAccepted, data)
    }

    /// `call-rejected` — decline a request, optionally with a reason
    pub fn call_rejected(to: &str, reason: Option<&str>) -> Self {
        let mut data = Map::new();
        data.insert("to".into(), Value::String(to.to_string()));
        if let Some(reason) = reason {
            data.insert("reason".into(), Value::String(reason.to_string()));
        }
        Self::new(MessageType::CallRejected, data)
    }

    /// `call-ended` — tear down an established or pending call
    pub fn call_ended(to: &str) -> Self {
        let mut data = Map::new();
        data.insert("to".into(), Value::String(to.to_string()));
        Self::new(MessageType::CallEnded, data)
    }

    /// `audio-data` — one captured PCM frame, base64-encoded
    pub fn audio_data(to: &str, frame: &[u8], sample_rate: u32, channels: u16) -> Self {
        let mut data = Map::new();
        data.insert("to".into(), Value::String(to.to_string()));
        data.insert("data".into(), Value::String(BASE64.encode(frame)));
        data.insert("sampleRate".into(), Value::Number(sample_rate.into()));
        data.insert("channels".into(), Value::Number(channels.into()));
        Self::new(MessageType::AudioData, data)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Sender peer id, where present
    pub fn from_user(&self) -> Option<&str> {
        self.str_field("from")
    }

    /// Target peer id, where present
    pub fn to_user(&self) -> Option<&str> {
        self.str_field("to")
    }

    /// Peer id regardless of direction: `from` on inbound, `to` on outbound
    pub fn peer(&self) -> Option<&str> {
        self.from_user().or_else(|| self.to_user())
    }

    /// Rejection reason, where present
    pub fn reason(&self) -> Option<&str> {
        self.str_field("reason")
    }

    /// Server error text, where present
    pub fn error_message(&self) -> Option<&str> {
        self.str_field("message")
    }

    /// Declared sample rate of an `audio-data` payload
    pub fn sample_rate(&self) -> Option<u32> {
        self.data
            .get("sampleRate")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Declared channel count of an `audio-data` payload
    pub fn channels(&self) -> Option<u16> {
        self.data
            .get("channels")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Decode the base64 PCM payload of an `audio-data` message
    pub fn audio_payload(&self) -> Result<Bytes, DecodeError> {
        let encoded = self
            .str_field("data")
            .ok_or(DecodeError::MissingField("data"))?;
        Ok(Bytes::from(BASE64.decode(encoded)?))
    }
}

/// Stateless encoder/decoder for [`SignalingMessage`]
pub struct SignalingCodec;

impl SignalingCodec {
    /// Serialize a message to its wire form
    pub fn encode(message: &SignalingMessage) -> String {
        let mut root = Map::new();
        root.insert(
            "type".into(),
            Value::String(message.kind.as_str().to_string()),
        );
        root.insert("data".into(), Value::Object(message.data.clone()));
        Value::Object(root).to_string()
    }

    /// Parse a wire message. Never panics; malformed input yields a typed
    /// error the caller can log and drop.
    pub fn decode(text: &str) -> Result<SignalingMessage, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let root = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let kind = root
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind =
            MessageType::parse(kind).ok_or_else(|| DecodeError::UnknownType(kind.to_string()))?;

        // A missing data field is treated as an empty payload, matching the
        // server's hand-written messages like `ready`.
        let data = match root.get("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(DecodeError::MalformedData),
        };

        Ok(SignalingMessage::new(kind, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_constructible_message() {
        let frame = vec![0u8, 1, 2, 3, 250, 251];
        let messages = vec![
            SignalingMessage::register("seller-1", "seller"),
            SignalingMessage::call_request("buyer-7"),
            SignalingMessage::call_accepted("buyer-7"),
            SignalingMessage::call_rejected("buyer-7", Some("busy")),
            SignalingMessage::call_rejected("buyer-7", None),
            SignalingMessage::call_ended("buyer-7"),
            SignalingMessage::audio_data("buyer-7", &frame, 44_100, 1),
        ];

        for message in messages {
            let wire = SignalingCodec::encode(&message);
            let decoded = SignalingCodec::decode(&wire).unwrap();
            assert_eq!(decoded, message, "round trip failed for {}", message.kind());
        }
    }

    #[test]
    fn audio_payload_survives_transport_encoding() {
        let frame: Vec<u8> = (0..=255).collect();
        let message = SignalingMessage::audio_data("buyer-7", &frame, 8000, 1);

        let wire = SignalingCodec::encode(&message);
        // The envelope must stay pure text
        assert!(wire.is_ascii());

        let decoded = SignalingCodec::decode(&wire).unwrap();
        assert_eq!(decoded.audio_payload().unwrap().as_ref(), &frame[..]);
        assert_eq!(decoded.sample_rate(), Some(8000));
        assert_eq!(decoded.channels(), Some(1));
    }

    #[test]
    fn decode_rejects_malformed_input_without_panicking() {
        assert!(matches!(
            SignalingCodec::decode("not json at all"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            SignalingCodec::decode("[1, 2, 3]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            SignalingCodec::decode(r#"{"data": {}}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            SignalingCodec::decode(r#"{"type": "teleport"}"#),
            Err(DecodeError::UnknownType(_))
        ));
        assert!(matches!(
            SignalingCodec::decode(r#"{"type": "ready", "data": 42}"#),
            Err(DecodeError::MalformedData)
        ));
    }

    #[test]
    fn missing_data_decodes_as_empty_payload() {
        let decoded = SignalingCodec::decode(r#"{"type": "ready"}"#).unwrap();
        assert_eq!(decoded.kind(), MessageType::Ready);
        assert!(decoded.data().is_empty());
    }

    #[test]
    fn inbound_fields_are_readable() {
        let decoded = SignalingCodec::decode(
            r#"{"type": "call-rejected", "data": {"from": "buyer-7", "reason": "busy"}}"#,
        )
        .unwrap();
        assert_eq!(decoded.from_user(), Some("buyer-7"));
        assert_eq!(decoded.peer(), Some("buyer-7"));
        assert_eq!(decoded.reason(), Some("busy"));
    }

    #[test]
    fn corrupt_base64_payload_is_a_typed_error() {
        let decoded = SignalingCodec::decode(
            r#"{"type": "audio-data", "data": {"to": "x", "data": "!!not-base64!!"}}"#,
        )
        .unwrap();
        assert!(matches!(
            decoded.audio_payload(),
            Err(DecodeError::Base64(_))
        ));
    }
}
