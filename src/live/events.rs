//! # Live Session Event Types
//!
//! Three layers of events flow through a live session:
//!
//! - [`RemoteEvent`]: what the streaming endpoint sent, after best-effort
//!   structural matching. Anything the matcher does not recognize lands in
//!   [`RemoteEvent::Unknown`] so it can be logged instead of lost.
//! - [`SessionEvent`]: what the session manager hands to its callback. Either a
//!   lifecycle status, a session-level error, or a remote event.
//! - [`ClientMessage`]: the normalized `{"type", "data"}` unit sent to the
//!   browser.
//!
//! The matcher accepts both the wire casing of the Live API (`serverContent`,
//! `modelTurn`, `inlineData`) and the snake_case casing SDKs expose
//! (`server_content`, `model_turn`, `audio_data`). Keeping every field probe in
//! this file means upstream schema drift touches one module.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An event received from the streaming endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Connection-level status such as `setup_complete` or `go_away`.
    Status(String),
    /// Error reported in-band by the endpoint.
    Error { code: Option<i64>, message: String },
    /// Model output and transcriptions.
    Content(ServerContent),
    /// A shape the matcher does not recognize.
    Unknown(Value),
}

/// Payload of a content event. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    /// Direct transcription of the user's speech.
    pub input_transcription: Option<String>,
    /// Recognition results in results/alternatives form.
    pub results: Vec<RecognitionResult>,
    /// Transcription of the model's spoken reply.
    pub output_transcription: Option<String>,
    /// Response parts in the order the endpoint sent them.
    pub parts: Vec<ResponsePart>,
    pub turn_complete: bool,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionResult {
    pub is_final: bool,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alternative {
    pub transcript: Option<String>,
}

/// One part of a model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    Audio {
        mime_type: Option<String>,
        data: Bytes,
    },
    /// An audio part whose payload could not be decoded.
    CorruptAudio(String),
    /// Anything else (tool calls, executable code, thoughts).
    Other,
}

/// Lifecycle status emitted by the session manager itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected { session_id: String },
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connected { .. } => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

/// What the session manager hands to its callback, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(SessionStatus),
    Error(String),
    Remote(RemoteEvent),
}

/// Normalized message sent to the browser: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Status(String),
    Error(String),
    InputTranscription(String),
    BotResponseText(String),
    /// Base64 text of the raw audio bytes.
    BotResponseAudio(String),
}

impl ClientMessage {
    pub fn audio(data: &[u8]) -> Self {
        ClientMessage::BotResponseAudio(STANDARD.encode(data))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Status(_) => "status",
            ClientMessage::Error(_) => "error",
            ClientMessage::InputTranscription(_) => "input_transcription",
            ClientMessage::BotResponseText(_) => "bot_response_text",
            ClientMessage::BotResponseAudio(_) => "bot_response_audio",
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a plain string payload, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"error","data":"failed to encode {} message"}}"#, self.kind())
        })
    }
}

/// Look a field up under its wire name first, then its snake_case name.
fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

fn flag(value: &Value, camel: &str, snake: &str) -> bool {
    field(value, camel, snake)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Transcriptions arrive either as `{"text": "..."}` or as a bare string.
fn transcription_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => value.get("text").and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
}

const CONTENT_KEYS: [(&str, &str); 5] = [
    ("modelTurn", "model_turn"),
    ("inputTranscription", "input_transcription"),
    ("outputTranscription", "output_transcription"),
    ("results", "results"),
    ("turnComplete", "turn_complete"),
];

impl RemoteEvent {
    /// Best-effort structural match of one decoded endpoint message.
    pub fn from_json(value: Value) -> RemoteEvent {
        if !value.is_object() {
            return RemoteEvent::Unknown(value);
        }

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            return RemoteEvent::Error { code, message };
        }

        if field(&value, "setupComplete", "setup_complete").is_some() {
            return RemoteEvent::Status("setup_complete".to_string());
        }

        if field(&value, "goAway", "go_away").is_some() {
            return RemoteEvent::Status("go_away".to_string());
        }

        let content_root = field(&value, "serverContent", "server_content").or_else(|| {
            CONTENT_KEYS
                .iter()
                .any(|(camel, snake)| field(&value, camel, snake).is_some())
                .then_some(&value)
        });

        match content_root {
            Some(root) if root.is_object() => RemoteEvent::Content(ServerContent::from_json(root)),
            _ => RemoteEvent::Unknown(value),
        }
    }
}

impl ServerContent {
    fn from_json(root: &Value) -> ServerContent {
        let input_transcription = field(root, "inputTranscription", "input_transcription")
            .and_then(transcription_text);
        let output_transcription = field(root, "outputTranscription", "output_transcription")
            .and_then(transcription_text);

        let results = root
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().map(RecognitionResult::from_json).collect())
            .unwrap_or_default();

        let parts = field(root, "modelTurn", "model_turn")
            .and_then(|turn| turn.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| parts.iter().map(ResponsePart::from_json).collect())
            .unwrap_or_default();

        ServerContent {
            input_transcription,
            results,
            output_transcription,
            parts,
            turn_complete: flag(root, "turnComplete", "turn_complete"),
            interrupted: flag(root, "interrupted", "interrupted"),
        }
    }
}

impl RecognitionResult {
    fn from_json(value: &Value) -> RecognitionResult {
        let alternatives = value
            .get("alternatives")
            .and_then(Value::as_array)
            .map(|alternatives| {
                alternatives
                    .iter()
                    .map(|alternative| Alternative {
                        transcript: alternative
                            .get("transcript")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                    })
                    .collect()
            })
            .unwrap_or_default();

        RecognitionResult {
            is_final: flag(value, "isFinal", "is_final"),
            alternatives,
        }
    }
}

impl ResponsePart {
    fn from_json(value: &Value) -> ResponsePart {
        if let Some(text) = value.get("text").and_then(Value::as_str) {
            return ResponsePart::Text(text.to_owned());
        }

        if let Some(inline) = field(value, "inlineData", "inline_data") {
            let mime_type = field(inline, "mimeType", "mime_type")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return match inline.get("data").map(decode_audio) {
                Some(Ok(data)) => ResponsePart::Audio { mime_type, data },
                Some(Err(reason)) => ResponsePart::CorruptAudio(reason),
                None => ResponsePart::CorruptAudio("inline data has no payload".to_string()),
            };
        }

        if let Some(raw) = field(value, "audioData", "audio_data") {
            return match decode_audio(raw) {
                Ok(data) => ResponsePart::Audio { mime_type: None, data },
                Err(reason) => ResponsePart::CorruptAudio(reason),
            };
        }

        ResponsePart::Other
    }
}

/// Audio payloads are base64 text on the wire; byte arrays are accepted too.
fn decode_audio(raw: &Value) -> Result<Bytes, String> {
    match raw {
        Value::String(encoded) => STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| format!("invalid base64 audio: {}", e)),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| format!("audio byte out of range: {}", item))
            })
            .collect::<Result<Vec<u8>, String>>()
            .map(Bytes::from),
        other => Err(format!("unsupported audio payload: {}", Shape(other))),
    }
}

/// Compact description of a JSON value's structure, without its data.
///
/// `{"serverContent":{"turnComplete":true}}` prints as
/// `{serverContent: {turnComplete: bool}}`.
pub struct Shape<'a>(pub &'a Value);

impl fmt::Display for Shape<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_shape(self.0, f, 0)
    }
}

fn write_shape(value: &Value, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(_) => write!(f, "bool"),
        Value::Number(_) => write!(f, "number"),
        Value::String(_) => write!(f, "string"),
        Value::Array(items) => {
            write!(f, "[")?;
            if let Some(first) = items.first() {
                write_shape(first, f, depth + 1)?;
                if items.len() > 1 {
                    write!(f, "; {}", items.len())?;
                }
            }
            write!(f, "]")
        }
        Value::Object(map) if depth >= 3 => write!(f, "{{..{} keys}}", map.len()),
        Value::Object(map) => {
            write!(f, "{{")?;
            for (i, (key, inner)) in map.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: ", key)?;
                write_shape(inner, f, depth + 1)?;
            }
            write!(f, "}}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let json = ClientMessage::Status("connected".to_string()).to_json();
        assert_eq!(json, r#"{"type":"status","data":"connected"}"#);

        let audio = ClientMessage::audio(&[0x00, 0x01]);
        assert_eq!(audio, ClientMessage::BotResponseAudio("AAE=".to_string()));
        assert_eq!(
            serde_json::to_value(&audio).unwrap(),
            json!({"type": "bot_response_audio", "data": "AAE="})
        );
    }

    #[test]
    fn test_matches_live_api_casing() {
        let event = RemoteEvent::from_json(json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"text": "Hola"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAE="}}
                ]},
                "inputTranscription": {"text": "hello"},
                "turnComplete": true
            }
        }));

        let RemoteEvent::Content(content) = event else {
            panic!("expected content event");
        };
        assert_eq!(content.input_transcription.as_deref(), Some("hello"));
        assert!(content.turn_complete);
        assert_eq!(content.parts[0], ResponsePart::Text("Hola".to_string()));
        assert_eq!(
            content.parts[1],
            ResponsePart::Audio {
                mime_type: Some("audio/pcm;rate=24000".to_string()),
                data: Bytes::from_static(&[0x00, 0x01]),
            }
        );
    }

    #[test]
    fn test_matches_sdk_casing_without_wrapper() {
        let event = RemoteEvent::from_json(json!({
            "model_turn": {"parts": [{"text": "Hola"}, {"audio_data": [0, 1]}]}
        }));

        let RemoteEvent::Content(content) = event else {
            panic!("expected content event");
        };
        assert_eq!(content.parts.len(), 2);
        assert_eq!(
            content.parts[1],
            ResponsePart::Audio {
                mime_type: None,
                data: Bytes::from_static(&[0x00, 0x01]),
            }
        );
    }

    #[test]
    fn test_matches_status_and_error_records() {
        assert_eq!(
            RemoteEvent::from_json(json!({"setupComplete": {}})),
            RemoteEvent::Status("setup_complete".to_string())
        );
        assert_eq!(
            RemoteEvent::from_json(json!({"goAway": {"timeLeft": "10s"}})),
            RemoteEvent::Status("go_away".to_string())
        );
        assert_eq!(
            RemoteEvent::from_json(json!({"error": {"code": 429, "message": "quota"}})),
            RemoteEvent::Error {
                code: Some(429),
                message: "quota".to_string()
            }
        );
    }

    #[test]
    fn test_results_alternatives_path() {
        let event = RemoteEvent::from_json(json!({
            "results": [
                {"alternatives": [{"transcript": "hol"}], "isFinal": false},
                {"alternatives": [{"transcript": "hola"}], "is_final": true}
            ]
        }));
        let RemoteEvent::Content(content) = event else {
            panic!("expected content event");
        };
        assert_eq!(content.results.len(), 2);
        assert!(!content.results[0].is_final);
        assert!(content.results[1].is_final);
        assert_eq!(content.results[1].alternatives[0].transcript.as_deref(), Some("hola"));
    }

    #[test]
    fn test_unrecognized_shapes_are_unknown() {
        let value = json!({"usageMetadata": {"totalTokenCount": 12}});
        assert_eq!(RemoteEvent::from_json(value.clone()), RemoteEvent::Unknown(value));
        assert!(matches!(RemoteEvent::from_json(json!("text")), RemoteEvent::Unknown(_)));
    }

    #[test]
    fn test_undecodable_audio_is_flagged() {
        let event = RemoteEvent::from_json(json!({
            "serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "%%%"}}]}}
        }));
        let RemoteEvent::Content(content) = event else {
            panic!("expected content event");
        };
        assert!(matches!(content.parts[0], ResponsePart::CorruptAudio(_)));
    }

    #[test]
    fn test_shape_hides_values() {
        let value = json!({"serverContent": {"turnComplete": true, "secret": "abc"}});
        let shape = Shape(&value).to_string();
        assert!(shape.contains("turnComplete: bool"));
        assert!(!shape.contains("abc"));
    }
}
