//! # Event Dispatcher
//!
//! Turns [`SessionEvent`]s into the closed set of [`ClientMessage`]s and hands
//! them to a [`ClientSink`]. The dispatcher runs on the session's arbiter
//! thread; the sink is responsible for getting each message onto the client
//! connection's own context (for the WebSocket actor that is its mailbox).
//!
//! ## Normalization rules:
//! 1. Session status/error records map directly to `status`/`error`.
//! 2. Input transcription comes from the direct transcription field, or from
//!    the first result marked final in a results/alternatives list.
//! 3. The first text part and the first audio part of a model turn are taken;
//!    later parts of the same kind in the same event are ignored. When no text
//!    part is present the output transcription stands in for it.
//! 4. Each extracted field becomes its own message.
//! 5. Events that yield nothing are logged with their shape.
//! 6. A field that fails to extract does not take the others down with it.
//!    The first failure becomes one `error` message after whatever did
//!    extract; dispatching never fails.

use super::events::{ClientMessage, RemoteEvent, ResponsePart, ServerContent, SessionEvent, Shape};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Failure while pulling fields out of a remote event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("final recognition result has no transcript")]
    MissingTranscript,
    #[error("audio part could not be decoded: {0}")]
    CorruptAudio(String),
}

/// Destination for normalized messages.
///
/// Implementations must be callable from any thread and must not run the
/// delivery inline on the caller's context.
pub trait ClientSink: Send + Sync + 'static {
    fn deliver(&self, message: ClientMessage);
}

impl ClientSink for mpsc::UnboundedSender<ClientMessage> {
    fn deliver(&self, message: ClientMessage) {
        if self.send(message).is_err() {
            debug!("Client channel closed, dropping message");
        }
    }
}

/// Messages pulled from one event, plus the first extraction failure.
#[derive(Debug, Default, PartialEq)]
pub struct Normalized {
    pub messages: Vec<ClientMessage>,
    pub failure: Option<DispatchError>,
}

impl Normalized {
    fn ok(messages: Vec<ClientMessage>) -> Self {
        Self { messages, failure: None }
    }

    fn fail(&mut self, err: DispatchError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

/// Normalizes session events and forwards them to one client.
#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn ClientSink>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ClientSink>) -> Self {
        Self { sink }
    }

    /// Normalize one event and deliver the resulting messages in order.
    ///
    /// Returns how many messages were delivered.
    pub fn dispatch(&self, event: SessionEvent) -> usize {
        let Normalized { mut messages, failure } = normalize(&event);
        if let Some(err) = failure {
            warn!(error = %err, extracted = messages.len(), "Failed to extract content from live event");
            messages.push(ClientMessage::Error(format!(
                "Error processing server response: {}",
                err
            )));
        }

        if messages.is_empty() {
            log_empty(&event);
        }

        let delivered = messages.len();
        for message in messages {
            self.sink.deliver(message);
        }
        delivered
    }
}

/// Map one session event to zero or more client messages.
pub fn normalize(event: &SessionEvent) -> Normalized {
    match event {
        SessionEvent::Status(status) => {
            Normalized::ok(vec![ClientMessage::Status(status.as_str().to_string())])
        }
        SessionEvent::Error(message) => Normalized::ok(vec![ClientMessage::Error(message.clone())]),
        SessionEvent::Remote(RemoteEvent::Status(status)) => {
            Normalized::ok(vec![ClientMessage::Status(status.clone())])
        }
        SessionEvent::Remote(RemoteEvent::Error { code, message }) => {
            let text = match code {
                Some(code) => format!("Live API error {}: {}", code, message),
                None => format!("Live API error: {}", message),
            };
            Normalized::ok(vec![ClientMessage::Error(text)])
        }
        SessionEvent::Remote(RemoteEvent::Content(content)) => normalize_content(content),
        SessionEvent::Remote(RemoteEvent::Unknown(_)) => Normalized::default(),
    }
}

fn normalize_content(content: &ServerContent) -> Normalized {
    let mut out = Normalized::default();

    match input_transcription(content) {
        Ok(Some(transcription)) => out
            .messages
            .push(ClientMessage::InputTranscription(transcription)),
        Ok(None) => {}
        Err(err) => out.fail(err),
    }

    let text = content
        .parts
        .iter()
        .find_map(|part| match part {
            ResponsePart::Text(text) if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
        .or_else(|| {
            content
                .output_transcription
                .clone()
                .filter(|text| !text.is_empty())
        });
    if let Some(text) = text {
        out.messages.push(ClientMessage::BotResponseText(text));
    }

    let audio = content.parts.iter().find(|part| {
        matches!(part, ResponsePart::Audio { data, .. } if !data.is_empty())
            || matches!(part, ResponsePart::CorruptAudio(_))
    });
    match audio {
        Some(ResponsePart::Audio { data, .. }) => out.messages.push(ClientMessage::audio(data)),
        Some(ResponsePart::CorruptAudio(reason)) => {
            out.fail(DispatchError::CorruptAudio(reason.clone()))
        }
        _ => {}
    }

    out
}

fn input_transcription(content: &ServerContent) -> Result<Option<String>, DispatchError> {
    if let Some(text) = content.input_transcription.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Some(text.clone()));
    }

    match content.results.iter().find(|result| result.is_final) {
        Some(result) => result
            .alternatives
            .first()
            .and_then(|alternative| alternative.transcript.clone())
            .map(|transcript| Some(transcript).filter(|t| !t.is_empty()))
            .ok_or(DispatchError::MissingTranscript),
        None => Ok(None),
    }
}

fn log_empty(event: &SessionEvent) {
    match event {
        SessionEvent::Remote(RemoteEvent::Unknown(value)) => {
            warn!(shape = %Shape(value), "Unrecognized event from live endpoint");
        }
        SessionEvent::Remote(RemoteEvent::Content(content)) => {
            debug!(
                parts = content.parts.len(),
                turn_complete = content.turn_complete,
                interrupted = content.interrupted,
                "Live event carried no client-facing content"
            );
        }
        other => debug!(event = ?other, "Live event produced no messages"),
    }
}
