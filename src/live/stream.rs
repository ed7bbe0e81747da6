//! Duplex stream abstraction over the remote conversational-audio endpoint.
//!
//! A connector opens one connection and hands back its two halves so the send
//! and receive duties can each own one without sharing a lock.

use super::events::RemoteEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while connecting to or streaming with the live endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("Live API is not configured")]
    NotConfigured,

    #[error("Failed to connect to the live endpoint: {0}")]
    ConnectionFailed(String),

    /// The connection itself failed; the session cannot continue.
    #[error("{}", transport_message(*code, reason))]
    Transport { code: Option<u16>, reason: String },

    /// A single chunk could not be forwarded; the connection may still be up.
    #[error("Failed to forward audio: {0}")]
    Forwarding(String),
}

fn transport_message(code: Option<u16>, reason: &str) -> String {
    match code {
        Some(code) => format!("Live stream closed ({}): {}", code, reason),
        None => format!("Live stream failed: {}", reason),
    }
}

impl LiveError {
    /// Whether this error ends the whole session rather than one duty.
    pub fn is_session_terminal(&self) -> bool {
        !matches!(self, LiveError::Forwarding(_))
    }
}

/// Response modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Audio,
    Text,
}

impl Modality {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Modality::Audio => "AUDIO",
            Modality::Text => "TEXT",
        }
    }
}

/// Generation settings sent when the stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    pub model: String,
    pub response_modalities: Vec<Modality>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub input_sample_rate: u32,
    pub system_instruction: Option<String>,
    /// How long the endpoint may take to acknowledge the setup.
    pub setup_timeout: Duration,
}

impl LiveSetup {
    /// Dual-modality responses with both transcriptions enabled.
    pub fn conversational(model: impl Into<String>, input_sample_rate: u32) -> Self {
        Self {
            model: model.into(),
            response_modalities: vec![Modality::Audio, Modality::Text],
            input_transcription: true,
            output_transcription: true,
            input_sample_rate,
            system_instruction: None,
            setup_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

/// An open connection, split into its two halves.
pub struct LiveConnection {
    pub session_id: String,
    pub sender: Box<dyn LiveSender>,
    pub receiver: Box<dyn LiveReceiver>,
}

/// Opens duplex streams to the remote endpoint.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection, LiveError>;
}

/// Outbound half of a live connection.
#[async_trait]
pub trait LiveSender: Send {
    async fn send_audio(&mut self, chunk: Bytes) -> Result<(), LiveError>;

    /// Tell the endpoint no more audio follows. The connection stays open so
    /// the reply to the last utterance can still arrive. Safe to call twice.
    async fn end_input(&mut self) -> Result<(), LiveError>;

    /// Close the whole connection. Safe to call twice.
    async fn close(&mut self) -> Result<(), LiveError>;
}

/// Inbound half of a live connection.
#[async_trait]
pub trait LiveReceiver: Send {
    /// Next event in arrival order; `None` at end of stream.
    async fn next_event(&mut self) -> Option<Result<RemoteEvent, LiveError>>;
}
