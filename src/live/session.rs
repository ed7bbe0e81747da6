//! # Streaming Session Manager
//!
//! Drives one live session from connect to teardown:
//!
//! 1. Refuse to start without credentials (one error, then `disconnected`).
//! 2. Open the duplex stream and report `connected`.
//! 3. Run the send duty and the receive duty side by side until both finish.
//!    If either fails, the shared cancellation token stops the other.
//! 4. Close the stream and always report `disconnected`.
//!
//! ## Duties:
//! - **Send**: drain the audio queue in FIFO order and forward each non-empty
//!   chunk. The Sentinel ends the duty and tells the endpoint the input is
//!   over; the connection stays open for the reply. A chunk that cannot be
//!   forwarded is reported once and ends the duty without a retry.
//! - **Receive**: hand every remote event to the callback in arrival order until
//!   the stream ends. On the way out it queues the Sentinel if the audio queue
//!   is empty, so a send duty parked on that queue wakes up and exits.
//!
//! The caller holds a shutdown token. Cancelling it (the client went away)
//! stops both duties and tears the stream down.

use super::events::{SessionEvent, SessionStatus};
use super::queue::{AudioItem, AudioQueue, AudioReceiver};
use super::stream::{LiveConnection, LiveConnector, LiveError, LiveReceiver, LiveSender, LiveSetup};
use crate::credentials::Credentials;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving session events one at a time, in order.
pub type EventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Counters for one finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub chunks_forwarded: usize,
    pub events_received: usize,
}

/// Owns the settings needed to open one live session.
#[derive(Clone)]
pub struct LiveSession {
    credentials: Credentials,
    connector: Arc<dyn LiveConnector>,
    setup: LiveSetup,
}

impl LiveSession {
    pub fn new(credentials: Credentials, connector: Arc<dyn LiveConnector>, setup: LiveSetup) -> Self {
        Self {
            credentials,
            connector,
            setup,
        }
    }

    /// Run the session to completion.
    ///
    /// `queue` is the producer handle of the same channel `audio` drains; the
    /// receive duty uses it to queue the Sentinel. Cancelling `shutdown` ends
    /// the session early. The final event passed to `on_event` is always
    /// `disconnected`.
    pub async fn run(
        &self,
        queue: AudioQueue,
        mut audio: AudioReceiver,
        on_event: EventCallback,
        shutdown: CancellationToken,
    ) -> Result<SessionStats, LiveError> {
        let result = self.drive(&queue, &mut audio, &on_event, &shutdown).await;

        match &result {
            Ok(stats) => info!(
                session_id = %stats.session_id,
                chunks_forwarded = stats.chunks_forwarded,
                events_received = stats.events_received,
                "Live session finished"
            ),
            Err(err) => {
                warn!(error = %err, "Live session ended with an error");
                on_event(SessionEvent::Error(err.to_string()));
            }
        }

        on_event(SessionEvent::Status(SessionStatus::Disconnected));
        result
    }

    async fn drive(
        &self,
        queue: &AudioQueue,
        audio: &mut AudioReceiver,
        on_event: &EventCallback,
        shutdown: &CancellationToken,
    ) -> Result<SessionStats, LiveError> {
        if !self.credentials.is_configured() {
            self.credentials.warn_unconfigured("live session");
            return Err(LiveError::NotConfigured);
        }

        let connection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Live session cancelled before the stream opened");
                return Ok(SessionStats::default());
            }
            connection = self.connector.connect(&self.setup) => connection?,
        };
        let LiveConnection {
            session_id,
            mut sender,
            mut receiver,
        } = connection;

        info!(session_id = %session_id, model = %self.setup.model, "Live session connected");
        on_event(SessionEvent::Status(SessionStatus::Connected {
            session_id: session_id.clone(),
        }));

        let cancel = shutdown.child_token();

        let send = async {
            let result = send_duty(audio, sender.as_mut(), &cancel, on_event).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };

        let receive = async {
            let result = receive_duty(receiver.as_mut(), queue, &cancel, on_event).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };

        let (sent, received) = tokio::join!(send, receive);

        if let Err(err) = sender.close().await {
            debug!(session_id = %session_id, error = %err, "Live stream close failed");
        }
        drop(receiver);

        match (sent, received) {
            (Ok(chunks_forwarded), Ok(events_received)) => Ok(SessionStats {
                session_id,
                chunks_forwarded,
                events_received,
            }),
            (_, Err(err)) | (Err(err), _) => Err(err),
        }
    }
}

/// Forward queued audio until the Sentinel, a failure, or cancellation.
///
/// Returns the number of chunks forwarded. Only session-terminal errors are
/// returned; a per-chunk forwarding failure is reported through `on_event`.
/// The stream is never closed here: the reply to the last chunk may still be
/// on its way.
async fn send_duty(
    audio: &mut AudioReceiver,
    sender: &mut dyn LiveSender,
    cancel: &CancellationToken,
    on_event: &EventCallback,
) -> Result<usize, LiveError> {
    let mut forwarded = 0;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(forwarded, "Send duty cancelled");
                return Ok(forwarded);
            }
            item = audio.recv() => item,
        };

        match item {
            Some(AudioItem::Chunk(chunk)) if chunk.is_empty() => continue,
            Some(AudioItem::Chunk(chunk)) => match sender.send_audio(chunk).await {
                Ok(()) => forwarded += 1,
                Err(err) if err.is_session_terminal() => return Err(err),
                Err(err) => {
                    warn!(error = %err, forwarded, "Stopping audio forwarding");
                    on_event(SessionEvent::Error(err.to_string()));
                    return Ok(forwarded);
                }
            },
            Some(AudioItem::Sentinel) | None => break,
        }
    }

    debug!(forwarded, "Audio input finished, signalling end of input");
    if let Err(err) = sender.end_input().await {
        // The remote side may already be gone; the receive duty reports that
        debug!(error = %err, "Could not signal end of input");
    }
    Ok(forwarded)
}

/// Deliver remote events until end of stream, an error, or cancellation.
async fn receive_duty(
    receiver: &mut dyn LiveReceiver,
    queue: &AudioQueue,
    cancel: &CancellationToken,
    on_event: &EventCallback,
) -> Result<usize, LiveError> {
    let mut received = 0;

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(received),
            next = receiver.next_event() => next,
        };

        match next {
            Some(Ok(event)) => {
                received += 1;
                on_event(SessionEvent::Remote(event));
            }
            Some(Err(err)) => break Err(err),
            None => break Ok(received),
        }
    };

    if queue.is_empty() && queue.close() {
        debug!("Receive duty ended on an empty queue, queued the sentinel");
    }

    result
}
