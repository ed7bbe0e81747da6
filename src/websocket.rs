//! # Live Audio WebSocket
//!
//! One `LiveSocket` actor per browser connection on `/ws/live`. The actor is
//! the connection supervisor: it owns the audio queue, starts the live session
//! on a dedicated arbiter thread, and writes the normalized messages coming
//! back from that thread to the socket.
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: binary frames carry raw PCM audio (16-bit, mono, at
//!   the configured input sample rate). A text frame `{"type":"end_audio"}`
//!   ends the audio input without closing the socket.
//! - **Server → Client**: text frames `{"type": ..., "data": ...}` where type is
//!   one of `status`, `error`, `input_transcription`, `bot_response_text`,
//!   `bot_response_audio`.
//!
//! ## Lifecycle:
//! `idle → connecting → active → closing → closed`. Audio is queued from the
//! moment the session worker exists, so chunks spoken during the setup
//! handshake are forwarded once the stream opens. Audio arriving while closing
//! is dropped. `end_audio` ends the input only; replies keep flowing until the
//! remote ends its turn. When the client goes away the session is cancelled.
//! When the session finishes the socket is closed after the final
//! `disconnected` status.

use crate::handlers::chat::learner_settings;
use crate::live::{
    audio_channel, AudioQueue, ClientMessage, ClientSink, Dispatcher, EventCallback, LiveError,
    LiveSession, LiveSetup, PushError, SessionStats,
};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor state for one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Control messages the browser may send as text frames.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    EndAudio,
}

/// A normalized message to write to the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub ClientMessage);

/// The live session returned; sent from the session's arbiter thread.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionFinished(Result<SessionStats, LiveError>);

/// Delivery goes through the actor mailbox, so the socket is only ever
/// written from the actor's own context.
impl ClientSink for Recipient<Outbound> {
    fn deliver(&self, message: ClientMessage) {
        self.do_send(Outbound(message));
    }
}

pub struct LiveSocket {
    state: AppState,
    setup: LiveSetup,
    phase: Phase,
    queue: Option<AudioQueue>,
    /// Cancels the session worker when the client goes away
    shutdown: CancellationToken,
    holds_slot: bool,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    dropped_chunks: usize,
}

impl LiveSocket {
    pub fn new(state: AppState, setup: LiveSetup) -> Self {
        let config = state.get_config();
        Self {
            state,
            setup,
            phase: Phase::Idle,
            queue: None,
            shutdown: CancellationToken::new(),
            holds_slot: false,
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
            dropped_chunks: 0,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: ClientMessage) {
        ctx.text(message.to_json());
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("Live socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Spawn the live session on its own arbiter thread.
    fn start_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (queue, audio) = audio_channel();
        let outbound: Recipient<Outbound> = ctx.address().recipient();
        let finished: Recipient<SessionFinished> = ctx.address().recipient();

        let dispatcher = Dispatcher::new(Arc::new(outbound));
        let on_event: EventCallback = Arc::new(move |event| {
            dispatcher.dispatch(event);
        });
        let session = LiveSession::new(
            self.state.credentials.clone(),
            self.state.live_connector.clone(),
            self.setup.clone(),
        );

        let worker = Arbiter::new();
        let producer = queue.clone();
        let shutdown = self.shutdown.clone();
        let spawned = worker.spawn(async move {
            let result = session.run(producer, audio, on_event, shutdown).await;
            finished.do_send(SessionFinished(result));
            Arbiter::current().stop();
        });

        if spawned {
            self.queue = Some(queue);
            self.phase = Phase::Connecting;
        } else {
            error!("Failed to start live session worker");
            worker.stop();
            self.send(ctx, ClientMessage::Error("Failed to start live session".to_string()));
            self.send(ctx, ClientMessage::Status("disconnected".to_string()));
            self.finish(ctx);
        }
    }

    fn handle_audio(&mut self, data: Bytes) {
        let queue = match (&self.queue, self.phase) {
            (Some(queue), Phase::Connecting | Phase::Active) => queue,
            _ => {
                self.dropped_chunks += 1;
                debug!(phase = ?self.phase, bytes = data.len(), "No live session to take audio, dropping it");
                return;
            }
        };

        match queue.push(data) {
            Ok(()) => {}
            Err(PushError::Closed) => debug!("Audio input already ended, dropping chunk"),
            Err(PushError::Disconnected) => debug!("Live session gone, dropping chunk"),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientControl>(text) {
            Ok(ClientControl::EndAudio) => {
                info!("Client ended audio input");
                self.end_audio();
            }
            Err(err) => {
                warn!(error = %err, "Invalid control message from client");
                self.send(ctx, ClientMessage::Error(format!("Invalid message: {}", err)));
            }
        }
    }

    /// Queue the Sentinel; safe to call any number of times.
    fn end_audio(&mut self) {
        if let Some(queue) = &self.queue {
            if queue.close() {
                debug!(pending = queue.len(), "Audio input closed");
            }
        }
    }

    fn release_slot(&mut self) {
        if self.holds_slot {
            self.holds_slot = false;
            self.state.release_live_slot();
        }
    }

    fn finish(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.phase = Phase::Closed;
        self.release_slot();
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

impl Actor for LiveSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if !self.state.try_acquire_live_slot() {
            warn!("Live session limit reached, refusing connection");
            self.send(
                ctx,
                ClientMessage::Error("Too many live sessions, please try again later".to_string()),
            );
            self.send(ctx, ClientMessage::Status("disconnected".to_string()));
            self.finish(ctx);
            return;
        }
        self.holds_slot = true;

        info!(model = %self.setup.model, "Live socket connected");
        self.start_heartbeat(ctx);
        self.start_session(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // The worker is not joined; cancelling lets it tear down on its own
        self.end_audio();
        self.shutdown.cancel();
        self.release_slot();
        self.phase = Phase::Closed;

        if self.dropped_chunks > 0 {
            debug!(dropped = self.dropped_chunks, "Audio chunks dropped without a live session");
        }
        info!("Live socket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.handle_audio(data),
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Client closed live socket: {:?}", reason);
                self.phase = Phase::Closing;
                self.end_audio();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Live socket protocol error: {}", err);
                self.phase = Phase::Closing;
                self.end_audio();
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for LiveSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        if let ClientMessage::Status(status) = &msg.0 {
            match (status.as_str(), self.phase) {
                ("connected", Phase::Connecting) => self.phase = Phase::Active,
                ("disconnected", Phase::Connecting | Phase::Active) => self.phase = Phase::Closing,
                _ => {}
            }
        }
        self.send(ctx, msg.0);
    }
}

impl Handler<SessionFinished> for LiveSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionFinished, ctx: &mut Self::Context) {
        match msg.0 {
            Ok(stats) => info!(
                session_id = %stats.session_id,
                chunks = stats.chunks_forwarded,
                events = stats.events_received,
                "Live session worker finished"
            ),
            Err(err) => info!(error = %err, "Live session worker finished with an error"),
        }
        self.finish(ctx);
    }
}

/// `GET /ws/live` upgrade handler.
///
/// The system instruction is built from the learner settings of the caller's
/// chat session (`tutor_session` cookie), falling back to the configured
/// defaults.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!("New live socket request from: {:?}", req.connection_info().peer_addr());

    let learner = learner_settings(&state, &req);
    let setup = state.live_setup(&learner);
    let socket = LiveSocket::new(state.get_ref().clone(), setup);

    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::credentials::Credentials;
    use crate::state::test_support::{offline_state, EchoConnector, EchoTutor};
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn serve(state: AppState) -> SocketAddr {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/live", web::get().to(live_websocket))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws/live", addr)).await.unwrap();
        client
    }

    /// Next client message, skipping control frames. `None` once closed.
    async fn next_message(client: &mut Client) -> Option<ClientMessage> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    fn status(value: &str) -> ClientMessage {
        ClientMessage::Status(value.to_string())
    }

    #[test]
    fn test_end_audio_control_parses() {
        assert_eq!(
            serde_json::from_str::<ClientControl>(r#"{"type":"end_audio"}"#).unwrap(),
            ClientControl::EndAudio
        );
        assert!(serde_json::from_str::<ClientControl>(r#"{"type":"start"}"#).is_err());
    }

    fn text(value: &str) -> ClientMessage {
        ClientMessage::BotResponseText(value.to_string())
    }

    #[actix_web::test]
    async fn test_reply_after_end_audio_reaches_client() {
        let state = offline_state(AppConfig::default());
        let addr = serve(state.clone());
        let mut client = connect(addr).await;

        assert_eq!(next_message(&mut client).await, Some(status("connected")));
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);

        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(next_message(&mut client).await, Some(text("heard 3 bytes")));

        client
            .send(Message::Text(r#"{"type":"end_audio"}"#.to_string()))
            .await
            .unwrap();
        // The remote answers the finished input before ending its stream
        assert_eq!(
            next_message(&mut client).await,
            Some(text("input ended after 1 chunks"))
        );
        assert_eq!(next_message(&mut client).await, Some(status("disconnected")));
        assert_eq!(next_message(&mut client).await, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[actix_web::test]
    async fn test_audio_during_setup_is_forwarded() {
        let state = AppState::new(
            AppConfig::default(),
            Credentials::new(Some("test-key".to_string())),
            Arc::new(EchoTutor),
            Arc::new(EchoConnector::delayed(Duration::from_millis(300))),
        );
        let addr = serve(state);
        let mut client = connect(addr).await;

        // Spoken while the stream is still being set up
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send(Message::Binary(vec![0; 7])).await.unwrap();

        assert_eq!(next_message(&mut client).await, Some(status("connected")));
        assert_eq!(next_message(&mut client).await, Some(text("heard 7 bytes")));

        client.send(Message::Binary(vec![0; 3])).await.unwrap();
        assert_eq!(next_message(&mut client).await, Some(text("heard 3 bytes")));
    }

    #[actix_web::test]
    async fn test_client_close_releases_session() {
        let state = offline_state(AppConfig::default());
        let addr = serve(state.clone());
        let mut client = connect(addr).await;

        assert_eq!(next_message(&mut client).await, Some(status("connected")));
        client.close(None).await.unwrap();
        assert_eq!(next_message(&mut client).await, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[actix_web::test]
    async fn test_unconfigured_session_reports_error_then_disconnected() {
        let state = AppState::new(
            AppConfig::default(),
            Credentials::missing(),
            Arc::new(EchoTutor),
            Arc::new(EchoConnector::default()),
        );
        let addr = serve(state);
        let mut client = connect(addr).await;

        assert!(matches!(next_message(&mut client).await, Some(ClientMessage::Error(m)) if m.contains("not configured")));
        assert_eq!(next_message(&mut client).await, Some(status("disconnected")));
        assert_eq!(next_message(&mut client).await, None);
    }

    #[actix_web::test]
    async fn test_session_limit_refuses_extra_client() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = offline_state(config);
        assert!(state.try_acquire_live_slot());

        let addr = serve(state.clone());
        let mut client = connect(addr).await;

        assert!(matches!(next_message(&mut client).await, Some(ClientMessage::Error(m)) if m.contains("Too many")));
        assert_eq!(next_message(&mut client).await, Some(status("disconnected")));
        assert_eq!(next_message(&mut client).await, None);
        assert_eq!(state.get_metrics_snapshot().live_sessions_rejected, 1);
    }
}
