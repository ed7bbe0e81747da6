//! Gemini Live connector over WebSocket (`BidiGenerateContent`).
//!
//! Opening a connection sends the setup message and waits for the endpoint to
//! acknowledge it before the halves are handed to the session manager.

use super::events::RemoteEvent;
use super::stream::{LiveConnection, LiveConnector, LiveError, LiveReceiver, LiveSender, LiveSetup};
use crate::credentials::Credentials;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NORMAL_CLOSE: u16 = 1000;

/// Opens Gemini Live sessions.
///
/// The setup acknowledgement deadline comes from each session's
/// [`LiveSetup::setup_timeout`].
pub struct GeminiLiveConnector {
    url: String,
    credentials: Credentials,
}

impl GeminiLiveConnector {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }

    fn endpoint(&self) -> Result<Url, LiveError> {
        let key = self.credentials.api_key().ok_or(LiveError::NotConfigured)?;
        let mut url = Url::parse(&self.url)
            .map_err(|e| LiveError::ConnectionFailed(format!("invalid live URL: {}", e)))?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(url)
    }

    async fn handshake(&self, setup: &LiveSetup) -> Result<WsStream, LiveError> {
        let url = self.endpoint()?;
        let (mut ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;
        debug!(status = %response.status(), "Live WebSocket opened");

        ws.send(Message::Text(setup_message(setup).to_string()))
            .await
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        loop {
            let frame = match ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(LiveError::ConnectionFailed(e.to_string())),
                None => {
                    return Err(LiveError::ConnectionFailed(
                        "stream ended before setup completed".to_string(),
                    ))
                }
            };

            match decode_frame(frame) {
                Frame::Event(RemoteEvent::Status(status)) if status == "setup_complete" => {
                    return Ok(ws)
                }
                Frame::Event(RemoteEvent::Error { code, message }) => {
                    return Err(LiveError::ConnectionFailed(match code {
                        Some(code) => format!("setup rejected ({}): {}", code, message),
                        None => format!("setup rejected: {}", message),
                    }))
                }
                Frame::Closed(Some(err)) => {
                    return Err(LiveError::ConnectionFailed(err.to_string()))
                }
                Frame::Closed(None) => {
                    return Err(LiveError::ConnectionFailed(
                        "stream closed before setup completed".to_string(),
                    ))
                }
                Frame::Event(other) => debug!(event = ?other, "Ignoring event before setup completed"),
                Frame::Skip => {}
            }
        }
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection, LiveError> {
        let ws = tokio::time::timeout(setup.setup_timeout, self.handshake(setup))
            .await
            .map_err(|_| {
                LiveError::ConnectionFailed(format!(
                    "setup not acknowledged within {}s",
                    setup.setup_timeout.as_secs()
                ))
            })??;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(session_id = %session_id, model = %setup.model, "Gemini Live setup complete");

        let (sink, stream) = ws.split();
        Ok(LiveConnection {
            session_id,
            sender: Box::new(GeminiSender {
                sink,
                mime_type: format!("audio/pcm;rate={}", setup.input_sample_rate),
                input_ended: false,
                closed: false,
            }),
            receiver: Box::new(GeminiReceiver {
                stream,
                finished: false,
            }),
        })
    }
}

/// Build the opening `setup` message.
pub fn setup_message(setup: &LiveSetup) -> Value {
    let modalities: Vec<&str> = setup
        .response_modalities
        .iter()
        .map(|m| m.as_wire())
        .collect();

    let mut body = json!({
        "model": setup.model,
        "generationConfig": { "responseModalities": modalities },
    });
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        body["outputAudioTranscription"] = json!({});
    }
    if let Some(instruction) = &setup.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }

    json!({ "setup": body })
}

/// Build one `realtimeInput` audio message.
pub fn audio_message(mime_type: &str, chunk: &[u8]) -> Value {
    json!({
        "realtimeInput": {
            "audio": { "mimeType": mime_type, "data": STANDARD.encode(chunk) }
        }
    })
}

/// The `realtimeInput` message marking the end of the audio stream.
pub fn audio_stream_end_message() -> Value {
    json!({ "realtimeInput": { "audioStreamEnd": true } })
}

struct GeminiSender {
    sink: SplitSink<WsStream, Message>,
    mime_type: String,
    input_ended: bool,
    closed: bool,
}

#[async_trait]
impl LiveSender for GeminiSender {
    async fn send_audio(&mut self, chunk: Bytes) -> Result<(), LiveError> {
        if self.closed || self.input_ended {
            return Err(LiveError::Transport {
                code: None,
                reason: "audio input already ended".to_string(),
            });
        }
        let message = audio_message(&self.mime_type, &chunk);
        self.sink
            .send(Message::Text(message.to_string()))
            .await
            .map_err(send_error)
    }

    async fn end_input(&mut self) -> Result<(), LiveError> {
        if self.closed || self.input_ended {
            return Ok(());
        }
        self.input_ended = true;

        self.sink
            .send(Message::Text(audio_stream_end_message().to_string()))
            .await
            .map_err(send_error)
    }

    async fn close(&mut self) -> Result<(), LiveError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close().await.map_err(send_error)
    }
}

fn send_error(err: tungstenite::Error) -> LiveError {
    match err {
        tungstenite::Error::Capacity(_)
        | tungstenite::Error::WriteBufferFull(_)
        | tungstenite::Error::Utf8 => LiveError::Forwarding(err.to_string()),
        other => LiveError::Transport {
            code: None,
            reason: other.to_string(),
        },
    }
}

struct GeminiReceiver {
    stream: SplitStream<WsStream>,
    finished: bool,
}

#[async_trait]
impl LiveReceiver for GeminiReceiver {
    async fn next_event(&mut self) -> Option<Result<RemoteEvent, LiveError>> {
        while !self.finished {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => decode_frame(frame),
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => Frame::Closed(None),
                Some(Err(e)) => Frame::Closed(Some(LiveError::Transport {
                    code: None,
                    reason: e.to_string(),
                })),
            };

            match frame {
                Frame::Event(event) => return Some(Ok(event)),
                Frame::Closed(err) => {
                    self.finished = true;
                    return err.map(Err);
                }
                Frame::Skip => continue,
            }
        }
        None
    }
}

enum Frame {
    Event(RemoteEvent),
    /// End of stream; `Some` when the close was abnormal.
    Closed(Option<LiveError>),
    Skip,
}

fn decode_frame(frame: Message) -> Frame {
    let parsed = match &frame {
        Message::Text(text) => serde_json::from_str::<Value>(text),
        Message::Binary(data) => serde_json::from_slice::<Value>(data),
        Message::Close(Some(close)) => {
            let code = u16::from(close.code);
            if code == NORMAL_CLOSE {
                return Frame::Closed(None);
            }
            return Frame::Closed(Some(LiveError::Transport {
                code: Some(code),
                reason: close.reason.to_string(),
            }));
        }
        Message::Close(None) => return Frame::Closed(None),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Frame::Skip,
    };

    match parsed {
        Ok(value) => Frame::Event(RemoteEvent::from_json(value)),
        Err(e) => {
            warn!(error = %e, "Skipping non-JSON frame from live endpoint");
            Frame::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[test]
    fn test_setup_message_shape() {
        let setup = LiveSetup::conversational("models/gemini-live", 16000)
            .with_system_instruction("Speak Spanish");
        let message = setup_message(&setup);

        assert_eq!(message["setup"]["model"], "models/gemini-live");
        assert_eq!(
            message["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO", "TEXT"])
        );
        assert_eq!(message["setup"]["inputAudioTranscription"], json!({}));
        assert_eq!(message["setup"]["outputAudioTranscription"], json!({}));
        assert_eq!(
            message["setup"]["systemInstruction"]["parts"][0]["text"],
            "Speak Spanish"
        );
    }

    #[test]
    fn test_audio_message_is_base64_pcm() {
        let message = audio_message("audio/pcm;rate=16000", &[0, 1, 2]);
        assert_eq!(message["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(message["realtimeInput"]["audio"]["data"], "AAEC");
    }

    #[test]
    fn test_decode_frame_variants() {
        let binary = Message::Binary(br#"{"serverContent":{"turnComplete":true}}"#.to_vec());
        assert!(matches!(
            decode_frame(binary),
            Frame::Event(RemoteEvent::Content(content)) if content.turn_complete
        ));

        assert!(matches!(decode_frame(Message::Text("not json".into())), Frame::Skip));
        assert!(matches!(decode_frame(Message::Ping(vec![1])), Frame::Skip));

        let normal = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        assert!(matches!(decode_frame(normal), Frame::Closed(None)));

        let abnormal = Message::Close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "internal".into(),
        }));
        assert!(matches!(
            decode_frame(abnormal),
            Frame::Closed(Some(LiveError::Transport { code: Some(1011), .. }))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let connector = GeminiLiveConnector::new("ws://127.0.0.1:9/live", Credentials::missing());
        let setup = LiveSetup::conversational("models/x", 16000);
        assert!(matches!(
            connector.connect(&setup).await,
            Err(LiveError::NotConfigured)
        ));
    }

    async fn spawn_endpoint<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{}/live", addr)
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_against_local_endpoint() {
        let url = spawn_endpoint(|mut ws| async move {
            let setup = next_json(&mut ws).await;
            assert_eq!(setup["setup"]["model"], "models/test");
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
                .await
                .unwrap();

            let audio = next_json(&mut ws).await;
            assert_eq!(audio["realtimeInput"]["audio"]["data"], "AQI=");

            ws.send(Message::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"text":"Hola"}]}}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = GeminiLiveConnector::new(url, Credentials::new(Some("k".to_string())));
        let mut connection = connector
            .connect(&LiveSetup::conversational("models/test", 16000))
            .await
            .unwrap();
        assert!(!connection.session_id.is_empty());

        connection
            .sender
            .send_audio(Bytes::from_static(&[1, 2]))
            .await
            .unwrap();

        match connection.receiver.next_event().await {
            Some(Ok(RemoteEvent::Content(content))) => {
                assert!(matches!(&content.parts[0], crate::live::events::ResponsePart::Text(t) if t == "Hola"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(connection.receiver.next_event().await.is_none());
        assert!(connection.receiver.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_end_input_keeps_connection_for_reply() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let url = spawn_endpoint(|mut ws| async move {
            next_json(&mut ws).await;
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
                .await
                .unwrap();

            let audio = next_json(&mut ws).await;
            assert_eq!(audio["realtimeInput"]["audio"]["data"], "AQI=");
            assert_eq!(next_json(&mut ws).await, audio_stream_end_message());

            // The reply to the last utterance comes after the end of input
            let reply_sent = ws
                .send(Message::Text(
                    r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Adiós"}]}}}"#.to_string(),
                ))
                .await
                .is_ok();

            let next = ws.next().await;
            let _ = seen_tx.send((reply_sent, matches!(next, Some(Ok(Message::Close(_))))));
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = GeminiLiveConnector::new(url, Credentials::new(Some("k".to_string())));
        let mut connection = connector
            .connect(&LiveSetup::conversational("models/test", 16000))
            .await
            .unwrap();

        connection
            .sender
            .send_audio(Bytes::from_static(&[1, 2]))
            .await
            .unwrap();
        connection.sender.end_input().await.unwrap();
        // Ending twice sends nothing more
        connection.sender.end_input().await.unwrap();
        assert!(connection
            .sender
            .send_audio(Bytes::from_static(&[3]))
            .await
            .is_err());

        match connection.receiver.next_event().await {
            Some(Ok(RemoteEvent::Content(content))) => {
                assert!(matches!(&content.parts[0], crate::live::events::ResponsePart::Text(t) if t == "Adiós"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        connection.sender.close().await.unwrap();
        let (reply_sent, closed_after_reply) = seen_rx.await.unwrap();
        assert!(reply_sent);
        assert!(closed_after_reply);
    }

    #[tokio::test]
    async fn test_abnormal_close_surfaces_code() {
        let url = spawn_endpoint(|mut ws| async move {
            next_json(&mut ws).await;
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
                .await
                .unwrap();
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "overloaded".into(),
                }))
                .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = GeminiLiveConnector::new(url, Credentials::new(Some("k".to_string())));
        let mut connection = connector
            .connect(&LiveSetup::conversational("models/test", 16000))
            .await
            .unwrap();

        match connection.receiver.next_event().await {
            Some(Err(LiveError::Transport { code, reason })) => {
                assert_eq!(code, Some(1011));
                assert_eq!(reason, "overloaded");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_setup_rejection_fails_connect() {
        let url = spawn_endpoint(|mut ws| async move {
            next_json(&mut ws).await;
            ws.send(Message::Text(
                r#"{"error":{"code":400,"message":"bad model"}}"#.to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = GeminiLiveConnector::new(url, Credentials::new(Some("k".to_string())));
        let result = connector
            .connect(&LiveSetup::conversational("models/missing", 16000))
            .await;
        match result {
            Err(LiveError::ConnectionFailed(message)) => assert!(message.contains("bad model")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
