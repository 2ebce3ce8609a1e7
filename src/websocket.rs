//! # WebSocket Voice Session Handler
//!
//! One actor per client connection on `/ws`. The client opens a session, streams
//! raw PCM as binary frames, and closes the session; the server answers with the
//! storage and recognition outcomes for it.
//!
//! ## WebSocket Protocol:
//! 1. `{"type":"audio_start","session_id":"s1"}` opens a session and makes it the
//!    target of binary frames
//! 2. Binary frames: raw PCM appended to the current session, in receipt order
//! 3. `{"type":"audio_end","session_id":"s1"}` finalizes the session and hands it
//!    to the dispatcher
//! 4. The server sends `audio_stored` or `storage_error`, and
//!    `recognition_complete` or `recognition_error`, in whatever order they finish
//!
//! `{"type":"text","text":"...","require_tts":true}` is answered with a
//! `text_reply`, carrying the URL of a synthesized rendition when asked for.
//!
//! Rejected control messages and frames are answered with `session_error`; the
//! connection stays open.
//!
//! ## Lifetime
//! Sessions belong to their connection. When the connection stops, open sessions
//! are dropped and in-flight recognitions are cancelled; storage of sessions that
//! were already finalized runs to completion.

use crate::audio::SessionManager;
use crate::dispatch::{OutboundMessage, OutboundSender, ResultDispatcher};
use crate::error::EngineError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Control messages a client may send as text frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    AudioStart {
        session_id: String,
    },
    AudioEnd {
        session_id: String,
    },
    Text {
        text: String,
        #[serde(default)]
        require_tts: bool,
    },
}

const INBOUND_TYPES: [&str; 3] = ["audio_start", "audio_end", "text"];

/// Outcome of reading one text frame.
#[derive(Debug, PartialEq)]
enum Parsed {
    Message(InboundMessage),
    /// Valid JSON with a `type` this server does not handle.
    Unknown(String),
    Invalid { code: &'static str, error: String },
}

fn parse_inbound(text: &str) -> Parsed {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return Parsed::Invalid {
                code: "invalid_json",
                error: format!("Invalid JSON: {}", e),
            }
        }
    };

    let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string();
    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Parsed::Unknown(kind);
    }

    match serde_json::from_value(value) {
        Ok(message) => Parsed::Message(message),
        Err(e) => Parsed::Invalid {
            code: "invalid_message",
            error: format!("Invalid {} message: {}", kind, e),
        },
    }
}

pub struct VoiceSocket {
    state: web::Data<AppState>,

    /// Sessions of this connection only
    sessions: SessionManager,

    /// Outcomes from dispatch tasks, forwarded to the client by the actor
    outbound_tx: OutboundSender,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,

    /// Flipped when the connection stops
    cancel: watch::Sender<bool>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let config = state.get_config();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);

        Self {
            sessions: SessionManager::new(
                config.session.max_concurrent_sessions,
                config.session.max_buffer_bytes,
            ),
            state,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            cancel,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.session.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.session.client_timeout_secs),
        }
    }

    /// A dispatcher bound to the providers and settings current right now.
    fn dispatcher(&self) -> ResultDispatcher {
        let config = self.state.get_config();
        ResultDispatcher::new(
            self.state.providers(),
            self.outbound_tx.clone(),
            config.recognition.timeout(),
            self.cancel.subscribe(),
        )
        .with_reuse_stored_url(config.recognition.polling.reuse_stored_url)
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &OutboundMessage) {
        self.state.record_outbound(message);
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(kind = message.kind(), error = %e, "failed to serialize outbound message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, session_id: Option<&str>, err: &EngineError) {
        warn!(session_id = ?session_id, code = err.code(), error = %err, "session request rejected");
        self.send(ctx, &OutboundMessage::session_error(session_id, err));
    }

    fn handle_inbound(&mut self, message: InboundMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            InboundMessage::AudioStart { session_id } => match self.sessions.start_session(&session_id) {
                Ok(()) => {
                    self.state.record_session_started();
                    info!(session_id = %session_id, "session started");
                }
                Err(e) => self.send_error(ctx, Some(&session_id), &e),
            },
            InboundMessage::AudioEnd { session_id } => match self.sessions.end_session(&session_id) {
                Ok(finalized) => {
                    self.state.record_session_finalized();
                    info!(
                        session_id = %session_id,
                        bytes = finalized.audio.len(),
                        chunks = finalized.chunks,
                        duration_ms = finalized.duration().num_milliseconds(),
                        "session finalized"
                    );
                    self.dispatcher().dispatch(finalized);
                }
                Err(e) => self.send_error(ctx, Some(&session_id), &e),
            },
            InboundMessage::Text { text, require_tts } => {
                debug!(chars = text.len(), require_tts, "text message");
                self.dispatcher().reply_to_text(text, require_tts);
            }
        }
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.sessions.append_to_current(data) {
            Ok((session_id, buffered)) => {
                self.state.record_audio_received(data.len());
                debug!(session_id = %session_id, bytes = data.len(), buffered, "audio appended");
            }
            Err(e) => {
                let current = self.sessions.current_session();
                self.send_error(ctx, current.as_deref(), &e);
            }
        }
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");
        self.state.connection_opened();

        if let Some(outbound_rx) = self.outbound_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let dropped = self.sessions.close_all();
        self.cancel.send_replace(true);
        self.state.connection_closed();

        if dropped.is_empty() {
            info!("WebSocket connection stopped");
        } else {
            info!(dropped_sessions = ?dropped, "WebSocket connection stopped with open sessions");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match parse_inbound(&text) {
                Parsed::Message(message) => self.handle_inbound(message, ctx),
                Parsed::Unknown(kind) => warn!(kind = %kind, "ignoring unknown message type"),
                Parsed::Invalid { code, error } => {
                    warn!(code, %error, "rejected text frame");
                    self.send(ctx, &OutboundMessage::SessionError {
                        session_id: None,
                        code: code.to_string(),
                        error,
                    });
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outcomes produced by dispatch tasks.
impl StreamHandler<OutboundMessage> for VoiceSocket {
    fn handle(&mut self, message: OutboundMessage, ctx: &mut Self::Context) {
        self.send(ctx, &message);
    }

    // The actor owns a sender, so the stream only ends with the actor itself.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(VoiceSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_parse_inbound() {
        assert_eq!(
            parse_inbound(r#"{"type":"audio_start","session_id":"s1"}"#),
            Parsed::Message(InboundMessage::AudioStart { session_id: "s1".into() })
        );
        assert_eq!(
            parse_inbound(r#"{"type":"text","text":"hi"}"#),
            Parsed::Message(InboundMessage::Text { text: "hi".into(), require_tts: false })
        );
        assert_eq!(parse_inbound(r#"{"type":"subscribe"}"#), Parsed::Unknown("subscribe".into()));
        assert!(matches!(parse_inbound("{not json"), Parsed::Invalid { code: "invalid_json", .. }));
        assert!(matches!(
            parse_inbound(r#"{"type":"audio_end"}"#),
            Parsed::Invalid { code: "invalid_message", .. }
        ));
    }

    async fn next_json<S>(socket: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("no message within 5s")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[actix_web::test]
    async fn test_session_over_websocket() {
        let mut config = AppConfig::default();
        config.recognition.provider = "mock".into();
        config.storage.provider = "memory".into();
        config.synthesis.provider = "disabled".into();
        let state = web::Data::new(AppState::new(config).unwrap());

        let server = HttpServer::new({
            let state = state.clone();
            move || {
                App::new()
                    .app_data(state.clone())
                    .route("/ws", web::get().to(voice_websocket))
            }
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        // Audio before any session is rejected without closing the connection.
        socket.send(Message::Binary(vec![0u8; 10])).await.unwrap();
        let rejected = next_json(&mut socket).await;
        assert_eq!(rejected["type"], "session_error");
        assert_eq!(rejected["code"], "session_not_found");

        let start = json!({"type": "audio_start", "session_id": "s1"}).to_string();
        socket.send(Message::Text(start.clone())).await.unwrap();
        socket.send(Message::Binary(vec![0u8; 16_000])).await.unwrap();
        socket.send(Message::Binary(vec![0u8; 16_000])).await.unwrap();

        socket.send(Message::Text(start)).await.unwrap();
        let duplicate = next_json(&mut socket).await;
        assert_eq!(duplicate["code"], "session_already_exists");
        assert_eq!(duplicate["session_id"], "s1");

        socket
            .send(Message::Text(json!({"type": "audio_end", "session_id": "s1"}).to_string()))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let message = next_json(&mut socket).await;
            assert_eq!(message["session_id"], "s1");
            if message["type"] == "recognition_complete" {
                assert_eq!(message["text"], "[mock transcript: 32000 bytes, 1.0s of audio]");
            }
            kinds.push(message["type"].as_str().unwrap().to_string());
        }
        kinds.sort();
        assert_eq!(kinds, vec!["audio_stored", "recognition_complete"]);

        socket
            .send(Message::Text(json!({"type": "text", "text": "hello"}).to_string()))
            .await
            .unwrap();
        let reply = next_json(&mut socket).await;
        assert_eq!(reply, json!({"type": "text_reply", "text": "hello"}));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_started, 1);
        assert_eq!(metrics.sessions_finalized, 1);
        assert_eq!(metrics.audio_bytes_received, 32_000);

        socket.close(None).await.unwrap();
        handle.stop(false).await;
    }
}
