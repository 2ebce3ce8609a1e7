//! # Streaming Recognizer
//!
//! Recognizes a finalized buffer over one WebSocket session with the recognition
//! service, using the binary frames from `crate::protocol`.
//!
//! ## Exchange
//! 1. Connect, passing credentials in the handshake headers
//!    (`X-Api-App-Key`, `X-Api-Access-Key`, `X-Api-Resource-Id`, `X-Api-Connect-Id`).
//! 2. Send a FullClientRequest carrying the session parameters as JSON.
//! 3. Wait for the first FullServerResponse; an error frame or error code aborts.
//! 4. Send the audio as AudioOnlyRequest frames, one chunk each, flagging only the
//!    final chunk as last. After every other chunk, wait briefly for an interim
//!    response; a quiet server is not an error.
//! 5. After the last chunk, read responses until one is marked last or the server
//!    closes the socket normally. The text of those responses, in order, is the
//!    transcript.
//!
//! Failures are reported once; retrying is left to the caller.

use super::{RecognitionContext, Recognizer};
use crate::audio::chunker::{self, AudioChunk};
use crate::audio::AudioFormat;
use crate::config::StreamingConfig;
use crate::error::{EngineError, EngineResult};
use crate::protocol::{Compression, Frame, MessageType};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Codes the service uses to mean "no error".
const SUCCESS_CODES: [i64; 3] = [0, 1000, 20_000_000];

pub struct StreamingRecognizer {
    config: StreamingConfig,
    format: AudioFormat,
    chunk_size: usize,
}

/// What one server frame contributed.
#[derive(Debug, Default, PartialEq)]
struct ServerUpdate {
    text: Option<String>,
    is_last: bool,
}

/// Text gathered during one exchange.
#[derive(Debug, Default)]
struct Transcript {
    parts: Vec<String>,
    latest_interim: Option<String>,
}

impl Transcript {
    fn interim(&mut self, text: Option<String>) {
        if text.is_some() {
            self.latest_interim = text;
        }
    }

    fn push(&mut self, text: Option<String>) {
        if let Some(text) = text {
            self.parts.push(text);
        }
    }

    /// Concatenated final text, or the newest interim text when the server sent
    /// nothing after the last chunk.
    fn into_text(self) -> String {
        if self.parts.is_empty() {
            self.latest_interim.unwrap_or_default()
        } else {
            self.parts.concat()
        }
    }
}

impl StreamingRecognizer {
    pub fn new(config: StreamingConfig, format: AudioFormat, chunk_size: usize) -> EngineResult<Self> {
        let url = url::Url::parse(&config.ws_url)
            .map_err(|e| EngineError::Config(format!("invalid streaming url '{}': {}", config.ws_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(EngineError::Config(format!(
                "streaming url must use ws:// or wss://, got '{}'",
                config.ws_url
            )));
        }

        Ok(Self { config, format, chunk_size })
    }

    fn compression(&self) -> Compression {
        if self.config.gzip {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    fn session_params(&self) -> Value {
        json!({
            "user": { "uid": self.config.uid },
            "audio": {
                "format": self.config.format,
                "rate": self.format.sample_rate,
                "bits": self.format.bits_per_sample,
                "channel": self.format.channels,
                "codec": self.config.codec,
                "language": self.config.language,
            },
            "request": {
                "model_name": "bigmodel",
                "enable_itn": self.config.enable_itn,
                "enable_punc": self.config.enable_punc,
                "enable_ddc": self.config.enable_ddc,
                "show_utterances": true,
                "result_type": "full",
            }
        })
    }

    fn handshake_request(&self, connect_id: &str) -> EngineResult<Request> {
        let mut request = self.config.ws_url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        for (name, value) in [
            ("x-api-app-key", self.config.app_key.as_str()),
            ("x-api-access-key", self.config.access_key.as_str()),
            ("x-api-resource-id", self.config.resource_id.as_str()),
            ("x-api-connect-id", connect_id),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Config(format!("invalid value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        Ok(request)
    }

    async fn connect(&self, connect_id: &str) -> EngineResult<Socket> {
        let request = self.handshake_request(connect_id)?;
        let (socket, response) = tokio_tungstenite::connect_async(request).await?;

        let log_id = response
            .headers()
            .get("X-Tt-Logid")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info!(connect_id, log_id, url = %self.config.ws_url, "connected to streaming recognizer");

        Ok(socket)
    }

    async fn stream_audio(&self, audio: &[u8]) -> EngineResult<String> {
        let connect_id = Uuid::new_v4().to_string();
        let mut socket = self.connect(&connect_id).await?;
        let compression = self.compression();
        let interim_timeout = Duration::from_millis(self.config.interim_read_timeout_ms);

        let request = Frame::full_client_request(&self.session_params(), compression)?;
        socket.send(Message::Binary(request.encode()?)).await?;

        match next_frame(&mut socket).await? {
            Some(frame) => {
                interpret(frame)?;
                debug!(connect_id, "recognition session accepted");
            }
            None => {
                return Err(EngineError::Transport(
                    "connection closed before the session was accepted".to_string(),
                ))
            }
        }

        let mut chunks = chunker::split(audio, self.chunk_size);
        if chunks.is_empty() {
            chunks.push(AudioChunk { data: &[], is_last: true });
        }
        let total = chunks.len();

        let mut transcript = Transcript::default();
        let mut finished = false;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let frame = Frame::audio_only(chunk.data.to_vec(), chunk.is_last, compression);
            socket.send(Message::Binary(frame.encode()?)).await?;

            if chunk.is_last {
                break;
            }

            match tokio::time::timeout(interim_timeout, next_frame(&mut socket)).await {
                Err(_) => {}
                Ok(Ok(Some(frame))) => {
                    let update = interpret(frame)?;
                    if update.is_last {
                        warn!(connect_id, sent = index + 1, total, "server finished before the last chunk");
                        transcript.push(update.text);
                        finished = true;
                        break;
                    }
                    transcript.interim(update.text);
                }
                Ok(Ok(None)) => {
                    return Err(EngineError::Transport(
                        "connection closed while streaming audio".to_string(),
                    ))
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        while !finished {
            match next_frame(&mut socket).await? {
                Some(frame) => {
                    let update = interpret(frame)?;
                    finished = update.is_last;
                    transcript.push(update.text);
                }
                None => break,
            }
        }

        if let Err(e) = socket.close(None).await {
            debug!(connect_id, error = %e, "closing recognition socket failed");
        }

        let text = transcript.into_text();
        info!(connect_id, chars = text.chars().count(), "streaming recognition finished");
        Ok(text)
    }
}

#[async_trait]
impl Recognizer for StreamingRecognizer {
    fn name(&self) -> &str {
        "volcengine"
    }

    async fn recognize(
        &self,
        audio: &[u8],
        _audio_url: Option<&str>,
        ctx: &RecognitionContext,
    ) -> EngineResult<String> {
        ctx.guard(self.stream_audio(audio)).await
    }
}

/// Next binary frame from the server, or `None` once the server has closed
/// the connection normally.
async fn next_frame(socket: &mut Socket) -> EngineResult<Option<Frame>> {
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Binary(data)) => return Frame::decode(&data).map(Some),
            Ok(Message::Close(close)) => {
                return match close {
                    Some(close) if close.code != CloseCode::Normal => Err(EngineError::Transport(format!(
                        "server closed the connection: {} {}",
                        u16::from(close.code),
                        close.reason
                    ))),
                    _ => Ok(None),
                };
            }
            Ok(Message::Text(text)) => warn!(%text, "ignoring text message from recognizer"),
            Ok(_) => {}
            Err(WsError::ConnectionClosed) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

fn interpret(frame: Frame) -> EngineResult<ServerUpdate> {
    match frame.message_type {
        MessageType::ServerErrorResponse => Err(EngineError::Backend {
            code: frame.error_code.map(i64::from).unwrap_or_default(),
            message: String::from_utf8_lossy(&frame.payload).into_owned(),
        }),
        MessageType::FullServerResponse => {
            let payload = frame.json()?;
            if let Some(err) = payload_error(&payload) {
                return Err(err);
            }
            Ok(ServerUpdate {
                text: extract_text(&payload),
                is_last: frame.is_last(),
            })
        }
        MessageType::ServerAck => Ok(ServerUpdate {
            text: None,
            is_last: frame.is_last(),
        }),
        other => Err(EngineError::MalformedFrame(format!(
            "unexpected {:?} frame from server",
            other
        ))),
    }
}

fn payload_error(payload: &Value) -> Option<EngineError> {
    let code = payload
        .get("error_code")
        .or_else(|| payload.get("code"))
        .and_then(Value::as_i64)?;
    if SUCCESS_CODES.contains(&code) {
        return None;
    }

    let message = payload
        .get("error_msg")
        .or_else(|| payload.get("error"))
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("recognition failed");
    Some(EngineError::Backend {
        code,
        message: message.to_string(),
    })
}

/// Text carried by a response, found under `result.text`, a `result` array, or a
/// top-level `text`, optionally wrapped in `payload_msg`.
fn extract_text(payload: &Value) -> Option<String> {
    let body = payload.get("payload_msg").unwrap_or(payload);
    let text = match body.get("result") {
        Some(Value::Object(result)) => result.get("text").and_then(Value::as_str).map(str::to_string),
        Some(Value::Array(items)) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            Some(parts.concat())
        }
        _ => body.get("text").and_then(Value::as_str).map(str::to_string),
    };
    text.filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, Serialization};
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as ServerRequest, Response};

    type ServerSocket = WebSocketStream<TcpStream>;

    fn test_config(url: String) -> StreamingConfig {
        let mut config = crate::config::AppConfig::default().recognition.streaming;
        config.ws_url = url;
        config.app_key = "app-key".to_string();
        config.access_key = "access-key".to_string();
        config.interim_read_timeout_ms = 20;
        config
    }

    fn recognizer(url: String) -> StreamingRecognizer {
        StreamingRecognizer::new(test_config(url), AudioFormat::default(), 3200).unwrap()
    }

    fn server_response(sequence: i32, body: Value) -> Vec<u8> {
        Frame {
            message_type: MessageType::FullServerResponse,
            flags: if sequence < 0 { flags::NEGATIVE_SEQUENCE } else { flags::POSITIVE_SEQUENCE },
            serialization: Serialization::Json,
            compression: Compression::Gzip,
            sequence: Some(sequence),
            error_code: None,
            payload: serde_json::to_vec(&body).unwrap(),
        }
        .encode()
        .unwrap()
    }

    async fn read_frame(ws: &mut ServerSocket) -> Option<Frame> {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Binary(data) = message {
                return Some(Frame::decode(&data).unwrap());
            }
        }
        None
    }

    /// Accepts one connection, records the app key header, and hands the socket to `handler`.
    async fn spawn_server<F, Fut>(handler: F) -> (String, Arc<Mutex<Option<String>>>)
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app_key = Arc::new(Mutex::new(None));
        let seen = app_key.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &ServerRequest, resp: Response| {
                *seen.lock().unwrap() = req
                    .headers()
                    .get("X-Api-App-Key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok::<_, ErrorResponse>(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            handler(ws).await;
        });

        (format!("ws://{}", addr), app_key)
    }

    #[tokio::test]
    async fn test_streams_chunks_and_collects_final_text() {
        let (received_tx, received_rx) = oneshot::channel();

        let (url, app_key) = spawn_server(|mut ws| async move {
            let request = read_frame(&mut ws).await.unwrap();
            let params = request.json().unwrap();
            ws.send(Message::Binary(server_response(1, json!({})))).await.unwrap();

            let mut frames = Vec::new();
            while let Some(frame) = read_frame(&mut ws).await {
                let last = frame.is_last();
                frames.push(frame);
                if last {
                    break;
                }
            }

            ws.send(Message::Binary(server_response(2, json!({"result": {"text": "hello "}}))))
                .await
                .unwrap();
            ws.send(Message::Binary(server_response(-3, json!({"result": {"text": "world"}}))))
                .await
                .unwrap();
            let _ = received_tx.send((request.message_type, params, frames));
            let _ = ws.close(None).await;
        })
        .await;

        let audio: Vec<u8> = (0..8000u32).map(|i| (i % 200) as u8).collect();
        let ctx = RecognitionContext::detached(Duration::from_secs(5));
        let text = recognizer(url).recognize(&audio, None, &ctx).await.unwrap();
        assert_eq!(text, "hello world");

        let (request_type, params, frames) = received_rx.await.unwrap();
        assert_eq!(request_type, MessageType::FullClientRequest);
        assert_eq!(params["request"]["model_name"], "bigmodel");
        assert_eq!(params["audio"]["rate"], 16000);
        assert_eq!(app_key.lock().unwrap().as_deref(), Some("app-key"));

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.message_type == MessageType::AudioOnlyRequest));
        assert_eq!(frames.iter().filter(|f| f.is_last()).count(), 1);
        assert!(frames[2].is_last());
        let sent: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(sent, audio);
    }

    #[tokio::test]
    async fn test_falls_back_to_latest_interim_text() {
        let (url, _) = spawn_server(|mut ws| async move {
            read_frame(&mut ws).await.unwrap();
            ws.send(Message::Binary(server_response(1, json!({})))).await.unwrap();

            let mut sequence = 2;
            while let Some(frame) = read_frame(&mut ws).await {
                if frame.is_last() {
                    break;
                }
                let text = if sequence == 2 { "good" } else { "good morning" };
                ws.send(Message::Binary(server_response(sequence, json!({"result": {"text": text}}))))
                    .await
                    .unwrap();
                sequence += 1;
            }

            ws.send(Message::Binary(server_response(-sequence, json!({})))).await.unwrap();
            let _ = ws.close(None).await;
        })
        .await;

        let mut config = test_config(url);
        config.interim_read_timeout_ms = 2000;
        let recognizer = StreamingRecognizer::new(config, AudioFormat::default(), 3200).unwrap();

        let ctx = RecognitionContext::detached(Duration::from_secs(10));
        let text = recognizer.recognize(&[0u8; 8000], None, &ctx).await.unwrap();
        assert_eq!(text, "good morning");
    }

    #[tokio::test]
    async fn test_error_frame_aborts() {
        let (url, _) = spawn_server(|mut ws| async move {
            read_frame(&mut ws).await.unwrap();
            let error = Frame {
                message_type: MessageType::ServerErrorResponse,
                flags: flags::NO_SEQUENCE,
                serialization: Serialization::None,
                compression: Compression::None,
                sequence: None,
                error_code: Some(45_000_001),
                payload: b"invalid request parameters".to_vec(),
            };
            ws.send(Message::Binary(error.encode().unwrap())).await.unwrap();
            let _ = ws.close(None).await;
        })
        .await;

        let ctx = RecognitionContext::detached(Duration::from_secs(5));
        let err = recognizer(url).recognize(&[0u8; 6400], None, &ctx).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Backend {
                code: 45_000_001,
                message: "invalid request parameters".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_connection_drop_is_reported() {
        let (url, _) = spawn_server(|mut ws| async move {
            read_frame(&mut ws).await.unwrap();
            ws.send(Message::Binary(server_response(1, json!({})))).await.unwrap();
            drop(ws);
        })
        .await;

        let ctx = RecognitionContext::detached(Duration::from_secs(5));
        let err = recognizer(url).recognize(&[0u8; 3200], None, &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_silent_server_hits_deadline() {
        let (url, _) = spawn_server(|mut ws| async move {
            read_frame(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let ctx = RecognitionContext::detached(Duration::from_millis(200));
        let err = recognizer(url).recognize(&[0u8; 3200], None, &ctx).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(200)));
    }

    #[test]
    fn test_payload_error_codes() {
        assert_eq!(payload_error(&json!({"code": 20000000})), None);
        assert_eq!(
            payload_error(&json!({"error_code": 1013, "error": "audio too long"})),
            Some(EngineError::Backend { code: 1013, message: "audio too long".into() })
        );
        assert_eq!(
            payload_error(&json!({"error_code": 45000081, "error_msg": "audio too short"})),
            Some(EngineError::Backend { code: 45000081, message: "audio too short".into() })
        );
        assert_eq!(
            payload_error(&json!({"code": 55000000})),
            Some(EngineError::Backend { code: 55000000, message: "recognition failed".into() })
        );
    }

    #[test]
    fn test_extract_text_shapes() {
        assert_eq!(extract_text(&json!({"result": {"text": "a"}})), Some("a".into()));
        assert_eq!(extract_text(&json!({"payload_msg": {"result": {"text": "b"}}})), Some("b".into()));
        assert_eq!(extract_text(&json!({"result": [{"text": "c"}, {"text": "d"}]})), Some("cd".into()));
        assert_eq!(extract_text(&json!({"text": ""})), None);
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let err = StreamingRecognizer::new(test_config("https://example.com".into()), AudioFormat::default(), 3200)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
