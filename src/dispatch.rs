//! # Result Dispatcher
//!
//! Takes a finalized session off the connection's hands and reports what became
//! of it. Two tasks run per session:
//!
//! - **store**: persist the audio, then emit `audio_stored` or `storage_error`
//! - **recognize**: transcribe the audio, then emit `recognition_complete` or
//!   `recognition_error`
//!
//! Each task emits its own outcome the moment it has one, so neither waits for
//! the other. A supervisor joins both and emits the missing outcome if a task
//! panicked, which keeps the contract of exactly one storage outcome and exactly
//! one recognition outcome per finalized session.
//!
//! ## Reusing the stored URL
//! Recognizers that work from a URL would otherwise upload the same audio a
//! second time. With `recognition.polling.reuse_stored_url` set, the recognize
//! task waits for the store task's URL and passes it along; if storage fails it
//! falls back to the recognizer's own upload. The store task never waits on
//! recognition.
//!
//! Outbound messages travel over an unbounded channel to the connection actor,
//! which serializes them as JSON text frames.

use crate::audio::{FinalizedSession, SessionState};
use crate::error::{EngineError, EngineResult};
use crate::providers::Providers;
use crate::recognition::RecognitionContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages sent to the client as JSON text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    AudioStored {
        session_id: String,
        audio_url: String,
    },
    StorageError {
        session_id: String,
        error: String,
    },
    RecognitionComplete {
        session_id: String,
        text: String,
    },
    RecognitionError {
        session_id: String,
        error: String,
    },
    /// A rejected control message or audio frame.
    SessionError {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: String,
        error: String,
    },
    TextReply {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
    },
}

impl OutboundMessage {
    pub fn session_error(session_id: Option<&str>, err: &EngineError) -> Self {
        OutboundMessage::SessionError {
            session_id: session_id.map(str::to_string),
            code: err.code().to_string(),
            error: err.to_string(),
        }
    }

    /// The `type` tag, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::AudioStored { .. } => "audio_stored",
            OutboundMessage::StorageError { .. } => "storage_error",
            OutboundMessage::RecognitionComplete { .. } => "recognition_complete",
            OutboundMessage::RecognitionError { .. } => "recognition_error",
            OutboundMessage::SessionError { .. } => "session_error",
            OutboundMessage::TextReply { .. } => "text_reply",
        }
    }
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;

/// What the supervisor saw once both tasks of a session finished.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub session_id: String,
    pub audio_url: Option<String>,
    pub transcript: Option<String>,
    pub state: SessionState,
}

#[derive(Clone)]
pub struct ResultDispatcher {
    providers: Arc<Providers>,
    outbound: OutboundSender,
    recognition_timeout: Duration,
    cancel: watch::Receiver<bool>,
    reuse_stored_url: bool,
}

fn emit(outbound: &OutboundSender, message: OutboundMessage) {
    let kind = message.kind();
    if outbound.send(message).is_err() {
        debug!(kind, "connection gone, dropping outbound message");
    }
}

impl ResultDispatcher {
    /// `cancel` flips to `true` when the connection closes; it stops in-flight
    /// recognitions but not storage.
    pub fn new(
        providers: Arc<Providers>,
        outbound: OutboundSender,
        recognition_timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            providers,
            outbound,
            recognition_timeout,
            cancel,
            reuse_stored_url: false,
        }
    }

    pub fn with_reuse_stored_url(mut self, reuse: bool) -> Self {
        self.reuse_stored_url = reuse;
        self
    }

    pub fn dispatch(&self, session: FinalizedSession) -> JoinHandle<DispatchReport> {
        let started = Instant::now();

        let wants_url = self.reuse_stored_url && self.providers.recognizer.accepts_audio_url();
        let (url_tx, url_rx) = if wants_url {
            let (tx, rx) = oneshot::channel::<Option<String>>();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        info!(
            session_id = %session.session_id,
            bytes = session.audio.len(),
            chunks = session.chunks,
            session_ms = session.duration().num_milliseconds(),
            state = session.state.as_str(),
            recognizer = self.providers.recognizer.name(),
            store = self.providers.store.name(),
            reuse_stored_url = wants_url,
            "dispatching finalized session"
        );

        let session_id = session.session_id;
        let audio = Arc::new(session.audio);

        let store_task = tokio::spawn({
            let store = self.providers.store.clone();
            let audio = audio.clone();
            let outbound = self.outbound.clone();
            let session_id = session_id.clone();
            async move {
                let result = store.store_audio(&audio).await;
                if let Some(tx) = url_tx {
                    let _ = tx.send(result.as_ref().ok().cloned());
                }

                match &result {
                    Ok(audio_url) => {
                        info!(session_id = %session_id, %audio_url, "audio stored");
                        emit(&outbound, OutboundMessage::AudioStored {
                            session_id,
                            audio_url: audio_url.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "audio storage failed");
                        emit(&outbound, OutboundMessage::StorageError {
                            session_id,
                            error: e.to_string(),
                        });
                    }
                }
                result.ok()
            }
        });

        let recognize_task = tokio::spawn({
            let recognizer = self.providers.recognizer.clone();
            let ctx = RecognitionContext::new(self.recognition_timeout, self.cancel.clone());
            let outbound = self.outbound.clone();
            let session_id = session_id.clone();
            async move {
                let result = recognize(recognizer.as_ref(), &audio, url_rx, &ctx).await;

                match &result {
                    Ok(text) => {
                        info!(
                            session_id = %session_id,
                            chars = text.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "recognition complete"
                        );
                        emit(&outbound, OutboundMessage::RecognitionComplete {
                            session_id,
                            text: text.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, code = e.code(), error = %e, "recognition failed");
                        emit(&outbound, OutboundMessage::RecognitionError {
                            session_id,
                            error: e.to_string(),
                        });
                    }
                }
                result.ok()
            }
        });

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let (stored, recognized) = tokio::join!(store_task, recognize_task);

            let audio_url = stored.unwrap_or_else(|e| {
                error!(session_id = %session_id, error = %e, "storage task aborted");
                emit(&outbound, OutboundMessage::StorageError {
                    session_id: session_id.clone(),
                    error: format!("storage task aborted: {}", e),
                });
                None
            });
            let transcript = recognized.unwrap_or_else(|e| {
                error!(session_id = %session_id, error = %e, "recognition task aborted");
                emit(&outbound, OutboundMessage::RecognitionError {
                    session_id: session_id.clone(),
                    error: format!("recognition task aborted: {}", e),
                });
                None
            });

            let state = SessionState::Closed;
            debug!(
                session_id = %session_id,
                state = state.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "session dispatch finished"
            );
            DispatchReport {
                session_id,
                audio_url,
                transcript,
                state,
            }
        })
    }

    /// Answer a `text` message: echo the text, with a stored synthesis of it when
    /// `require_tts` is set. Synthesis or storage failures become `session_error`.
    pub fn reply_to_text(&self, text: String, require_tts: bool) -> JoinHandle<()> {
        let providers = self.providers.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            if !require_tts {
                emit(&outbound, OutboundMessage::TextReply { text, audio_url: None });
                return;
            }

            match speak(&providers, &text).await {
                Ok(audio_url) => {
                    emit(&outbound, OutboundMessage::TextReply {
                        text,
                        audio_url: Some(audio_url),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "text reply synthesis failed");
                    emit(&outbound, OutboundMessage::session_error(None, &e));
                }
            }
        })
    }
}

async fn recognize(
    recognizer: &dyn crate::recognition::Recognizer,
    audio: &[u8],
    url_rx: Option<oneshot::Receiver<Option<String>>>,
    ctx: &RecognitionContext,
) -> EngineResult<String> {
    let stored_url = match url_rx {
        Some(rx) => ctx.guard(async { Ok(rx.await.ok().flatten()) }).await?,
        None => None,
    };
    if stored_url.is_none() && recognizer.accepts_audio_url() {
        debug!("no stored url available, recognizer uploads the audio itself");
    }
    recognizer.recognize(audio, stored_url.as_deref(), ctx).await
}

async fn speak(providers: &Providers, text: &str) -> EngineResult<String> {
    let audio = providers.synthesizer.synthesize(text).await?;
    providers.store.store_audio(&audio).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::Recognizer;
    use crate::storage::memory::MemoryAudioStore;
    use crate::storage::AudioStore;
    use crate::synthesis::{DisabledSynthesizer, Synthesizer};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FixedRecognizer {
        text: Option<&'static str>,
        accepts_url: bool,
        seen_urls: Mutex<Vec<Option<String>>>,
    }

    impl FixedRecognizer {
        fn new(text: Option<&'static str>, accepts_url: bool) -> Arc<Self> {
            Arc::new(Self {
                text,
                accepts_url,
                seen_urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Recognizer for FixedRecognizer {
        fn name(&self) -> &str {
            "fixed"
        }

        fn accepts_audio_url(&self) -> bool {
            self.accepts_url
        }

        async fn recognize(&self, _audio: &[u8], audio_url: Option<&str>, _ctx: &RecognitionContext) -> EngineResult<String> {
            self.seen_urls.lock().unwrap().push(audio_url.map(str::to_string));
            match self.text {
                Some(text) => Ok(text.to_string()),
                None => Err(EngineError::Backend { code: 500, message: "boom".into() }),
            }
        }
    }

    struct FailingStore;

    #[async_trait]
    impl AudioStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn store_audio(&self, _audio: &[u8]) -> EngineResult<String> {
            Err(EngineError::Storage("disk full".into()))
        }
    }

    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        fn name(&self) -> &str {
            "echo"
        }

        async fn synthesize(&self, text: &str) -> EngineResult<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    fn finalized(session_id: &str) -> FinalizedSession {
        FinalizedSession {
            session_id: session_id.to_string(),
            audio: vec![0u8; 3200],
            chunks: 1,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            state: SessionState::Finalizing,
        }
    }

    fn dispatcher(
        recognizer: Arc<dyn Recognizer>,
        store: Arc<dyn AudioStore>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> (ResultDispatcher, mpsc::UnboundedReceiver<OutboundMessage>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let providers = Arc::new(Providers { recognizer, store, synthesizer });
        let dispatcher = ResultDispatcher::new(providers, tx, Duration::from_secs(5), cancel_rx);
        (dispatcher, rx, cancel_tx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn count(messages: &[OutboundMessage], kinds: &[&str]) -> usize {
        messages.iter().filter(|m| kinds.contains(&m.kind())).count()
    }

    #[tokio::test]
    async fn test_one_outcome_of_each_kind() {
        let (dispatcher, mut rx, _cancel) = dispatcher(
            FixedRecognizer::new(Some("hello"), false),
            Arc::new(MemoryAudioStore::new()),
            Arc::new(DisabledSynthesizer),
        );

        let report = dispatcher.dispatch(finalized("s1")).await.unwrap();
        assert_eq!(report.transcript.as_deref(), Some("hello"));
        assert_eq!(report.state, SessionState::Closed);
        assert!(report.audio_url.as_deref().unwrap().starts_with("memory://"));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(count(&messages, &["audio_stored", "storage_error"]), 1);
        assert!(messages.contains(&OutboundMessage::RecognitionComplete {
            session_id: "s1".into(),
            text: "hello".into(),
        }));
    }

    #[tokio::test]
    async fn test_storage_failure_still_reports_recognition() {
        let (dispatcher, mut rx, _cancel) = dispatcher(
            FixedRecognizer::new(Some("still here"), false),
            Arc::new(FailingStore),
            Arc::new(DisabledSynthesizer),
        );

        dispatcher.dispatch(finalized("s2")).await.unwrap();
        let messages = drain(&mut rx);

        assert_eq!(messages.len(), 2);
        assert!(messages.contains(&OutboundMessage::StorageError {
            session_id: "s2".into(),
            error: "storage error: disk full".into(),
        }));
        assert_eq!(count(&messages, &["recognition_complete"]), 1);
    }

    #[tokio::test]
    async fn test_both_failures_are_reported() {
        let (dispatcher, mut rx, _cancel) = dispatcher(
            FixedRecognizer::new(None, false),
            Arc::new(FailingStore),
            Arc::new(DisabledSynthesizer),
        );

        let report = dispatcher.dispatch(finalized("s3")).await.unwrap();
        assert_eq!(report.audio_url, None);
        assert_eq!(report.transcript, None);

        let messages = drain(&mut rx);
        assert_eq!(count(&messages, &["storage_error"]), 1);
        assert_eq!(count(&messages, &["recognition_error"]), 1);
    }

    #[tokio::test]
    async fn test_recognizer_reuses_stored_url() {
        let recognizer = FixedRecognizer::new(Some("ok"), true);
        let (dispatcher, mut rx, _cancel) = dispatcher(
            recognizer.clone(),
            Arc::new(MemoryAudioStore::new()),
            Arc::new(DisabledSynthesizer),
        );

        let report = dispatcher.with_reuse_stored_url(true).dispatch(finalized("s4")).await.unwrap();
        let seen = recognizer.seen_urls.lock().unwrap().clone();
        assert_eq!(seen, vec![report.audio_url.clone()]);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_storage_falls_back_to_own_upload() {
        let recognizer = FixedRecognizer::new(Some("ok"), true);
        let (dispatcher, _rx, _cancel) = dispatcher(recognizer.clone(), Arc::new(FailingStore), Arc::new(DisabledSynthesizer));

        dispatcher.with_reuse_stored_url(true).dispatch(finalized("s5")).await.unwrap();
        assert_eq!(recognizer.seen_urls.lock().unwrap().clone(), vec![None]);
    }

    #[tokio::test]
    async fn test_without_reuse_no_url_is_passed() {
        let recognizer = FixedRecognizer::new(Some("ok"), true);
        let (dispatcher, _rx, _cancel) = dispatcher(
            recognizer.clone(),
            Arc::new(MemoryAudioStore::new()),
            Arc::new(DisabledSynthesizer),
        );

        dispatcher.dispatch(finalized("s6")).await.unwrap();
        assert_eq!(recognizer.seen_urls.lock().unwrap().clone(), vec![None]);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_storage_outcome() {
        let (dispatcher, mut rx, cancel) = dispatcher(
            Arc::new(crate::recognition::mock::MockRecognizer::new(
                crate::audio::AudioFormat::default(),
                Duration::from_secs(30),
            )),
            Arc::new(MemoryAudioStore::new()),
            Arc::new(DisabledSynthesizer),
        );

        let handle = dispatcher.dispatch(finalized("s7"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.send(true).unwrap();
        handle.await.unwrap();

        let messages = drain(&mut rx);
        assert_eq!(count(&messages, &["audio_stored"]), 1);
        assert!(messages.contains(&OutboundMessage::RecognitionError {
            session_id: "s7".into(),
            error: EngineError::Cancelled.to_string(),
        }));
    }

    #[tokio::test]
    async fn test_text_replies() {
        let store = Arc::new(MemoryAudioStore::new());
        let (dispatcher, mut rx, _cancel) =
            dispatcher(FixedRecognizer::new(Some("x"), false), store.clone(), Arc::new(EchoSynthesizer));

        dispatcher.reply_to_text("plain".into(), false).await.unwrap();
        dispatcher.reply_to_text("spoken".into(), true).await.unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages[0], OutboundMessage::TextReply { text: "plain".into(), audio_url: None });
        match &messages[1] {
            OutboundMessage::TextReply { text, audio_url: Some(url) } => {
                assert_eq!(text, "spoken");
                assert_eq!(store.get(url).as_deref(), Some(&b"spoken"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_synthesis_is_a_session_error() {
        let (dispatcher, mut rx, _cancel) = dispatcher(
            FixedRecognizer::new(Some("x"), false),
            Arc::new(MemoryAudioStore::new()),
            Arc::new(DisabledSynthesizer),
        );

        dispatcher.reply_to_text("hi".into(), true).await.unwrap();
        match drain(&mut rx).pop() {
            Some(OutboundMessage::SessionError { session_id: None, code, .. }) => assert_eq!(code, "synthesis_error"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(OutboundMessage::AudioStored {
            session_id: "s".into(),
            audio_url: "u".into(),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"type": "audio_stored", "session_id": "s", "audio_url": "u"}));

        let value = serde_json::to_value(OutboundMessage::session_error(None, &EngineError::SessionNotFound("x".into()))).unwrap();
        assert_eq!(value["type"], "session_error");
        assert!(value.get("session_id").is_none());
    }
}
