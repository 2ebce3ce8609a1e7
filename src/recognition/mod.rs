//! # Speech Recognition
//!
//! Turns a finalized session buffer into text through a remote service. Two
//! strategies implement the same [`Recognizer`] trait:
//!
//! - [`streaming`]: opens a WebSocket to the service and streams the audio as
//!   binary frames (see `crate::protocol`), collecting incremental results.
//! - [`polling`]: uploads a WAV file, submits a transcript job, and polls it with
//!   exponential backoff ([`backoff`]), retrying once with a fixed language when
//!   automatic language detection is not confident enough.
//!
//! [`mock`] answers locally and is meant for development without credentials.
//!
//! ## Deadlines and cancellation
//! Every call receives a [`RecognitionContext`] carrying the deadline for this
//! recognition and a cancellation signal fired when the client connection closes.
//! Long waits (network reads, poll sleeps) race against both through
//! [`RecognitionContext::guard`].

pub mod backoff;
pub mod mock;
pub mod polling;
pub mod streaming;

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A speech-to-text back-end.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Registry name, used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// Whether this recognizer can work from an already stored audio URL instead
    /// of receiving the bytes.
    fn accepts_audio_url(&self) -> bool {
        false
    }

    /// Recognize `audio` (raw PCM in the configured format).
    ///
    /// `audio_url` is a publicly reachable copy of the same audio, when the caller
    /// already has one. Implementations that cannot use it ignore it.
    async fn recognize(
        &self,
        audio: &[u8],
        audio_url: Option<&str>,
        ctx: &RecognitionContext,
    ) -> EngineResult<String>;
}

/// Deadline and cancellation for one recognition.
#[derive(Debug, Clone)]
pub struct RecognitionContext {
    deadline: Instant,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl RecognitionContext {
    /// `cancel` flips to `true` when the owning connection closes.
    pub fn new(timeout: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            cancel,
        }
    }

    /// A context that can only time out.
    #[cfg(test)]
    pub fn detached(timeout: Duration) -> Self {
        let (_sender, cancel) = watch::channel(false);
        Self::new(timeout, cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The full budget this context was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `fut` until it completes, the deadline passes, or the connection closes,
    /// whichever comes first.
    pub async fn guard<T, F>(&self, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = fut => result,
            _ = tokio::time::sleep_until(self.deadline) => Err(EngineError::Timeout(self.timeout)),
            _ = cancelled(&mut cancel) => Err(EngineError::Cancelled),
        }
    }

    /// Sleep for `delay`, failing early on cancellation or when the deadline falls
    /// inside the sleep.
    pub async fn sleep(&self, delay: Duration) -> EngineResult<()> {
        self.guard(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

/// Resolves once the flag reads `true`. A dropped sender means nobody can cancel
/// any more, so the future then stays pending.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
