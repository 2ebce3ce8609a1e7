//! Local stand-in recognizer for development without provider credentials.

use super::{RecognitionContext, Recognizer};
use crate::audio::AudioFormat;
use crate::error::EngineResult;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Answers with a description of the audio it was given after a short delay.
pub struct MockRecognizer {
    format: AudioFormat,
    latency: Duration,
}

impl MockRecognizer {
    pub fn new(format: AudioFormat, latency: Duration) -> Self {
        Self { format, latency }
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn recognize(
        &self,
        audio: &[u8],
        _audio_url: Option<&str>,
        ctx: &RecognitionContext,
    ) -> EngineResult<String> {
        ctx.sleep(self.latency).await?;

        let duration = self.format.duration_of(audio.len());
        debug!(bytes = audio.len(), ?duration, "mock recognition");
        Ok(format!(
            "[mock transcript: {} bytes, {:.1}s of audio]",
            audio.len(),
            duration.as_secs_f64()
        ))
    }
}
