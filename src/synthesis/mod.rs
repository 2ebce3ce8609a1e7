//! # Speech Synthesis
//!
//! Text-to-speech for `text` messages that ask for audio. The default provider
//! shells out to a local command (`espeak --stdout`) and returns the WAV it prints.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Render `text` to audio bytes.
    async fn synthesize(&self, text: &str) -> EngineResult<Vec<u8>>;
}

/// Runs `<command> -v <voice> --stdout <text>` and captures stdout.
pub struct CommandSynthesizer {
    command: String,
    voice: String,
}

impl CommandSynthesizer {
    pub fn new(command: &str, voice: &str) -> Self {
        Self {
            command: command.to_string(),
            voice: voice.to_string(),
        }
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    fn name(&self) -> &str {
        "espeak"
    }

    async fn synthesize(&self, text: &str) -> EngineResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(EngineError::Synthesis("nothing to synthesize".to_string()));
        }

        let output = Command::new(&self.command)
            .arg("-v")
            .arg(&self.voice)
            .arg("--stdout")
            .arg(text)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Synthesis(format!("cannot run {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Synthesis(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(EngineError::Synthesis(format!("{} produced no audio", self.command)));
        }

        debug!(bytes = output.stdout.len(), chars = text.len(), "speech synthesized");
        Ok(output.stdout)
    }
}

/// Selected when no synthesis back-end is available; every request fails.
pub struct DisabledSynthesizer;

#[async_trait]
impl Synthesizer for DisabledSynthesizer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn synthesize(&self, _text: &str) -> EngineResult<Vec<u8>> {
        Err(EngineError::Synthesis("speech synthesis is disabled".to_string()))
    }
}
