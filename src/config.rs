//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_RECOGNITION__PROVIDER`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names containing
//! a single underscore survive: `APP_RECOGNITION__TIMEOUT_SECS=30` sets
//! `recognition.timeout_secs`.
//!
//! ## Sections
//! - **server**: bind address
//! - **session**: per-connection limits and heartbeat
//! - **audio**: PCM format of the client stream and the streaming chunk duration
//! - **recognition**: active provider, deadline, and per-provider settings
//! - **storage**: where finalized audio is written and how its URL is formed
//! - **synthesis**: text-to-speech provider for text messages

use crate::audio::AudioFormat;
use crate::providers;
use crate::recognition::backoff::RetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub recognition: RecognitionConfig,
    pub storage: StorageConfig,
    pub synthesis: SynthesisConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Limits applied to every WebSocket connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Open sessions allowed per connection
    pub max_concurrent_sessions: usize,

    /// Upper bound of one session's audio buffer, in bytes
    pub max_buffer_bytes: usize,

    /// Interval between server pings
    pub heartbeat_interval_secs: u64,

    /// Connection is dropped when nothing was heard from the client for this long
    pub client_timeout_secs: u64,
}

/// Format of the PCM stream clients send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,

    /// Duration of each audio frame sent to the streaming recognizer
    pub chunk_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Registry name of the active recognizer (`volcengine`, `assemblyai`, `mock`, ...)
    pub provider: String,

    /// Deadline for one recognition, from `audio_end` to the final transcript
    pub timeout_secs: u64,

    pub streaming: StreamingConfig,
    pub polling: PollingConfig,
}

/// Settings for the WebSocket streaming recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub ws_url: String,
    pub app_key: String,
    pub access_key: String,
    pub resource_id: String,

    /// User id reported in the session parameters
    pub uid: String,

    /// Container format announced to the service (`pcm`, `wav`, ...)
    pub format: String,
    pub codec: String,
    pub language: String,

    pub enable_itn: bool,
    pub enable_punc: bool,
    pub enable_ddc: bool,

    /// Gzip the opening request and the audio frames
    pub gzip: bool,

    /// How long to wait for an interim response after each non-final chunk
    pub interim_read_timeout_ms: u64,
}

/// Settings for the upload-then-poll recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub base_url: String,
    pub api_key: String,

    /// Language used on the retry after a low-confidence detection
    pub default_language: String,

    /// Confidence threshold sent with the auto-detecting first attempt
    pub language_confidence_threshold: f64,

    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,

    /// Reuse the URL produced by storage instead of uploading a second copy
    pub reuse_stored_url: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registry name of the audio store (`local`, `memory`)
    pub provider: String,

    /// Directory the local store writes into
    pub directory: String,

    /// Prefix of the URLs handed back to clients
    pub public_base_url: String,

    /// Prefix stored PCM with a WAV header
    pub wrap_wav: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Registry name of the synthesizer (`espeak`, `disabled`)
    pub provider: String,

    /// Executable invoked by the command-line synthesizer
    pub command: String,
    pub voice: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 18080,
            },
            session: SessionConfig {
                max_concurrent_sessions: 4,
                max_buffer_bytes: 32 * 1024 * 1024, // ~17 minutes of 16 kHz mono
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                bits_per_sample: 16,
                channels: 1,
                chunk_duration_ms: 100,
            },
            recognition: RecognitionConfig {
                provider: "volcengine".to_string(),
                timeout_secs: 60,
                streaming: StreamingConfig {
                    ws_url: "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel".to_string(),
                    app_key: String::new(),
                    access_key: String::new(),
                    resource_id: "volc.bigasr.sauc.duration".to_string(),
                    uid: "voiceflow".to_string(),
                    format: "pcm".to_string(),
                    codec: "raw".to_string(),
                    language: "zh-CN".to_string(),
                    enable_itn: true,
                    enable_punc: true,
                    enable_ddc: false,
                    gzip: true,
                    interim_read_timeout_ms: 500,
                },
                polling: PollingConfig {
                    base_url: "https://api.assemblyai.com".to_string(),
                    api_key: String::new(),
                    default_language: "en".to_string(),
                    language_confidence_threshold: 0.4,
                    initial_backoff_ms: 100,
                    max_backoff_ms: 2000,
                    backoff_multiplier: 1.5,
                    reuse_stored_url: false,
                },
            },
            storage: StorageConfig {
                provider: "local".to_string(),
                directory: "./audio_files".to_string(),
                public_base_url: "http://127.0.0.1:18080/audio_files".to_string(),
                wrap_wav: true,
            },
            synthesis: SynthesisConfig {
                provider: "espeak".to_string(),
                command: "espeak".to_string(),
                voice: "en".to_string(),
            },
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            channels: self.channels,
        }
    }

    /// Bytes per streaming chunk (3200 for 100 ms of the default format).
    pub fn chunk_size(&self) -> usize {
        self.format().chunk_size(Duration::from_millis(self.chunk_duration_ms))
    }
}

impl RecognitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PollingConfig {
    pub fn retry_policy(&self, max_elapsed: Option<Duration>) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_elapsed,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_RECOGNITION__PROVIDER=assemblyai`: Switch recognizer
    /// - `APP_RECOGNITION__POLLING__API_KEY=...`: Provider credential
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform overrides
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limits and heartbeat timings are usable
    /// - The audio format produces a non-empty chunk
    /// - Provider names are known to the registry
    /// - Backoff parameters grow and are capped sensibly
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.session.max_buffer_bytes == 0 {
            return Err(anyhow::anyhow!("Session buffer limit must be greater than 0"));
        }
        if self.session.heartbeat_interval_secs == 0
            || self.session.client_timeout_secs <= self.session.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be greater than 0"));
        }
        if self.audio.bits_per_sample == 0 || self.audio.bits_per_sample % 8 != 0 {
            return Err(anyhow::anyhow!(
                "Bits per sample must be a positive multiple of 8, got {}",
                self.audio.bits_per_sample
            ));
        }
        if self.audio.chunk_size() == 0 {
            return Err(anyhow::anyhow!("Chunk duration is too short to hold a single sample"));
        }

        if self.recognition.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Recognition timeout must be greater than 0"));
        }
        providers::check_names(self).map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let polling = &self.recognition.polling;
        if polling.initial_backoff_ms == 0 {
            return Err(anyhow::anyhow!("Initial backoff must be greater than 0"));
        }
        if polling.max_backoff_ms < polling.initial_backoff_ms {
            return Err(anyhow::anyhow!("Max backoff cannot be shorter than the initial backoff"));
        }
        if !(polling.backoff_multiplier >= 1.0) {
            return Err(anyhow::anyhow!("Backoff multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&polling.language_confidence_threshold) {
            return Err(anyhow::anyhow!("Language confidence threshold must be within 0.0..=1.0"));
        }

        Ok(())
    }

    /// Apply a partial update sent to `PUT /api/v1/config`.
    ///
    /// Only provider selection and a few tuning knobs can change at runtime; the
    /// bind address and credentials stay as loaded. The configuration is validated
    /// before this returns, and left untouched if validation fails.
    ///
    /// ```json
    /// {"recognition": {"provider": "assemblyai"}, "synthesis": {"provider": "disabled"}}
    /// ```
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(recognition) = partial.get("recognition") {
            if let Some(provider) = recognition.get("provider").and_then(|v| v.as_str()) {
                updated.recognition.provider = provider.to_string();
            }
            if let Some(timeout) = recognition.get("timeout_secs").and_then(|v| v.as_u64()) {
                updated.recognition.timeout_secs = timeout;
            }
            if let Some(reuse) = recognition
                .get("polling")
                .and_then(|p| p.get("reuse_stored_url"))
                .and_then(|v| v.as_bool())
            {
                updated.recognition.polling.reuse_stored_url = reuse;
            }
        }

        if let Some(provider) = partial
            .get("storage")
            .and_then(|s| s.get("provider"))
            .and_then(|v| v.as_str())
        {
            updated.storage.provider = provider.to_string();
        }

        if let Some(provider) = partial
            .get("synthesis")
            .and_then(|s| s.get("provider"))
            .and_then(|v| v.as_str())
        {
            updated.synthesis.provider = provider.to_string();
        }

        if let Some(session) = partial.get("session") {
            if let Some(limit) = session.get("max_buffer_bytes").and_then(|v| v.as_u64()) {
                updated.session.max_buffer_bytes = limit as usize;
            }
            if let Some(sessions) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.session.max_concurrent_sessions = sessions as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Configuration as JSON with credentials masked, for the config endpoints.
    pub fn redacted(&self) -> serde_json::Value {
        let mut copy = self.clone();
        mask(&mut copy.recognition.streaming.access_key);
        mask(&mut copy.recognition.streaming.app_key);
        mask(&mut copy.recognition.polling.api_key);
        serde_json::to_value(copy).unwrap_or(serde_json::Value::Null)
    }
}

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.chunk_size(), 3200);
        assert_eq!(config.recognition.polling.retry_policy(None).initial_backoff, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.provider = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.polling.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.client_timeout_secs = config.session.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"recognition": {"provider": "assemblyai", "polling": {"reuse_stored_url": true}}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.recognition.provider, "assemblyai");
        assert!(config.recognition.polling.reuse_stored_url);
        assert_eq!(config.server.port, 18080);
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"recognition": {"provider": "assemblyai"}, "synthesis": {"provider": "nope"}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let mut config = AppConfig::default();
        config.recognition.polling.api_key = "secret-key".to_string();

        let json = config.redacted();
        assert_eq!(json["recognition"]["polling"]["api_key"], "********");
        assert_eq!(json["recognition"]["streaming"]["access_key"], "");
        assert!(!json.to_string().contains("secret-key"));
    }
}
