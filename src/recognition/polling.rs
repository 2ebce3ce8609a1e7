//! # Upload-and-Poll Recognizer
//!
//! Recognition through an asynchronous transcript API:
//!
//! 1. Make the audio reachable by URL: reuse the URL storage produced, or wrap the
//!    PCM in a WAV header and upload it.
//! 2. Submit a transcript job with automatic language detection and a confidence
//!    threshold.
//! 3. Poll the job with exponential backoff until it completes or fails.
//!
//! When the service rejects the job because language detection was not confident
//! enough, the job is submitted exactly once more with detection off and the
//! configured default language. No other failure is retried.
//!
//! The HTTP calls sit behind [`TranscriptApi`] so the job logic can be exercised
//! against a scripted API.

use super::backoff::Backoff;
use super::{RecognitionContext, Recognizer};
use crate::audio::AudioFormat;
use crate::config::PollingConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Body of a transcript submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptRequest {
    pub audio_url: String,
    pub punctuate: bool,
    pub format_text: bool,
    pub language_detection: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_confidence_threshold: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl TranscriptRequest {
    pub fn auto_detect(audio_url: &str, confidence_threshold: f64) -> Self {
        Self {
            audio_url: audio_url.to_string(),
            punctuate: true,
            format_text: true,
            language_detection: true,
            language_confidence_threshold: Some(confidence_threshold),
            language_code: None,
        }
    }

    pub fn with_language(audio_url: &str, language: &str) -> Self {
        Self {
            audio_url: audio_url.to_string(),
            punctuate: true,
            format_text: true,
            language_detection: false,
            language_confidence_threshold: None,
            language_code: Some(language.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// A transcript job as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptJob {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TranscriptJob {
    /// Take over a freshly polled snapshot of this job.
    ///
    /// Status only moves forward (queued, processing, then completed or error);
    /// a snapshot that would move it back, or any change after a terminal status,
    /// is ignored and `false` is returned.
    pub fn advance(&mut self, snapshot: TranscriptJob) -> bool {
        if self.status.is_terminal() || snapshot.status.rank() < self.status.rank() {
            return false;
        }
        self.status = snapshot.status;
        self.text = snapshot.text;
        self.error = snapshot.error;
        true
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

/// The transcript service's HTTP surface.
#[async_trait]
pub trait TranscriptApi: Send + Sync {
    /// Upload a WAV file and return the URL the service can fetch it from.
    async fn upload(&self, wav: Vec<u8>) -> EngineResult<String>;

    async fn submit(&self, request: &TranscriptRequest) -> EngineResult<TranscriptJob>;

    async fn fetch(&self, job_id: &str) -> EngineResult<TranscriptJob>;
}

/// [`TranscriptApi`] over HTTPS with `reqwest`.
pub struct HttpTranscriptApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTranscriptApi {
    pub fn new(base_url: &str, api_key: &str) -> EngineResult<Self> {
        url::Url::parse(base_url)
            .map_err(|e| EngineError::Config(format!("invalid transcript api url '{}': {}", base_url, e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v2/{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into an error, preferring the service's own message.
async fn check(response: reqwest::Response) -> EngineResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    if is_low_confidence(&message) {
        Err(EngineError::LowConfidence(message))
    } else {
        Err(EngineError::Backend {
            code: i64::from(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl TranscriptApi for HttpTranscriptApi {
    async fn upload(&self, wav: Vec<u8>) -> EngineResult<String> {
        let bytes = wav.len();
        let response = self
            .client
            .post(self.endpoint("upload"))
            .header("authorization", &self.api_key)
            .header("content-type", "application/octet-stream")
            .body(wav)
            .send()
            .await?;

        let upload: UploadResponse = check(response).await?.json().await?;
        debug!(bytes, "audio uploaded for transcription");
        Ok(upload.upload_url)
    }

    async fn submit(&self, request: &TranscriptRequest) -> EngineResult<TranscriptJob> {
        let response = self
            .client
            .post(self.endpoint("transcript"))
            .header("authorization", &self.api_key)
            .json(request)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    async fn fetch(&self, job_id: &str) -> EngineResult<TranscriptJob> {
        let response = self
            .client
            .get(self.endpoint(&format!("transcript/{}", job_id)))
            .header("authorization", &self.api_key)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }
}

fn is_low_confidence(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("confidence") && (lower.contains("below") || lower.contains("threshold"))
}

fn job_failure(message: String) -> EngineError {
    if is_low_confidence(&message) {
        EngineError::LowConfidence(message)
    } else {
        EngineError::Backend { code: 0, message }
    }
}

pub struct PollingRecognizer {
    api: Arc<dyn TranscriptApi>,
    format: AudioFormat,
    config: PollingConfig,
}

impl PollingRecognizer {
    pub fn new(api: Arc<dyn TranscriptApi>, format: AudioFormat, config: PollingConfig) -> Self {
        Self { api, format, config }
    }

    pub fn from_config(config: PollingConfig, format: AudioFormat) -> EngineResult<Self> {
        let api = HttpTranscriptApi::new(&config.base_url, &config.api_key)?;
        Ok(Self::new(Arc::new(api), format, config))
    }

    /// Submit one job and poll it to a terminal status.
    async fn transcribe(&self, request: &TranscriptRequest, ctx: &RecognitionContext) -> EngineResult<String> {
        let mut job = ctx.guard(self.api.submit(request)).await?;
        info!(
            job_id = %job.id,
            language_detection = request.language_detection,
            "transcript job submitted"
        );

        let mut backoff = Backoff::new(self.config.retry_policy(Some(ctx.remaining())));
        let mut polls = 0u32;

        loop {
            match job.status {
                JobStatus::Completed => {
                    info!(job_id = %job.id, polls, "transcript job completed");
                    return Ok(job.text.unwrap_or_default());
                }
                JobStatus::Error => {
                    let message = job.error.unwrap_or_else(|| "transcription failed".to_string());
                    return Err(job_failure(message));
                }
                JobStatus::Queued | JobStatus::Processing => {}
            }

            let delay = backoff
                .next_delay()
                .ok_or(EngineError::Timeout(ctx.timeout()))?;
            ctx.sleep(delay).await?;

            let snapshot = ctx.guard(self.api.fetch(&job.id)).await?;
            polls += 1;
            if !job.advance(snapshot) {
                debug!(job_id = %job.id, "ignoring out-of-order job status");
            }
        }
    }
}

#[async_trait]
impl Recognizer for PollingRecognizer {
    fn name(&self) -> &str {
        "assemblyai"
    }

    fn accepts_audio_url(&self) -> bool {
        true
    }

    async fn recognize(
        &self,
        audio: &[u8],
        audio_url: Option<&str>,
        ctx: &RecognitionContext,
    ) -> EngineResult<String> {
        let audio_url = match audio_url {
            Some(url) => url.to_string(),
            None => {
                let wav = self.format.wrap_wav(audio);
                ctx.guard(self.api.upload(wav)).await?
            }
        };

        let first = TranscriptRequest::auto_detect(&audio_url, self.config.language_confidence_threshold);
        match self.transcribe(&first, ctx).await {
            Err(EngineError::LowConfidence(detail)) => {
                warn!(
                    %detail,
                    language = %self.config.default_language,
                    "language detection not confident, retrying with default language"
                );
                let retry = TranscriptRequest::with_language(&audio_url, &self.config.default_language);
                self.transcribe(&retry, ctx).await
            }
            other => other,
        }
    }
}
