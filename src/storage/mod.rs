//! # Audio Storage
//!
//! Persists finalized session audio and hands back a URL for it. The URL is
//! reported to the client in `audio_stored` and, for recognizers that work from a
//! URL, reused instead of uploading the audio a second time.
//!
//! - [`local`]: files on disk, served back under `/audio_files/`
//! - [`memory`]: in-process map, for development and tests

pub mod local;
pub mod memory;

use crate::error::EngineResult;
use async_trait::async_trait;

#[async_trait]
pub trait AudioStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `audio` (raw PCM of the session) and return where it can be fetched.
    async fn store_audio(&self, audio: &[u8]) -> EngineResult<String>;
}
