//! Local filesystem storage.
//!
//! Files are named `audio_<uuid>.wav` inside the configured directory and
//! addressed as `<public_base_url>/<name>`.

use super::AudioStore;
use crate::audio::AudioFormat;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

pub struct LocalAudioStore {
    directory: PathBuf,
    public_base_url: String,
    format: AudioFormat,
    wrap_wav: bool,
}

impl LocalAudioStore {
    pub fn new(directory: impl Into<PathBuf>, public_base_url: &str, format: AudioFormat, wrap_wav: bool) -> Self {
        Self {
            directory: directory.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            format,
            wrap_wav,
        }
    }
}

/// Whether `name` is a plain file name this store could have produced.
pub fn is_stored_file_name(name: &str) -> bool {
    name.starts_with("audio_")
        && name.ends_with(".wav")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.contains("..")
}

#[async_trait]
impl AudioStore for LocalAudioStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn store_audio(&self, audio: &[u8]) -> EngineResult<String> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| EngineError::Storage(format!("cannot create {}: {}", self.directory.display(), e)))?;

        let file_name = format!("audio_{}.wav", Uuid::new_v4());
        let path = self.directory.join(&file_name);
        let contents = if self.wrap_wav {
            self.format.wrap_wav(audio)
        } else {
            audio.to_vec()
        };

        tokio::fs::write(&path, &contents)
            .await
            .map_err(|e| EngineError::Storage(format!("cannot write {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), bytes = contents.len(), "audio stored");
        Ok(format!("{}/{}", self.public_base_url, file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{is_wav, WAV_HEADER_LEN};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("voiceflow-store-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_store_writes_wav_and_builds_url() {
        let dir = scratch_dir();
        let store = LocalAudioStore::new(&dir, "http://host:1/audio_files/", AudioFormat::default(), true);

        let url = store.store_audio(&[1u8; 320]).await.unwrap();
        let name = url.strip_prefix("http://host:1/audio_files/").unwrap();
        assert!(is_stored_file_name(name));

        let written = std::fs::read(dir.join(name)).unwrap();
        assert!(is_wav(&written));
        assert_eq!(written.len(), WAV_HEADER_LEN + 320);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_store_raw_when_wrapping_is_off() {
        let dir = scratch_dir();
        let store = LocalAudioStore::new(&dir, "http://host", AudioFormat::default(), false);

        let url = store.store_audio(&[7u8; 10]).await.unwrap();
        let name = url.rsplit('/').next().unwrap();
        assert_eq!(std::fs::read(dir.join(name)).unwrap(), vec![7u8; 10]);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_a_storage_error() {
        let blocker = std::env::temp_dir().join(format!("voiceflow-file-{}", Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = LocalAudioStore::new(blocker.join("nested"), "http://host", AudioFormat::default(), true);
        let err = store.store_audio(&[0u8; 4]).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        std::fs::remove_file(blocker).unwrap();
    }

    #[test]
    fn test_file_name_filter() {
        assert!(is_stored_file_name("audio_0b7c-11.wav"));
        assert!(!is_stored_file_name("../audio_x.wav"));
        assert!(!is_stored_file_name("audio_x.wav/../../etc"));
        assert!(!is_stored_file_name("config.toml"));
    }
}
