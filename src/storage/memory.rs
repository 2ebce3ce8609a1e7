//! In-process storage for development without a writable disk.

use super::AudioStore;
use crate::error::EngineResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryAudioStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up audio by the URL `store_audio` returned.
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let key = url.strip_prefix("memory://")?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store_audio(&self, audio: &[u8]) -> EngineResult<String> {
        let key = Uuid::new_v4().to_string();
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), audio.to_vec());
        Ok(format!("memory://{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_get() {
        let store = MemoryAudioStore::new();
        let url = store.store_audio(b"pcm").await.unwrap();

        assert!(url.starts_with("memory://"));
        assert_eq!(store.get(&url).as_deref(), Some(&b"pcm"[..]));
        assert_eq!(store.get("memory://missing"), None);
        assert_eq!(store.len(), 1);
    }
}
