//! # Provider Registry
//!
//! Maps the provider names used in configuration to constructors for the three
//! pluggable collaborators of a voice session:
//!
//! | Concern     | Names                                          |
//! |-------------|------------------------------------------------|
//! | recognition | `volcengine` / `streaming`, `assemblyai` / `polling`, `mock` |
//! | storage     | `local`, `memory`                              |
//! | synthesis   | `espeak`, `disabled`                           |
//!
//! [`ProviderRegistry::build`] turns an [`AppConfig`] into a [`Providers`] bundle.
//! The bundle is immutable; switching providers at runtime builds a new one and
//! swaps it in `AppState`, so sessions already being dispatched keep the set they
//! started with.

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::recognition::mock::MockRecognizer;
use crate::recognition::polling::PollingRecognizer;
use crate::recognition::streaming::StreamingRecognizer;
use crate::recognition::Recognizer;
use crate::storage::local::LocalAudioStore;
use crate::storage::memory::MemoryAudioStore;
use crate::storage::AudioStore;
use crate::synthesis::{CommandSynthesizer, DisabledSynthesizer, Synthesizer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

type RecognizerFactory = fn(&AppConfig) -> EngineResult<Arc<dyn Recognizer>>;
type StoreFactory = fn(&AppConfig) -> EngineResult<Arc<dyn AudioStore>>;
type SynthesizerFactory = fn(&AppConfig) -> EngineResult<Arc<dyn Synthesizer>>;

const MOCK_LATENCY: Duration = Duration::from_millis(200);

/// The collaborators a connection dispatches finalized sessions to.
#[derive(Clone)]
pub struct Providers {
    pub recognizer: Arc<dyn Recognizer>,
    pub store: Arc<dyn AudioStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Names of the active providers, as reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSummary {
    pub recognition: String,
    pub storage: String,
    pub synthesis: String,
}

impl Providers {
    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            recognition: self.recognizer.name().to_string(),
            storage: self.store.name().to_string(),
            synthesis: self.synthesizer.name().to_string(),
        }
    }
}

pub struct ProviderRegistry {
    recognizers: BTreeMap<&'static str, RecognizerFactory>,
    stores: BTreeMap<&'static str, StoreFactory>,
    synthesizers: BTreeMap<&'static str, SynthesizerFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            recognizers: BTreeMap::new(),
            stores: BTreeMap::new(),
            synthesizers: BTreeMap::new(),
        };

        registry.register_recognizer("volcengine", streaming_recognizer);
        registry.register_recognizer("streaming", streaming_recognizer);
        registry.register_recognizer("assemblyai", polling_recognizer);
        registry.register_recognizer("polling", polling_recognizer);
        registry.register_recognizer("mock", mock_recognizer);

        registry.register_store("local", local_store);
        registry.register_store("memory", memory_store);

        registry.register_synthesizer("espeak", command_synthesizer);
        registry.register_synthesizer("disabled", disabled_synthesizer);

        registry
    }
}

fn streaming_recognizer(config: &AppConfig) -> EngineResult<Arc<dyn Recognizer>> {
    let recognizer = StreamingRecognizer::new(
        config.recognition.streaming.clone(),
        config.audio.format(),
        config.audio.chunk_size(),
    )?;
    Ok(Arc::new(recognizer))
}

fn polling_recognizer(config: &AppConfig) -> EngineResult<Arc<dyn Recognizer>> {
    let recognizer = PollingRecognizer::from_config(config.recognition.polling.clone(), config.audio.format())?;
    Ok(Arc::new(recognizer))
}

fn mock_recognizer(config: &AppConfig) -> EngineResult<Arc<dyn Recognizer>> {
    Ok(Arc::new(MockRecognizer::new(config.audio.format(), MOCK_LATENCY)))
}

fn local_store(config: &AppConfig) -> EngineResult<Arc<dyn AudioStore>> {
    let storage = &config.storage;
    Ok(Arc::new(LocalAudioStore::new(
        &storage.directory,
        &storage.public_base_url,
        config.audio.format(),
        storage.wrap_wav,
    )))
}

fn memory_store(_config: &AppConfig) -> EngineResult<Arc<dyn AudioStore>> {
    Ok(Arc::new(MemoryAudioStore::new()))
}

fn command_synthesizer(config: &AppConfig) -> EngineResult<Arc<dyn Synthesizer>> {
    let synthesis = &config.synthesis;
    Ok(Arc::new(CommandSynthesizer::new(&synthesis.command, &synthesis.voice)))
}

fn disabled_synthesizer(_config: &AppConfig) -> EngineResult<Arc<dyn Synthesizer>> {
    Ok(Arc::new(DisabledSynthesizer))
}

impl ProviderRegistry {
    pub fn register_recognizer(&mut self, name: &'static str, factory: RecognizerFactory) {
        self.recognizers.insert(name, factory);
    }

    pub fn register_store(&mut self, name: &'static str, factory: StoreFactory) {
        self.stores.insert(name, factory);
    }

    pub fn register_synthesizer(&mut self, name: &'static str, factory: SynthesizerFactory) {
        self.synthesizers.insert(name, factory);
    }

    /// Fail with `Config` when any configured provider name is unknown.
    pub fn check(&self, config: &AppConfig) -> EngineResult<()> {
        lookup(&self.recognizers, "recognition", &config.recognition.provider)?;
        lookup(&self.stores, "storage", &config.storage.provider)?;
        lookup(&self.synthesizers, "synthesis", &config.synthesis.provider)?;
        Ok(())
    }

    pub fn build(&self, config: &AppConfig) -> EngineResult<Providers> {
        let recognizer = lookup(&self.recognizers, "recognition", &config.recognition.provider)?;
        let store = lookup(&self.stores, "storage", &config.storage.provider)?;
        let synthesizer = lookup(&self.synthesizers, "synthesis", &config.synthesis.provider)?;

        Ok(Providers {
            recognizer: recognizer(config)?,
            store: store(config)?,
            synthesizer: synthesizer(config)?,
        })
    }
}

fn lookup<F: Copy>(table: &BTreeMap<&'static str, F>, kind: &str, name: &str) -> EngineResult<F> {
    table.get(name).copied().ok_or_else(|| {
        let known: Vec<&str> = table.keys().copied().collect();
        EngineError::Config(format!(
            "unknown {} provider '{}' (expected one of: {})",
            kind,
            name,
            known.join(", ")
        ))
    })
}

/// Check provider names against the built-in registry.
pub fn check_names(config: &AppConfig) -> EngineResult<()> {
    ProviderRegistry::default().check(config)
}
