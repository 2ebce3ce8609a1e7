//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Contents
//! - **config**: the active [`AppConfig`], replaceable at runtime
//! - **providers**: the recognizer, audio store and synthesizer built from it
//! - **metrics**: HTTP request counters plus voice session counters
//!
//! ## Arc<RwLock<T>> Pattern
//! Every mutable part sits behind `Arc<RwLock<T>>`: handlers read concurrently,
//! updates take the write lock briefly. Readers clone what they need (the config,
//! an `Arc<Providers>`) so no lock is held across an `.await`.
//!
//! ## Switching providers
//! [`AppState::update_config`] validates a partial update, builds the new provider
//! set through the registry, and only then swaps both config and providers.
//! Connections pick up the new set for the next session they finalize.

use crate::config::AppConfig;
use crate::dispatch::OutboundMessage;
use crate::error::{AppResult, EngineResult};
use crate::providers::{ProviderRegistry, Providers};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    providers: Arc<RwLock<Arc<Providers>>>,

    registry: Arc<ProviderRegistry>,

    /// Counters updated by the HTTP middleware and the WebSocket actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// HTTP requests answered with a 4xx or 5xx status
    pub error_count: u64,

    /// Open WebSocket connections
    pub active_connections: u32,

    pub sessions_started: u64,
    pub sessions_finalized: u64,
    pub audio_bytes_received: u64,

    pub audio_stored: u64,
    pub storage_errors: u64,
    pub recognitions_completed: u64,
    pub recognition_errors: u64,
    pub session_errors: u64,
    pub text_replies: u64,

    /// Key: route pattern with method (e.g. "GET /api/v1/health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one route.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the state and the initial provider set for `config`.
    pub fn new(config: AppConfig) -> EngineResult<Self> {
        Self::with_registry(config, ProviderRegistry::default())
    }

    pub fn with_registry(config: AppConfig, registry: ProviderRegistry) -> EngineResult<Self> {
        let providers = registry.build(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            providers: Arc::new(RwLock::new(Arc::new(providers))),
            registry: Arc::new(registry),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The provider set new sessions should be dispatched to.
    pub fn providers(&self) -> Arc<Providers> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a partial JSON update and rebuild the providers.
    ///
    /// Nothing changes unless the update validates and every provider builds.
    pub fn update_config(&self, json_str: &str) -> AppResult<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);

        let mut candidate = config.clone();
        candidate.update_from_json(json_str)?;
        let providers = self.registry.build(&candidate)?;

        let summary = providers.summary();
        *self.providers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(providers);
        *config = candidate.clone();

        info!(
            recognition = %summary.recognition,
            storage = %summary.storage,
            synthesis = %summary.synthesis,
            "configuration updated"
        );
        Ok(candidate)
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn connection_opened(&self) {
        self.metrics_mut().active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics_mut();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    pub fn record_session_started(&self) {
        self.metrics_mut().sessions_started += 1;
    }

    pub fn record_session_finalized(&self) {
        self.metrics_mut().sessions_finalized += 1;
    }

    pub fn record_audio_received(&self, bytes: usize) {
        self.metrics_mut().audio_bytes_received += bytes as u64;
    }

    /// Count an outbound message by its kind.
    pub fn record_outbound(&self, message: &OutboundMessage) {
        let mut metrics = self.metrics_mut();
        match message {
            OutboundMessage::AudioStored { .. } => metrics.audio_stored += 1,
            OutboundMessage::StorageError { .. } => metrics.storage_errors += 1,
            OutboundMessage::RecognitionComplete { .. } => metrics.recognitions_completed += 1,
            OutboundMessage::RecognitionError { .. } => metrics.recognition_errors += 1,
            OutboundMessage::SessionError { .. } => metrics.session_errors += 1,
            OutboundMessage::TextReply { .. } => metrics.text_replies += 1,
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Share of finished recognitions that produced text.
    pub fn recognition_success_rate(&self) -> f64 {
        let finished = self.recognitions_completed + self.recognition_errors;
        if finished > 0 {
            self.recognitions_completed as f64 / finished as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
