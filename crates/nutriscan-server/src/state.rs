//! Global application state shared across all handlers

use crate::limiter::RateGate;
use crate::metrics::Metrics;
use crate::ServerConfig;
use capstan::store::JobStore;
use capstan::BlobStore;
use nutriscan_parse::Pipeline;
use std::sync::Arc;
use tokio::sync::Notify;

/// Injected into every handler via axum's `State`
#[derive(Clone)]
pub struct AppState {
    /// Single source of truth for job state
    pub store: Arc<dyn JobStore>,
    pub blobs: Arc<BlobStore>,
    pub pipeline: Arc<Pipeline>,
    pub gate: Arc<RateGate>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<ServerConfig>,
    /// Nudges idle dispatcher slots after an enqueue
    pub wake: Arc<Notify>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<BlobStore>,
        pipeline: Arc<Pipeline>,
        gate: Arc<RateGate>,
        metrics: Arc<Metrics>,
        config: Arc<ServerConfig>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            blobs,
            pipeline,
            gate,
            metrics,
            config,
            wake,
        }
    }
}
