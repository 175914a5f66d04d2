use actix_web::error::JsonPayloadError;
use actix_web::web;
use event_queue::QueueStore;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::metrics;
use crate::services::{BusinessEffect, ConsumerStats};

pub mod dead_letters;
pub mod events;
pub mod health;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueStore>,
    pub consumer_stats: Arc<ConsumerStats>,
    pub effect: Arc<dyn BusinessEffect>,
}

/// JSON extractor settings: body size limit, and malformed bodies answered
/// with a 400 in the service's error format.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            if matches!(
                err,
                JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. }
            ) {
                metrics::EVENTS_REJECTED_TOTAL
                    .with_label_values(&["too_large"])
                    .inc();
                return err.into();
            }
            metrics::EVENTS_REJECTED_TOTAL
                .with_label_values(&["malformed"])
                .inc();
            PipelineError::BadRequest(format!("Invalid JSON body: {}", err)).into()
        })
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/webhook/events", web::post().to(events::ingest_event))
        .route("/webhook/batch", web::post().to(events::ingest_batch))
        .route("/health", web::get().to(health::liveness))
        .route("/health/ready", web::get().to(health::readiness))
        .route("/stats", web::get().to(health::stats))
        .route("/dead-letters", web::get().to(dead_letters::list_dead_letters))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}
