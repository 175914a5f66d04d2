use actix_web::{web, HttpResponse};
use chrono::Utc;
use tracing::warn;

use super::AppState;
use crate::error::Result;
use crate::metrics;
use crate::models::{HealthResponse, ReadinessResponse, StatsResponse};

/// GET /health
///
/// Liveness only; never touches the broker.
pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

/// GET /health/ready
pub async fn readiness(state: web::Data<AppState>) -> Result<HttpResponse> {
    state.queue.ping().await.map_err(|e| {
        warn!(error = %e, "Readiness check failed");
        e
    })?;
    let queue = state.queue.stats().await?;
    metrics::set_queue_depth(&queue);

    Ok(HttpResponse::Ok().json(ReadinessResponse {
        status: "ready".to_string(),
        queue,
        timestamp: Utc::now(),
    }))
}

/// GET /stats
pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let queue = state.queue.stats().await.ok();

    HttpResponse::Ok().json(StatsResponse {
        consumer: state.consumer_stats.snapshot(),
        business: state.effect.snapshot(),
        queue,
    })
}
