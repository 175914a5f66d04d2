//! Ingestion handlers: validate, append to the queue, answer immediately.
//!
//! No deduplication happens here; resubmitting an identifier enqueues it
//! again and the consumer's ledger suppresses the second effect.

use actix_web::{web, HttpResponse};
use chrono::Utc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::AppState;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::models::{
    AcceptedResponse, BatchAcceptedResponse, BatchIngestRequest, BatchResults, IngestRequest,
    Rejection,
};

/// POST /webhook/events
pub async fn ingest_event(
    state: web::Data<AppState>,
    body: web::Json<IngestRequest>,
) -> Result<HttpResponse> {
    let started = Instant::now();

    let event = body.into_inner().into_event(Utc::now()).map_err(|e| {
        metrics::EVENTS_REJECTED_TOTAL
            .with_label_values(&["validation"])
            .inc();
        warn!(error = %e, "Rejected event");
        e
    })?;
    let event_id = event.event_id.clone();
    let event_type = event.event_type.clone();

    let entry = state.queue.append(event).await.map_err(|e| {
        metrics::EVENTS_REJECTED_TOTAL
            .with_label_values(&["queue_unavailable"])
            .inc();
        error!(event_id = %event_id, error = %e, "Failed to enqueue event");
        PipelineError::Queue(e)
    })?;

    metrics::EVENTS_INGESTED_TOTAL
        .with_label_values(&["single"])
        .inc();
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(
        event_id = %event_id,
        event_type = %event_type,
        entry_id = %entry.entry_id,
        latency_ms,
        "Event accepted"
    );

    Ok(HttpResponse::Accepted().json(AcceptedResponse {
        status: "accepted".to_string(),
        event_id,
        queued_at: Utc::now(),
        latency_ms,
    }))
}

/// POST /webhook/batch
pub async fn ingest_batch(
    state: web::Data<AppState>,
    body: web::Json<BatchIngestRequest>,
) -> Result<HttpResponse> {
    let items = body
        .into_inner()
        .events
        .filter(|events| !events.is_empty())
        .ok_or_else(|| {
            PipelineError::BadRequest("Request must contain a non-empty 'events' array".to_string())
        })?;

    let total_events = items.len();
    let received_at = Utc::now();
    let mut results = BatchResults::default();
    let mut accepted_ids = Vec::with_capacity(total_events);
    let mut rejections = Vec::new();

    for (index, raw) in items.into_iter().enumerate() {
        let parsed = serde_json::from_value::<IngestRequest>(raw)
            .map_err(|e| PipelineError::BadRequest(format!("Malformed event: {}", e)))
            .and_then(|request| request.into_event(received_at));

        let event = match parsed {
            Ok(event) => event,
            Err(e) => {
                metrics::EVENTS_REJECTED_TOTAL
                    .with_label_values(&["validation"])
                    .inc();
                results.rejected += 1;
                rejections.push(Rejection {
                    index,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let event_id = event.event_id.clone();
        if let Err(e) = state.queue.append(event).await {
            metrics::EVENTS_REJECTED_TOTAL
                .with_label_values(&["queue_unavailable"])
                .inc();
            error!(
                accepted = results.accepted,
                total_events,
                error = %e,
                "Queue store failed during batch ingestion"
            );
            return Err(PipelineError::BatchInterrupted {
                accepted: results.accepted,
                source: e,
            });
        }
        results.accepted += 1;
        accepted_ids.push(event_id);
    }

    metrics::EVENTS_INGESTED_TOTAL
        .with_label_values(&["batch"])
        .inc_by(results.accepted as u64);
    info!(
        total_events,
        accepted = results.accepted,
        rejected = results.rejected,
        "Batch ingested"
    );

    Ok(HttpResponse::Accepted().json(BatchAcceptedResponse {
        status: "processed".to_string(),
        results,
        total_events,
        accepted_ids,
        rejections,
    }))
}
