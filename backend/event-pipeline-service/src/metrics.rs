use std::time::Duration;

use actix_web::HttpResponse;
use event_queue::QueueStats;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
    Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_http_requests_total",
            "Total HTTP requests handled by event-pipeline-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create event_pipeline_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "event_pipeline_http_request_duration_seconds",
            "HTTP request latency for event-pipeline-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create event_pipeline_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register event_pipeline_http_request_duration_seconds");
    histogram
});

/// Events accepted into the queue, by endpoint.
pub static EVENTS_INGESTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_events_ingested_total",
            "Events accepted and appended to the queue",
        ),
        &["endpoint"],
    )
    .expect("failed to create event_pipeline_events_ingested_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_events_ingested_total");
    counter
});

/// Events refused at ingestion, by reason (`validation`, `malformed`,
/// `too_large`, `queue_unavailable`).
pub static EVENTS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_events_rejected_total",
            "Events rejected by the ingestion endpoint",
        ),
        &["reason"],
    )
    .expect("failed to create event_pipeline_events_rejected_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_events_rejected_total");
    counter
});

pub static BATCHES_CLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "event_pipeline_batches_claimed_total",
        "Non-empty batches claimed by consumers",
    )
    .expect("failed to create event_pipeline_batches_claimed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_batches_claimed_total");
    counter
});

pub static BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("event_pipeline_batch_size", "Events per claimed batch")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
    )
    .expect("failed to create event_pipeline_batch_size");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register event_pipeline_batch_size");
    histogram
});

/// Per-event consumer outcomes: processed, duplicate, retried, dead_lettered.
pub static EVENTS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_events_consumed_total",
            "Claimed events by processing outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create event_pipeline_events_consumed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_events_consumed_total");
    counter
});

pub static CONSUMER_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_consumer_transitions_total",
            "Batch consumer state transitions, by target state",
        ),
        &["state"],
    )
    .expect("failed to create event_pipeline_consumer_transitions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_consumer_transitions_total");
    counter
});

/// Queue store failures seen by the consumer, by operation.
pub static QUEUE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_pipeline_queue_errors_total",
            "Queue store operation failures",
        ),
        &["operation"],
    )
    .expect("failed to create event_pipeline_queue_errors_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_queue_errors_total");
    counter
});

pub static EVENT_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "event_pipeline_event_latency_seconds",
            "Time from ingestion to committed business effect",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("failed to create event_pipeline_event_latency_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register event_pipeline_event_latency_seconds");
    histogram
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "event_pipeline_queue_depth",
            "Entries per queue buffer at last observation",
        ),
        &["buffer"],
    )
    .expect("failed to create event_pipeline_queue_depth");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register event_pipeline_queue_depth");
    gauge
});

pub static DASHBOARD_UPDATE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "event_pipeline_dashboard_update_failures_total",
        "Dashboard updates that could not be delivered",
    )
    .expect("failed to create event_pipeline_dashboard_update_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_pipeline_dashboard_update_failures_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn record_consumed(outcome: &str) {
    EVENTS_CONSUMED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_queue_error(operation: &str) {
    QUEUE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn set_queue_depth(stats: &QueueStats) {
    QUEUE_DEPTH
        .with_label_values(&["queued"])
        .set(stats.queued as i64);
    QUEUE_DEPTH
        .with_label_values(&["in_flight"])
        .set(stats.in_flight as i64);
    QUEUE_DEPTH
        .with_label_values(&["delayed"])
        .set(stats.delayed as i64);
    QUEUE_DEPTH
        .with_label_values(&["dead_lettered"])
        .set(stats.dead_lettered as i64);
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        // Matched route pattern keeps label cardinality bounded.
        let path = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
