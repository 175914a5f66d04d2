//! Process supervisor.
//!
//! Validates configuration and broker reachability, then runs the ingestion
//! server and the batch consumers as independent tasks. A worker that dies is
//! logged and left down; the others keep running until shutdown.

use actix_web::{middleware, web, App, HttpServer};
use event_queue::{InMemoryQueueStore, QueueStore, RedisQueueStore};
use futures::FutureExt;
use idempotent_consumer::{IdempotencyGuard, IdempotencyLedger, InMemoryLedger, RedisLedger};
use redis_utils::RedisPool;
use std::any::Any;
use std::future::Future;
use std::net::TcpListener;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::config::{Config, QueueBackend};
use crate::error::{PipelineError, Result};
use crate::handlers::{self, AppState};
use crate::metrics::MetricsMiddleware;
use crate::services::{
    BatchConsumer, BusinessEffect, ConsumerStats, DashboardClient, SaasMetricsEffect,
};

const HTTP_WORKER: &str = "http";

type WorkerExit = (String, Result<()>);

/// The shared collaborators every worker is built from.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn QueueStore>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub effect: Arc<dyn BusinessEffect>,
}

impl Backends {
    /// Build the stores selected by `config.backend` and the SaaS metrics effect.
    pub async fn connect(config: &Config) -> Result<Self> {
        let dashboard = if config.dashboard.enabled {
            let client = DashboardClient::new(&config.dashboard.api_url).map_err(|e| {
                PipelineError::Config(format!("failed to build dashboard client: {}", e))
            })?;
            info!(url = %client.url(), "Dashboard updates enabled");
            Some(client)
        } else {
            None
        };
        let effect: Arc<dyn BusinessEffect> = Arc::new(SaasMetricsEffect::new(dashboard));

        match config.backend {
            QueueBackend::Redis => {
                let pool = RedisPool::connect(&config.broker).await.map_err(|e| {
                    PipelineError::Config(format!("queue store unreachable: {:#}", e))
                })?;
                Ok(Self {
                    queue: Arc::new(RedisQueueStore::new(pool.manager(), pool.namespace())),
                    ledger: Arc::new(RedisLedger::new(pool.manager(), pool.namespace())),
                    effect,
                })
            }
            QueueBackend::Memory => {
                warn!("Using in-memory queue backend; events are lost on restart and not shared between processes");
                Ok(Self::in_memory(effect))
            }
        }
    }

    pub fn in_memory(effect: Arc<dyn BusinessEffect>) -> Self {
        Self {
            queue: Arc::new(InMemoryQueueStore::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            effect,
        }
    }
}

/// A validated pipeline, ready to run.
pub struct Supervisor {
    config: Config,
    backends: Backends,
    stats: Arc<ConsumerStats>,
}

impl Supervisor {
    /// Check configuration, connect the configured backends and ping the queue
    /// store. Nothing is started when this fails.
    pub async fn validate(config: Config) -> Result<Self> {
        Self::check_config(&config)?;
        let backends = Backends::connect(&config).await?;
        Self::with_backends(config, backends).await
    }

    /// Same checks as [`Supervisor::validate`] against caller-provided backends.
    pub async fn with_backends(config: Config, backends: Backends) -> Result<Self> {
        Self::check_config(&config)?;
        backends
            .queue
            .ping()
            .await
            .map_err(|e| PipelineError::Config(format!("queue store unreachable: {}", e)))?;

        info!(
            backend = ?config.backend,
            broker = ?config.broker,
            consumer = ?config.consumer,
            "Configuration validated"
        );

        Ok(Self {
            config,
            backends,
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    fn check_config(config: &Config) -> Result<()> {
        let errors = config.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(errors.join("; ")))
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Bind the configured address and run until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let address = self.config.http.bind_address();
        let listener = TcpListener::bind(&address)?;
        self.run_with_listener(listener, shutdown).await
    }

    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Supervisor {
            config,
            backends,
            stats,
        } = self;
        let grace = config.shutdown_grace;

        let state = AppState {
            queue: backends.queue.clone(),
            consumer_stats: stats.clone(),
            effect: backends.effect.clone(),
        };
        let max_body_bytes = config.http.max_body_bytes;
        let local_addr = listener.local_addr()?;

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .app_data(handlers::json_config(max_body_bytes))
                .wrap(MetricsMiddleware)
                .wrap(middleware::Logger::default())
                .configure(handlers::register_routes)
        })
        .listen(listener)?
        .disable_signals()
        .shutdown_timeout(grace.as_secs().max(1))
        .run();
        let server_handle = server.handle();

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<WorkerExit> = JoinSet::new();

        tasks.spawn(async move {
            info!(address = %local_addr, "Ingestion endpoint listening");
            (HTTP_WORKER.to_string(), server.await.map_err(PipelineError::from))
        });

        let guard = IdempotencyGuard::new(backends.ledger.clone(), config.consumer.idempotency_ttl);
        for index in 0..config.consumer.consumers {
            let consumer = BatchConsumer::new(
                format!("consumer-{}", index),
                backends.queue.clone(),
                guard.clone(),
                backends.effect.clone(),
                config.consumer.clone(),
                stats.clone(),
                stop_rx.clone(),
            );
            let name = consumer.name().to_string();
            tasks.spawn(async move {
                let result = AssertUnwindSafe(consumer.run())
                    .catch_unwind()
                    .await
                    .map_err(|panic| PipelineError::Worker {
                        worker: name.clone(),
                        reason: panic_message(panic.as_ref()),
                    });
                (name, result)
            });
        }

        let mut first_error: Option<PipelineError> = None;
        let shutdown = shutdown;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(joined) => {
                            if let Some(fault) = worker_exited(joined, false) {
                                first_error.get_or_insert(fault);
                            }
                        }
                        None => {
                            error!("All workers have exited");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let deadline = Instant::now() + grace;
        let _ = stop_tx.send(true);
        server_handle.stop(true).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = tokio::time::timeout(remaining, async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(fault) = worker_exited(joined, true) {
                    first_error.get_or_insert(fault);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period elapsed, aborting remaining workers"
            );
            tasks.shutdown().await;
        }

        let summary = stats.snapshot();
        info!(
            batches = summary.batches_processed,
            processed = summary.events_processed,
            duplicates = summary.duplicates_skipped,
            retried = summary.retries_scheduled,
            dead_lettered = summary.dead_lettered,
            average_latency_ms = summary.average_latency_ms,
            "Event pipeline stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log a finished worker. Any exit before shutdown is a fault.
fn worker_exited(
    joined: std::result::Result<WorkerExit, JoinError>,
    shutting_down: bool,
) -> Option<PipelineError> {
    match joined {
        Ok((worker, Ok(()))) if shutting_down => {
            info!(worker = %worker, "Worker stopped");
            None
        }
        Ok((worker, Ok(()))) => {
            error!(worker = %worker, "Worker exited unexpectedly; it will not be restarted");
            Some(PipelineError::Worker {
                worker,
                reason: "exited before shutdown".to_string(),
            })
        }
        Ok((worker, Err(e))) => {
            error!(worker = %worker, error = %e, "Worker failed; it will not be restarted");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "Worker task join error");
            Some(PipelineError::Worker {
                worker: "unknown".to_string(),
                reason: e.to_string(),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
