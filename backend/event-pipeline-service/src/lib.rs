//! Real-time event pipeline.
//!
//! Producers POST events to the ingestion endpoint, which appends them to a
//! shared queue store and answers immediately. Batch consumers drain the
//! queue, suppress duplicates through the idempotency ledger, apply the
//! business effect and retry or dead-letter failures. The supervisor owns both
//! workers' lifecycles.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod services;
pub mod supervisor;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use supervisor::{shutdown_signal, Backends, Supervisor};
