pub mod consumer;
pub mod dashboard;
pub mod effects;

pub use consumer::{
    BatchConsumer, BatchReport, ClaimedBatch, ConsumerState, ConsumerStats, ConsumerStatsSnapshot,
};
pub use dashboard::DashboardClient;
pub use effects::{BusinessEffect, EffectError, SaasMetrics, SaasMetricsEffect};
