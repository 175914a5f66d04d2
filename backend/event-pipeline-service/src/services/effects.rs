//! Business effects applied to each newly seen event.

use async_trait::async_trait;
use event_queue::Event;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

use super::dashboard::DashboardClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// Worth retrying: downstream timeout, temporary outage
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help: the event itself is unusable
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl EffectError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, EffectError::Permanent(_))
    }
}

/// The side effect the consumer applies once per event identifier.
///
/// Implementations must not hold locks across `.await` points that other
/// consumer instances would need.
#[async_trait]
pub trait BusinessEffect: Send + Sync {
    async fn apply(&self, event: &Event) -> Result<(), EffectError>;

    /// JSON view of accumulated results, served on `/stats`.
    fn snapshot(&self) -> Value {
        Value::Null
    }
}

/// Running SaaS business metrics.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SaasMetrics {
    pub user_count: u64,
    pub signups_by_source: BTreeMap<String, u64>,
    pub mrr: f64,
    pub subscriptions_by_plan: BTreeMap<String, u64>,
    pub usage_by_feature: BTreeMap<String, f64>,
    pub unknown_events: u64,
}

/// Folds signup, subscription and usage events into [`SaasMetrics`] and
/// optionally forwards each delta to the dashboard API.
pub struct SaasMetricsEffect {
    metrics: Mutex<SaasMetrics>,
    dashboard: Option<DashboardClient>,
}

impl SaasMetricsEffect {
    pub fn new(dashboard: Option<DashboardClient>) -> Self {
        Self {
            metrics: Mutex::new(SaasMetrics::default()),
            dashboard,
        }
    }

    pub fn metrics(&self) -> SaasMetrics {
        self.metrics.lock().clone()
    }

    fn user_signup(&self, event: &Event) -> Value {
        let source = str_field(&event.payload, "source").unwrap_or(&event.source);

        {
            let mut metrics = self.metrics.lock();
            metrics.user_count += 1;
            *metrics
                .signups_by_source
                .entry(source.to_string())
                .or_default() += 1;
        }

        info!(event_id = %event.event_id, source = %source, "User signup");
        json!({
            "metric": "user_count",
            "action": "increment",
            "user_id": event.payload.get("user_id"),
            "source": source,
        })
    }

    fn subscription_created(&self, event: &Event) -> Result<Value, EffectError> {
        let plan = str_field(&event.payload, "plan").unwrap_or("unknown");
        let amount = number_field(&event.payload, "amount", 0.0)?;

        {
            let mut metrics = self.metrics.lock();
            metrics.mrr += amount;
            *metrics
                .subscriptions_by_plan
                .entry(plan.to_string())
                .or_default() += 1;
        }

        info!(event_id = %event.event_id, plan = %plan, amount, "Subscription created");
        Ok(json!({
            "metric": "mrr",
            "action": "add",
            "user_id": event.payload.get("user_id"),
            "plan": plan,
            "amount": amount,
        }))
    }

    fn usage_tracked(&self, event: &Event) -> Result<Value, EffectError> {
        let feature = str_field(&event.payload, "feature").unwrap_or("unknown");
        let quantity = number_field(&event.payload, "quantity", 1.0)?;

        *self
            .metrics
            .lock()
            .usage_by_feature
            .entry(feature.to_string())
            .or_default() += quantity;

        info!(event_id = %event.event_id, feature = %feature, quantity, "Usage tracked");
        Ok(json!({
            "metric": "usage",
            "action": "increment",
            "user_id": event.payload.get("user_id"),
            "feature": feature,
            "quantity": quantity,
        }))
    }
}

#[async_trait]
impl BusinessEffect for SaasMetricsEffect {
    async fn apply(&self, event: &Event) -> Result<(), EffectError> {
        let update = match event.event_type.as_str() {
            "user_signup" | "signup" => self.user_signup(event),
            "subscription_created" => self.subscription_created(event)?,
            "usage_tracked" => self.usage_tracked(event)?,
            other => {
                self.metrics.lock().unknown_events += 1;
                warn!(event_id = %event.event_id, event_type = %other, "Unknown event type");
                return Ok(());
            }
        };

        if let Some(dashboard) = &self.dashboard {
            dashboard.publish(&update).await;
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self.metrics()).unwrap_or(Value::Null)
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn number_field(payload: &Value, key: &str, default: f64) -> Result<f64, EffectError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            EffectError::Permanent(format!("field '{}' is not a number: {}", key, value))
        }),
    }
}
