use chrono::{DateTime, Utc};
use event_queue::{Event, QueueStats, MAX_EVENT_ID_LEN};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::services::ConsumerStatsSnapshot;

pub const DEFAULT_SOURCE: &str = "webhook";

/// Inbound event as posted by producers.
///
/// Field names follow what producers actually send: `identifier` may arrive as
/// `event_id` or `id`, `payload` as `metadata`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default, alias = "event_id", alias = "id")]
    pub identifier: Option<String>,
    #[serde(default, rename = "type", alias = "event_type")]
    pub event_type: Option<String>,
    #[serde(default, alias = "metadata")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<Value>,
}

impl IngestRequest {
    /// Check required fields and build the queued representation.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Result<Event, PipelineError> {
        let identifier = self
            .identifier
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let event_type = self
            .event_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let payload = self.payload.filter(|p| !p.is_null());

        let mut missing = Vec::new();
        if identifier.is_none() {
            missing.push("identifier".to_string());
        }
        if event_type.is_none() {
            missing.push("type".to_string());
        }
        if payload.is_none() {
            missing.push("payload".to_string());
        }

        let (Some(event_id), Some(event_type), Some(mut payload)) =
            (identifier, event_type, payload)
        else {
            return Err(PipelineError::missing_fields(missing));
        };

        if event_id.len() > MAX_EVENT_ID_LEN {
            return Err(PipelineError::BadRequest(format!(
                "identifier exceeds {} characters",
                MAX_EVENT_ID_LEN
            )));
        }

        if let (Some(user_id), Value::Object(map)) = (self.user_id, &mut payload) {
            map.entry("user_id").or_insert(user_id);
        }

        Ok(Event {
            event_id,
            event_type,
            payload,
            source: self
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            received_at,
            occurred_at: self.timestamp,
        })
    }
}

/// Body of `POST /webhook/batch`. Events are parsed one by one so a single
/// malformed item only rejects itself.
#[derive(Debug, Deserialize)]
pub struct BatchIngestRequest {
    #[serde(default)]
    pub events: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub event_id: String,
    pub queued_at: DateTime<Utc>,
    pub latency_ms: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchResults {
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Rejection {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchAcceptedResponse {
    pub status: String,
    pub results: BatchResults,
    pub total_events: usize,
    pub accepted_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub queue: QueueStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub consumer: ConsumerStatsSnapshot,
    pub business: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}
