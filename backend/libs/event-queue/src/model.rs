//! Queue data model: events, queue entries, attempt history and dead letters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted length of a producer-assigned event identifier.
pub const MAX_EVENT_ID_LEN: usize = 255;

/// A business event accepted by the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Producer-assigned identifier, stable across redeliveries of the same logical event
    pub event_id: String,

    /// Event type, e.g. "user_signup" or "subscription_created"
    pub event_type: String,

    /// Arbitrary structured payload
    pub payload: serde_json::Value,

    /// Origin tag of the producer ("webhook", "billing", ...)
    pub source: String,

    /// Time the ingestion endpoint accepted the event
    pub received_at: DateTime<Utc>,

    /// Producer-side timestamp, when supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// One failed attempt at applying an event's business effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// An event as stored in the queue.
///
/// `entry_id` is unique per enqueue: submitting the same `event_id` twice
/// yields two entries. The attempt history travels with the entry across
/// retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub entry_id: Uuid,
    pub event: Event,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,

    /// Token of the claim that handed this entry out. Only the holder of the
    /// current token may acknowledge, requeue or dead-letter the entry.
    #[serde(skip)]
    pub lease_token: Option<Uuid>,
}

/// Proof of a claim on one entry, used to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub entry_id: Uuid,
    pub token: Uuid,
}

impl QueuedEvent {
    pub fn new(event: Event) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            event,
            attempts: Vec::new(),
            lease_token: None,
        }
    }

    /// The claim this copy of the entry was handed out under, if any.
    pub fn lease(&self) -> Option<Lease> {
        self.lease_token.map(|token| Lease {
            entry_id: self.entry_id,
            token,
        })
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    /// Number of failed attempts recorded so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error.as_str())
    }

    /// Append a failed attempt and return its 1-based number.
    pub fn record_failure(
        &mut self,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> u32 {
        let attempt = self.attempt_count() + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            started_at,
            failed_at: Utc::now(),
            error: error.into(),
        });
        attempt
    }
}

/// Why an entry ended up in the dead-letter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retry budget exhausted
    MaxRetriesExceeded,
    /// Business effect reported a failure that retrying cannot fix
    PermanentFailure,
    /// Stored body could not be decoded
    Undecodable,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
            DeadLetterReason::PermanentFailure => "permanent_failure",
            DeadLetterReason::Undecodable => "undecodable",
        }
    }
}

/// A dead-lettered entry with its full failure history.
///
/// Never removed by the pipeline; replay or deletion is an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: String,

    /// Decoded event; `None` only for [`DeadLetterReason::Undecodable`]
    pub event: Option<Event>,

    /// Raw stored body, kept only when it could not be decoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,

    pub attempts: Vec<AttemptRecord>,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,

    /// Claim token carried over from the entry; not persisted.
    #[serde(skip)]
    pub lease_token: Option<Uuid>,
}

impl DeadLetterEntry {
    pub fn from_entry(entry: QueuedEvent, reason: DeadLetterReason) -> Self {
        let last_error = entry.last_error().map(str::to_string);
        Self {
            entry_id: entry.entry_id.to_string(),
            event: Some(entry.event),
            raw_body: None,
            attempts: entry.attempts,
            reason,
            last_error,
            dead_lettered_at: Utc::now(),
            lease_token: entry.lease_token,
        }
    }

    pub fn undecodable(entry_id: impl Into<String>, raw_body: String, error: String) -> Self {
        Self {
            entry_id: entry_id.into(),
            event: None,
            raw_body: Some(raw_body),
            attempts: Vec::new(),
            reason: DeadLetterReason::Undecodable,
            last_error: Some(error),
            dead_lettered_at: Utc::now(),
            lease_token: None,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event.as_ref().map(|e| e.event_id.as_str())
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

/// Point-in-time sizes of the queue store's buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries waiting in the live queue
    pub queued: u64,
    /// Entries claimed and not yet acknowledged
    pub in_flight: u64,
    /// Entries waiting out a retry delay
    pub delayed: u64,
    /// Entries in the dead-letter buffer
    pub dead_lettered: u64,
}

impl QueueStats {
    /// Entries that are still owed processing.
    pub fn pending(&self) -> u64 {
        self.queued + self.in_flight + self.delayed
    }
}
