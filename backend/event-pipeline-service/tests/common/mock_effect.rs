//! Recording business effect for consumer tests.
//!
//! Counts every applied event and can be told to fail specific identifiers a
//! number of times, or every event, transiently or permanently. A slow effect
//! sleeps before applying each event.

use async_trait::async_trait;
use event_pipeline_service::services::{BusinessEffect, EffectError};
use event_queue::Event;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
pub struct MockEffect {
    applied: Mutex<Vec<String>>,
    failures_remaining: Mutex<HashMap<String, u32>>,
    always_fail: bool,
    permanent: bool,
    panic_on_type: Option<String>,
    delay: Option<Duration>,
}

impl MockEffect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `event_id` transiently for its first `times` attempts.
    pub fn failing(self, event_id: &str, times: u32) -> Self {
        self.failures_remaining
            .lock()
            .insert(event_id.to_string(), times);
        self
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn permanently_failing() -> Self {
        Self {
            permanent: true,
            ..Self::default()
        }
    }

    /// Panic when an event of `event_type` is applied.
    pub fn panicking_on(event_type: &str) -> Self {
        Self {
            panic_on_type: Some(event_type.to_string()),
            ..Self::default()
        }
    }

    /// Take `delay` to apply each event.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn applied_count(&self, event_id: &str) -> usize {
        self.applied
            .lock()
            .iter()
            .filter(|id| id.as_str() == event_id)
            .count()
    }
}

#[async_trait]
impl BusinessEffect for MockEffect {
    async fn apply(&self, event: &Event) -> Result<(), EffectError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_type.as_deref() == Some(event.event_type.as_str()) {
            panic!("effect exploded on {}", event.event_id);
        }
        if self.permanent {
            return Err(EffectError::Permanent("payload is unusable".to_string()));
        }
        if self.always_fail {
            return Err(EffectError::Transient("downstream unavailable".to_string()));
        }

        let should_fail = match self.failures_remaining.lock().get_mut(&event.event_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if should_fail {
            return Err(EffectError::Transient("downstream timeout".to_string()));
        }

        self.applied.lock().push(event.event_id.clone());
        Ok(())
    }

    fn snapshot(&self) -> Value {
        json!({ "applied": self.applied.lock().len() })
    }
}
