//! In-process queue store.
//!
//! Same semantics as the Redis store, for tests and single-process
//! development. Clones share state, so several consumers built from clones of
//! one store behave like consumers sharing a broker. The lock is a
//! synchronous mutex that is released before any `.await`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::model::{DeadLetterEntry, Event, Lease, QueueStats, QueuedEvent};
use crate::QueueStore;

struct Claim {
    deadline: Instant,
    token: Uuid,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Uuid>,
    entries: HashMap<Uuid, QueuedEvent>,
    in_flight: HashMap<Uuid, Claim>,
    delayed: Vec<(Instant, Uuid)>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl State {
    /// Move due retries and lapsed claims back to the tail of the live queue.
    fn release_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Uuid)> = Vec::new();
        self.delayed.retain(|(ready_at, id)| {
            if *ready_at <= now {
                due.push((*ready_at, *id));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);
        self.queue.extend(due.into_iter().map(|(_, id)| id));

        let mut expired: Vec<(Instant, Uuid)> = self
            .in_flight
            .iter()
            .filter(|(_, claim)| claim.deadline <= now)
            .map(|(id, claim)| (claim.deadline, *id))
            .collect();
        expired.sort_by_key(|(deadline, _)| *deadline);
        for (_, id) in expired {
            self.in_flight.remove(&id);
            debug!(entry_id = %id, "Visibility timeout elapsed, entry returned to queue");
            self.queue.push_back(id);
        }
    }

    /// Drop the in-flight marker for `id` if `token` is the current claim.
    fn release_claim(&mut self, id: &Uuid, token: Option<Uuid>) -> bool {
        match (self.in_flight.get(id), token) {
            (Some(claim), Some(token)) if claim.token == token => {
                self.in_flight.remove(id);
                true
            }
            _ => false,
        }
    }
}

/// Queue store held in process memory.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the broker were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(
                "in-memory queue store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> QueueResult<()> {
        self.check_available()
    }

    async fn append(&self, event: Event) -> QueueResult<QueuedEvent> {
        self.check_available()?;
        let entry = QueuedEvent::new(event);

        let mut state = self.state.lock();
        state.entries.insert(entry.entry_id, entry.clone());
        state.queue.push_back(entry.entry_id);

        Ok(entry)
    }

    async fn claim(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<QueuedEvent>> {
        self.check_available()?;
        let now = Instant::now();
        let deadline = now + visibility_timeout;
        let token = Uuid::new_v4();

        let mut state = self.state.lock();
        state.release_due(now);

        let mut claimed = Vec::with_capacity(max);
        while claimed.len() < max {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            if let Some(mut entry) = state.entries.get(&id).cloned() {
                state.in_flight.insert(id, Claim { deadline, token });
                entry.lease_token = Some(token);
                claimed.push(entry);
            }
        }

        Ok(claimed)
    }

    async fn acknowledge(&self, leases: &[Lease]) -> QueueResult<usize> {
        self.check_available()?;
        let mut state = self.state.lock();

        let mut acked = 0;
        for lease in leases {
            if state.release_claim(&lease.entry_id, Some(lease.token)) {
                state.entries.remove(&lease.entry_id);
                acked += 1;
            }
        }

        Ok(acked)
    }

    async fn requeue(&self, entry: &QueuedEvent, delay: Duration) -> QueueResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();

        if !state.release_claim(&entry.entry_id, entry.lease_token) {
            return Ok(false);
        }
        let mut stored = entry.clone();
        stored.lease_token = None;
        state.entries.insert(entry.entry_id, stored);
        if delay.is_zero() {
            state.queue.push_back(entry.entry_id);
        } else {
            state.delayed.push((Instant::now() + delay, entry.entry_id));
        }

        Ok(true)
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<bool> {
        self.check_available()?;
        let Ok(id) = Uuid::parse_str(&entry.entry_id) else {
            return Ok(false);
        };

        let mut state = self.state.lock();
        if !state.release_claim(&id, entry.lease_token) {
            return Ok(false);
        }
        state.entries.remove(&id);
        state.dead_letters.push(entry);

        Ok(true)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.check_available()?;
        let state = self.state.lock();

        Ok(QueueStats {
            queued: state.queue.len() as u64,
            in_flight: state.in_flight.len() as u64,
            delayed: state.delayed.len() as u64,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }
}
