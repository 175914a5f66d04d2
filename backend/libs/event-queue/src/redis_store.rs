//! Redis-backed queue store.
//!
//! Layout under the namespace (default `pipeline`):
//!
//! ```text
//! {ns}:events:queue       LIST  entry ids, RPUSH tail / LPOP head
//! {ns}:events:payloads    HASH  entry id -> serialized QueuedEvent
//! {ns}:events:processing  ZSET  entry id scored by visibility deadline (ms)
//! {ns}:events:delayed     ZSET  entry id scored by retry ready-at (ms)
//! {ns}:events:leases      HASH  entry id -> token of the claim holding it
//! {ns}:events:failed      LIST  serialized DeadLetterEntry, never trimmed
//! ```
//!
//! Every state change that touches more than one key runs as a Lua script so
//! concurrent consumers observe it atomically. Acknowledge, requeue and
//! dead-letter only act when the caller's token matches the stored lease, so
//! a consumer whose claim lapsed cannot finish an entry someone else holds.

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis_utils::{namespaced_key, SharedConnectionManager};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::model::{DeadLetterEntry, Event, Lease, QueueStats, QueuedEvent};
use crate::QueueStore;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])

local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('RPUSH', KEYS[1], id)
end

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HDEL', KEYS[5], id)
    redis.call('RPUSH', KEYS[1], id)
end

local claimed = {}
local orphans = {}
for i = 1, tonumber(ARGV[3]) do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        break
    end
    local body = redis.call('HGET', KEYS[4], id)
    if body then
        redis.call('ZADD', KEYS[2], ARGV[2], id)
        redis.call('HSET', KEYS[5], id, ARGV[4])
        table.insert(claimed, id)
        table.insert(claimed, body)
    else
        table.insert(orphans, id)
    end
end
return {claimed, orphans}
"#;

const ACK_SCRIPT: &str = r#"
local acked = 0
for i = 1, #ARGV, 2 do
    local id = ARGV[i]
    if redis.call('HGET', KEYS[3], id) == ARGV[i + 1] then
        redis.call('ZREM', KEYS[1], id)
        redis.call('HDEL', KEYS[2], id)
        redis.call('HDEL', KEYS[3], id)
        acked = acked + 1
    end
end
return acked
"#;

const REQUEUE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[5] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
if tonumber(ARGV[4]) <= 0 then
    redis.call('RPUSH', KEYS[3], ARGV[1])
else
    redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
end
return 1
"#;

const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[3] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[2])
return 1
"#;

/// Fully qualified key names for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue: String,
    pub payloads: String,
    pub processing: String,
    pub delayed: String,
    pub leases: String,
    pub failed: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            queue: namespaced_key(namespace, &["events", "queue"]),
            payloads: namespaced_key(namespace, &["events", "payloads"]),
            processing: namespaced_key(namespace, &["events", "processing"]),
            delayed: namespaced_key(namespace, &["events", "delayed"]),
            leases: namespaced_key(namespace, &["events", "leases"]),
            failed: namespaced_key(namespace, &["events", "failed"]),
        }
    }
}

/// Queue store on a shared Redis deployment.
#[derive(Clone)]
pub struct RedisQueueStore {
    redis: SharedConnectionManager,
    keys: QueueKeys,
    claim_script: Script,
    ack_script: Script,
    requeue_script: Script,
    dead_letter_script: Script,
}

impl RedisQueueStore {
    pub fn new(redis: SharedConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            keys: QueueKeys::new(namespace),
            claim_script: Script::new(CLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            dead_letter_script: Script::new(DEAD_LETTER_SCRIPT),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn connection(&self) -> redis::aio::ConnectionManager {
        self.redis.lock().await.clone()
    }
}

fn epoch_millis_after(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ping(&self) -> QueueResult<()> {
        redis_utils::ping(&self.redis).await?;
        Ok(())
    }

    async fn append(&self, event: Event) -> QueueResult<QueuedEvent> {
        let entry = QueuedEvent::new(event);
        let body = serde_json::to_string(&entry)?;
        let id = entry.entry_id.to_string();

        let mut conn = self.connection().await;
        redis::pipe()
            .atomic()
            .hset(&self.keys.payloads, &id, body)
            .ignore()
            .rpush(&self.keys.queue, &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(entry_id = %id, event_id = %entry.event_id(), "Entry appended to queue");
        Ok(entry)
    }

    async fn claim(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<QueuedEvent>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let deadline = epoch_millis_after(visibility_timeout);
        let token = Uuid::new_v4();

        let mut conn = self.connection().await;
        let (raw, orphans): (Vec<String>, Vec<String>) = self
            .claim_script
            .key(&self.keys.queue)
            .key(&self.keys.processing)
            .key(&self.keys.delayed)
            .key(&self.keys.payloads)
            .key(&self.keys.leases)
            .arg(now)
            .arg(deadline)
            .arg(max)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        if !orphans.is_empty() {
            warn!(
                count = orphans.len(),
                entry_ids = ?orphans,
                "Queued entry ids without a stored body were dropped"
            );
        }

        let mut claimed = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            let (id, body) = (&pair[0], &pair[1]);
            match serde_json::from_str::<QueuedEvent>(body) {
                Ok(mut entry) => {
                    entry.lease_token = Some(token);
                    claimed.push(entry);
                }
                Err(e) => {
                    error!(
                        entry_id = %id,
                        error = %e,
                        "Undecodable queue entry, moving to dead letters"
                    );
                    let mut dead =
                        DeadLetterEntry::undecodable(id.clone(), body.clone(), e.to_string());
                    dead.lease_token = Some(token);
                    if let Err(dl_err) = self.dead_letter(dead).await {
                        error!(
                            entry_id = %id,
                            error = %dl_err,
                            "Failed to dead-letter undecodable entry"
                        );
                    }
                }
            }
        }

        Ok(claimed)
    }

    async fn acknowledge(&self, leases: &[Lease]) -> QueueResult<usize> {
        if leases.is_empty() {
            return Ok(0);
        }

        let mut invocation = self.ack_script.key(&self.keys.processing);
        invocation.key(&self.keys.payloads).key(&self.keys.leases);
        for lease in leases {
            invocation
                .arg(lease.entry_id.to_string())
                .arg(lease.token.to_string());
        }

        let mut conn = self.connection().await;
        let acked: usize = invocation.invoke_async(&mut conn).await?;

        if acked < leases.len() {
            warn!(
                requested = leases.len(),
                acked,
                "Some entries were no longer claimed at acknowledge time"
            );
        }
        Ok(acked)
    }

    async fn requeue(&self, entry: &QueuedEvent, delay: Duration) -> QueueResult<bool> {
        let Some(token) = entry.lease_token else {
            return Ok(false);
        };
        let body = serde_json::to_string(entry)?;

        let mut conn = self.connection().await;
        let moved: i64 = self
            .requeue_script
            .key(&self.keys.processing)
            .key(&self.keys.payloads)
            .key(&self.keys.queue)
            .key(&self.keys.delayed)
            .key(&self.keys.leases)
            .arg(entry.entry_id.to_string())
            .arg(body)
            .arg(epoch_millis_after(delay))
            .arg(delay.as_millis() as u64)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<bool> {
        let Some(token) = entry.lease_token else {
            return Ok(false);
        };
        let body = serde_json::to_string(&entry)?;

        let mut conn = self.connection().await;
        let moved: i64 = self
            .dead_letter_script
            .key(&self.keys.processing)
            .key(&self.keys.payloads)
            .key(&self.keys.failed)
            .key(&self.keys.leases)
            .arg(&entry.entry_id)
            .arg(body)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.connection().await;
        let (queued, in_flight, delayed, dead_lettered): (u64, u64, u64, u64) = redis::pipe()
            .llen(&self.keys.queue)
            .zcard(&self.keys.processing)
            .zcard(&self.keys.delayed)
            .llen(&self.keys.failed)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queued,
            in_flight,
            delayed,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.keys.failed)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|body| match serde_json::from_str::<DeadLetterEntry>(body) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable dead-letter record");
                    None
                }
            })
            .collect())
    }
}
