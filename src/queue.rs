use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;

use crate::error::QueueError;
use crate::models::{CrawlRequest, CrawlResponse};

/// Sole legal mutator of the processing list plus the pending/started
/// indices. The substring match against `"taskId":"<id>"` is a deliberate
/// performance choice: task ids are UUIDs, which never need JSON escaping,
/// so this avoids decoding every processing-list entry.
const ACK_TASK_SCRIPT: &str = r#"
local processing = KEYS[1]
local pending = KEYS[2]
local started = KEYS[3]
local task_id = ARGV[1]
local dedup_key = ARGV[2]

local needle = '"taskId":"' .. task_id .. '"'
local entries = redis.call('LRANGE', processing, 0, -1)
local removed = 0
for _, entry in ipairs(entries) do
    if string.find(entry, needle, 1, true) then
        redis.call('LREM', processing, 1, entry)
        removed = 1
        break
    end
end

redis.call('SREM', pending, dedup_key)
redis.call('HDEL', started, task_id)
return removed
"#;

fn key(namespace: &str, suffix: &str) -> String {
    format!("{namespace}:queue:{suffix}")
}

/// Redis-backed reliable queue: at-least-once pop via a processing list, a
/// producer-side dedup set, a started-timestamp hash for an external
/// janitor, and an atomic Lua-scripted acknowledge.
pub struct ReliableQueue {
    manager: ConnectionManager,
    ack_script: Script,
    task_queue: String,
    processing: String,
    pending: String,
    started: String,
    results: String,
}

impl ReliableQueue {
    pub fn new(manager: ConnectionManager, namespace: &str) -> Self {
        Self {
            manager,
            ack_script: Script::new(ACK_TASK_SCRIPT),
            task_queue: key(namespace, "tasks"),
            processing: key(namespace, "tasks:processing"),
            pending: key(namespace, "tasks:pending"),
            started: key(namespace, "tasks:started"),
            results: key(namespace, "results"),
        }
    }

    /// `BRPOPLPUSH tasks processing timeout`. Malformed JSON is logged and
    /// treated as "no task" — the bad record stays in the processing list
    /// for the janitor to deal with.
    pub async fn pop_task(&self, timeout_secs: f64) -> Result<Option<CrawlRequest>, QueueError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .brpoplpush(&self.task_queue, &self.processing, timeout_secs.ceil())
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let request: CrawlRequest = match serde_json::from_str(&raw) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, raw, "dropping malformed task record");
                return Ok(None);
            }
        };

        if !request.task_id.is_empty() {
            let now = chrono::Utc::now().timestamp();
            let _: () = conn.hset(&self.started, &request.task_id, now).await?;
        }

        Ok(Some(request))
    }

    pub async fn push_result(&self, response: &CrawlResponse) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(response)?;
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(&self.results, encoded).await?;
        Ok(())
    }

    /// Atomically removes the task from the processing list and clears its
    /// pending/started entries. Acking a task that isn't present is not an
    /// error — it's logged and ignored.
    pub async fn ack_task(&self, request: &CrawlRequest) -> Result<(), QueueError> {
        let dedup_key = format!("ip:{}", request.ip_id);
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .ack_script
            .key(&self.processing)
            .key(&self.pending)
            .key(&self.started)
            .arg(&request.task_id)
            .arg(&dedup_key)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            warn!(task_id = %request.task_id, "ack did not find task in processing list");
        }
        Ok(())
    }

    pub async fn queue_depth(&self) -> Result<i64, QueueError> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(&self.task_queue).await?)
    }

    pub async fn processing_count(&self) -> Result<i64, QueueError> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(&self.processing).await?)
    }

    pub async fn health_check(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_script_keys_match_dedup_key_convention() {
        // The dedup key format is a hard compatibility contract with
        // producers; guard it against accidental drift.
        let req = CrawlRequest {
            ip_id: 42,
            keyword: "k".into(),
            task_id: "t1".into(),
            created_at: 0,
            retry_count: 0,
            pages_on_sale: 1,
            pages_sold: 1,
        };
        assert_eq!(format!("ip:{}", req.ip_id), "ip:42");
    }

    #[test]
    fn queue_keys_follow_namespace_convention() {
        let namespace = "animetop";
        assert_eq!(key(namespace, "tasks"), "animetop:queue:tasks");
        assert_eq!(key(namespace, "tasks:processing"), "animetop:queue:tasks:processing");
        assert_eq!(key(namespace, "tasks:pending"), "animetop:queue:tasks:pending");
        assert_eq!(key(namespace, "tasks:started"), "animetop:queue:tasks:started");
        assert_eq!(key(namespace, "results"), "animetop:queue:results");
    }
}
