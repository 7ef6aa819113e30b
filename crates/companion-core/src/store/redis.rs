// Redis chat log.
//
// Layout per user:
//   chat:{user}:seq     counter, bumped once per appended record
//   chat:{user}:{seq}   hash { userid, userchat, aichat, timestamp }

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{ChatRecord, ChatStore, ChatTurn, StoreBackend};

pub struct RedisStore {
    conn: ConnectionManager,
}

fn seq_key(user_id: &str) -> String {
    format!("chat:{user_id}:seq")
}

fn record_key(user_id: &str, seq: u64) -> String {
    format!("chat:{user_id}:{seq}")
}

/// Sequence numbers of the newest `n` records when `last` is the counter
/// value. Sequences start at 1.
fn sequence_window(last: u64, n: usize) -> Option<RangeInclusive<u64>> {
    if last == 0 || n == 0 {
        return None;
    }
    let first = last.saturating_sub(n as u64 - 1).max(1);
    Some(first..=last)
}

impl RedisStore {
    /// Connect to `url`. The initial connection must succeed within
    /// `timeout`, otherwise the caller falls back to another backend.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .context("timed out connecting to redis")?
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ChatStore for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn append(&self, record: &ChatRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn
            .incr(seq_key(&record.user_id), 1u64)
            .await
            .context("failed to allocate chat sequence number")?;

        let timestamp = record.timestamp.timestamp_millis() as f64 / 1000.0;
        let fields = [
            ("userid", record.user_id.clone()),
            ("userchat", record.user_message.clone()),
            ("aichat", record.reply.clone()),
            ("timestamp", timestamp.to_string()),
        ];
        let key = record_key(&record.user_id, seq);
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .with_context(|| format!("failed to write {key}"))?;
        debug!(%key, "chat record stored");
        Ok(())
    }

    async fn latest(&self, user_id: &str, n: usize) -> Result<Vec<ChatTurn>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let last: Option<u64> = conn
            .get(seq_key(user_id))
            .await
            .context("failed to read chat sequence")?;
        let Some(window) = sequence_window(last.unwrap_or(0), n) else {
            return Ok(Vec::new());
        };

        let mut pipe = redis::pipe();
        for seq in window {
            pipe.hgetall(record_key(user_id, seq));
        }
        let rows: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .context("failed to read chat records")?;

        // A missing hash means the write after INCR never landed.
        let turns = rows
            .into_iter()
            .filter_map(|mut fields| {
                let user_message = fields.remove("userchat")?;
                let reply = fields.remove("aichat")?;
                Some(ChatTurn::new(user_message, reply))
            })
            .collect();
        Ok(turns)
    }

    async fn count(&self, user_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let last: Option<u64> = conn
            .get(seq_key(user_id))
            .await
            .context("failed to read chat sequence")?;
        Ok(last.unwrap_or(0) as usize)
    }
}
