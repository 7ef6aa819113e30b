// SQLite chat log.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::{ChatRecord, ChatStore, ChatTurn, StoreBackend};

/// SQLite-backed chat log. One row per exchange in the `chat` table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` and ensure the schema
    /// exists. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chat (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                userid     TEXT NOT NULL,
                userchat   TEXT NOT NULL,
                aichat     TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_chat_userid ON chat(userid, id);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics if the mutex is poisoned, which only happens after another
    /// thread panicked mid-query.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn append_sync(&self, record: &ChatRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO chat (userid, userchat, aichat, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.user_id,
                record.user_message,
                record.reply,
                record.timestamp.to_rfc3339(),
            ],
        )
        .context("failed to insert chat record")?;
        Ok(())
    }

    fn latest_sync(&self, user_id: &str, n: usize) -> Result<Vec<ChatTurn>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT userchat, aichat FROM chat
                 WHERE userid = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )
            .context("failed to prepare history query")?;

        let mut turns = stmt
            .query_map(params![user_id, n as i64], |row| {
                Ok(ChatTurn {
                    user_message: row.get(0)?,
                    reply: row.get(1)?,
                })
            })
            .context("failed to query chat history")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map chat rows")?;

        turns.reverse();
        Ok(turns)
    }

    fn count_sync(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chat WHERE userid = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("failed to count chat records")?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn append(&self, record: &ChatRecord) -> Result<()> {
        self.append_sync(record)
    }

    async fn latest(&self, user_id: &str, n: usize) -> Result<Vec<ChatTurn>> {
        self.latest_sync(user_id, n)
    }

    async fn count(&self, user_id: &str) -> Result<usize> {
        self.count_sync(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SqliteStore {
        SqliteStore::open(":memory:").expect("in-memory db should open")
    }

    fn record(user: &str, n: usize) -> ChatRecord {
        ChatRecord::now(user, format!("question {n}"), format!("answer {n}"))
    }

    #[tokio::test]
    async fn open_creates_chat_table() {
        let store = test_store();
        let conn = store.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='chat')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(exists);
    }

    #[tokio::test]
    async fn latest_returns_oldest_first() {
        let store = test_store();
        for i in 1..=3 {
            store.append(&record("1", i)).await.unwrap();
        }

        let turns = store.latest("1", 10).await.unwrap();
        assert_eq!(
            turns,
            vec![
                ChatTurn::new("question 1", "answer 1"),
                ChatTurn::new("question 2", "answer 2"),
                ChatTurn::new("question 3", "answer 3"),
            ]
        );
    }

    #[tokio::test]
    async fn latest_caps_at_n_most_recent() {
        let store = test_store();
        for i in 1..=5 {
            store.append(&record("1", i)).await.unwrap();
        }

        let turns = store.latest("1", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_message, "question 4");
        assert_eq!(turns[1].user_message, "question 5");
    }

    #[tokio::test]
    async fn latest_with_zero_is_empty() {
        let store = test_store();
        store.append(&record("1", 1)).await.unwrap();
        assert!(store.latest("1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let store = test_store();
        store.append(&record("alice", 1)).await.unwrap();
        store.append(&record("bob", 2)).await.unwrap();
        store.append(&record("alice", 3)).await.unwrap();

        let alice = store.latest("alice", 10).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|t| t.user_message != "question 2"));
        assert_eq!(store.count("bob").await.unwrap(), 1);
        assert_eq!(store.count("carol").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_preserves_unicode_text() {
        let store = test_store();
        store
            .append(&ChatRecord::now("1", "有什么计划吗", "哼，才不是为了你呢"))
            .await
            .unwrap();
        let turns = store.latest("1", 1).await.unwrap();
        assert_eq!(turns[0], ChatTurn::new("有什么计划吗", "哼，才不是为了你呢"));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let path = std::env::temp_dir().join(format!("companion_sqlite_reopen_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let path_str = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path_str).unwrap();
            store.append(&record("1", 1)).await.unwrap();
        }
        let store = SqliteStore::open(path_str).unwrap();
        assert_eq!(store.count("1").await.unwrap(), 1);

        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
