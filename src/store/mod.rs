//! SQLite 持久化（sqlx 异步）
//!
//! 会话、消息、升级记录、KB 条目四张表。每个逻辑步骤一条短语句，
//! 不做跨整轮的长事务：入站消息一旦落库，后续阶段失败也不回滚。

use std::collections::HashSet;
use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::ConciergeError;
use crate::handoff::HandoffEvent;

/// 会话记录：每个手机号一条，缓存最近一次解析到的预订字段与记忆摘要
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub phone_e164: String,
    pub guest_last_name: Option<String>,
    pub property_id: Option<String>,
    pub booking_id: Option<String>,
    pub memory_summary: Option<String>,
}

/// 消息记录（只追加，按 id 有序）
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub role: String,
    pub content: String,
}

/// 升级记录（管理端点列表用）
#[derive(Debug, Clone, serde::Serialize)]
pub struct HandoffRow {
    pub id: i64,
    pub created_at: String,
    pub phone_e164: String,
    pub guest_last_name: Option<String>,
    pub property_id: Option<String>,
    pub booking_id: Option<String>,
    pub reason: String,
    pub user_message: String,
}

/// 待插入的 KB 条目（嵌入以 JSON 文本列存储）
#[derive(Debug, Clone)]
pub struct NewKbEntry {
    pub row_hash: String,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub answer: String,
    pub embedding: Vec<f32>,
}

/// 读取的 KB 条目（按插入顺序返回，检索同分时以此为并列序）
#[derive(Debug, Clone)]
pub struct StoredKbEntry {
    pub row_hash: String,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub answer: String,
    pub embedding: Vec<f32>,
}

/// 管理状态计数
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Counts {
    pub kb_entries: i64,
    pub sessions: i64,
    pub handoffs: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// 打开（或创建）数据库并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, ConciergeError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), ConciergeError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_e164 TEXT NOT NULL UNIQUE,
                guest_last_name TEXT,
                property_id TEXT,
                booking_id TEXT,
                memory_summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS handoff_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_e164 TEXT NOT NULL,
                guest_last_name TEXT,
                property_id TEXT,
                booking_id TEXT,
                user_message TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kb_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                row_hash TEXT NOT NULL UNIQUE,
                category TEXT,
                unit TEXT,
                scope TEXT,
                description TEXT,
                answer TEXT NOT NULL,
                embedding_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_handoffs_phone ON handoff_requests(phone_e164)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> SessionRow {
        SessionRow {
            id: row.get("id"),
            phone_e164: row.get("phone_e164"),
            guest_last_name: row.get("guest_last_name"),
            property_id: row.get("property_id"),
            booking_id: row.get("booking_id"),
            memory_summary: row.get("memory_summary"),
        }
    }

    /// 按手机号查会话
    pub async fn session_by_phone(&self, phone_e164: &str) -> Result<Option<SessionRow>, ConciergeError> {
        let row = sqlx::query(
            "SELECT id, phone_e164, guest_last_name, property_id, booking_id, memory_summary
             FROM chat_sessions WHERE phone_e164 = ?",
        )
        .bind(phone_e164)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_session))
    }

    /// 按手机号取会话，不存在则创建（首次来电的手机号）
    pub async fn get_or_create_session(&self, phone_e164: &str) -> Result<SessionRow, ConciergeError> {
        if let Some(session) = self.session_by_phone(phone_e164).await? {
            return Ok(session);
        }

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO chat_sessions (phone_e164, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(phone_e164)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        // INSERT OR IGNORE 兜住并发创建同一手机号的情况
        self.session_by_phone(phone_e164)
            .await?
            .ok_or_else(|| ConciergeError::Config(format!("session not found after insert: {phone_e164}")))
    }

    /// 把解析到的预订字段缓存到会话上
    pub async fn set_booking(
        &self,
        session_id: i64,
        booking_id: &str,
        property_id: &str,
        guest_last_name: Option<&str>,
    ) -> Result<(), ConciergeError> {
        sqlx::query(
            "UPDATE chat_sessions
             SET booking_id = ?, property_id = ?, guest_last_name = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(booking_id)
        .bind(property_id)
        .bind(guest_last_name)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_memory_summary(&self, session_id: i64, summary: &str) -> Result<(), ConciergeError> {
        sqlx::query("UPDATE chat_sessions SET memory_summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 追加一条消息（转录只增不改）
    pub async fn append_message(&self, session_id: i64, role: &str, content: &str) -> Result<(), ConciergeError> {
        sqlx::query(
            "INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 最近 limit 条消息，按时间正序返回（最旧在前）
    pub async fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<MessageRow>, ConciergeError> {
        let rows = sqlx::query(
            "SELECT role, content FROM chat_messages
             WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<MessageRow> = rows
            .iter()
            .map(|r| MessageRow {
                role: r.get("role"),
                content: r.get("content"),
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    pub async fn insert_handoff(&self, event: &HandoffEvent) -> Result<(), ConciergeError> {
        sqlx::query(
            "INSERT INTO handoff_requests
             (phone_e164, guest_last_name, property_id, booking_id, user_message, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.phone_e164)
        .bind(&event.guest_last_name)
        .bind(&event.property_id)
        .bind(&event.booking_id)
        .bind(&event.user_message)
        .bind(event.reason.as_str())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 最近的升级记录，新的在前
    pub async fn recent_handoffs(&self, limit: usize) -> Result<Vec<HandoffRow>, ConciergeError> {
        let rows = sqlx::query(
            "SELECT id, created_at, phone_e164, guest_last_name, property_id, booking_id, reason, user_message
             FROM handoff_requests ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| HandoffRow {
                id: r.get("id"),
                created_at: r.get("created_at"),
                phone_e164: r.get("phone_e164"),
                guest_last_name: r.get("guest_last_name"),
                property_id: r.get("property_id"),
                booking_id: r.get("booking_id"),
                reason: r.get("reason"),
                user_message: r.get("user_message"),
            })
            .collect())
    }

    /// 当前存储的全部 KB 行哈希
    pub async fn kb_hashes(&self) -> Result<HashSet<String>, ConciergeError> {
        let rows = sqlx::query("SELECT row_hash FROM kb_entries")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("row_hash")).collect())
    }

    /// 在单个事务里应用一次 KB 差异：删除过期哈希、插入新条目。
    /// 并发读者要么看到完整的旧集合，要么看到完整的新集合。
    pub async fn apply_kb_diff(
        &self,
        stale_hashes: &[String],
        new_entries: &[NewKbEntry],
    ) -> Result<(), ConciergeError> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().to_rfc3339();

        for row_hash in stale_hashes {
            sqlx::query("DELETE FROM kb_entries WHERE row_hash = ?")
                .bind(row_hash)
                .execute(&mut *tx)
                .await?;
        }

        for entry in new_entries {
            let embedding_json = serde_json::to_string(&entry.embedding)
                .map_err(|e| ConciergeError::KbSource(e.to_string()))?;
            sqlx::query(
                "INSERT INTO kb_entries
                 (row_hash, category, unit, scope, description, answer, embedding_json, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.row_hash)
            .bind(&entry.category)
            .bind(&entry.unit)
            .bind(&entry.scope)
            .bind(&entry.description)
            .bind(&entry.answer)
            .bind(embedding_json)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// 全量 KB 条目，按插入顺序（KB 足够小，逐查询全扫）
    pub async fn kb_entries(&self) -> Result<Vec<StoredKbEntry>, ConciergeError> {
        let rows = sqlx::query(
            "SELECT row_hash, category, unit, scope, description, answer, embedding_json
             FROM kb_entries ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for r in &rows {
            let embedding_json: String = r.get("embedding_json");
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
                .map_err(|e| ConciergeError::KbSource(e.to_string()))?;
            entries.push(StoredKbEntry {
                row_hash: r.get("row_hash"),
                category: r.get("category"),
                unit: r.get("unit"),
                scope: r.get("scope"),
                description: r.get("description"),
                answer: r.get("answer"),
                embedding,
            });
        }
        Ok(entries)
    }

    pub async fn counts(&self) -> Result<Counts, ConciergeError> {
        let kb: i64 = sqlx::query("SELECT COUNT(*) AS n FROM kb_entries")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let sessions: i64 = sqlx::query("SELECT COUNT(*) AS n FROM chat_sessions")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let handoffs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM handoff_requests")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(Counts {
            kb_entries: kb,
            sessions,
            handoffs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::HandoffReason;

    async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.sqlite3")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn session_created_lazily_and_unique() {
        let (store, _dir) = temp_store().await;
        let a = store.get_or_create_session("+391234567890").await.unwrap();
        let b = store.get_or_create_session("+391234567890").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.booking_id.is_none());
    }

    #[tokio::test]
    async fn messages_are_ordered_oldest_first() {
        let (store, _dir) = temp_store().await;
        let s = store.get_or_create_session("+39000").await.unwrap();
        store.append_message(s.id, "user", "uno").await.unwrap();
        store.append_message(s.id, "assistant", "due").await.unwrap();
        store.append_message(s.id, "user", "tre").await.unwrap();

        let recent = store.recent_messages(s.id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "due");
        assert_eq!(recent[1].content, "tre");
    }

    #[tokio::test]
    async fn handoff_round_trip() {
        let (store, _dir) = temp_store().await;
        let event = HandoffEvent {
            phone_e164: "+39000".into(),
            guest_last_name: Some("Rossi".into()),
            property_id: Some("P1".into()),
            booking_id: Some("B1".into()),
            user_message: "serve aiuto".into(),
            reason: HandoffReason::NoKbAnswer,
        };
        store.insert_handoff(&event).await.unwrap();

        let rows = store.recent_handoffs(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reason, "no_kb_answer");
        assert_eq!(rows[0].guest_last_name.as_deref(), Some("Rossi"));
    }
}
