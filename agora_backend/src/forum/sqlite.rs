use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{ForumStore, ItemDetail, ItemId, ItemSummary, Reply, SearchField};

const SUMMARY_COLUMNS: &str = "t.id, t.title, t.author, t.created_at,
     (SELECT COUNT(*) FROM posts p WHERE p.thread_id = t.id),
     t.updated_at";

/// Forum threads and replies kept in a local SQLite file.
pub struct SqliteForum {
    conn: Mutex<Connection>,
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ItemSummary> {
    Ok(ItemSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        created_at: row.get(3)?,
        reply_count: row.get(4)?,
        last_activity_at: row.get(5)?,
    })
}

impl SqliteForum {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Forum database lock poisoned: {}", e))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create forum directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open forum database {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let forum = Self {
            conn: Mutex::new(conn),
        };
        forum.ensure_schema()?;
        Ok(forum)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                author TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                body TEXT NOT NULL,
                author TEXT NOT NULL,
                quote_post_id INTEGER REFERENCES posts(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_updated_at ON threads(updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_posts_thread_id ON posts(thread_id);"#,
        )?;
        Ok(())
    }

    /// Total threads plus replies; handy for checking how many mutations happened.
    pub fn count_entries(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM threads) + (SELECT COUNT(*) FROM posts)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ForumStore for SqliteForum {
    async fn list_items(&self, limit: usize) -> Result<Vec<ItemSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM threads t ORDER BY t.updated_at DESC, t.id DESC LIMIT ?1",
            SUMMARY_COLUMNS
        ))?;
        let items = stmt
            .query_map([limit as i64], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    async fn read_item(&self, id: ItemId) -> Result<Option<ItemDetail>> {
        let conn = self.lock_conn()?;
        let head = conn
            .query_row(
                &format!("SELECT {}, t.body FROM threads t WHERE t.id = ?1", SUMMARY_COLUMNS),
                [id],
                |row| Ok((summary_from_row(row)?, row.get::<_, String>(6)?)),
            )
            .optional()?;

        let Some((summary, body)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, thread_id, author, body, created_at, quote_post_id
             FROM posts WHERE thread_id = ?1 ORDER BY id ASC",
        )?;
        let replies = stmt
            .query_map([id], |row| {
                Ok(Reply {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    author: row.get(2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                    quoted_id: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ItemDetail {
            summary,
            body,
            replies,
        }))
    }

    async fn create_item(&self, title: &str, body: &str, author: &str) -> Result<ItemId> {
        let conn = self.lock_conn()?;
        let now = now_stamp();
        conn.execute(
            "INSERT INTO threads (title, body, author, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![title, body, author, now.clone(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn reply_to_item(
        &self,
        id: ItemId,
        body: &str,
        author: &str,
        quoted_id: Option<ItemId>,
    ) -> Result<ItemId> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let thread_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if !thread_exists {
            anyhow::bail!("Thread {} does not exist", id);
        }

        if let Some(quoted) = quoted_id {
            let quoted_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE id = ?1 AND thread_id = ?2)",
                params![quoted, id],
                |row| row.get(0),
            )?;
            if !quoted_exists {
                anyhow::bail!("Quoted post {} does not exist in thread {}", quoted, id);
            }
        }

        let now = now_stamp();
        tx.execute(
            "INSERT INTO posts (thread_id, body, author, quote_post_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, body, author, quoted_id, now.clone()],
        )?;
        let post_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        tx.commit()?;

        Ok(post_id)
    }

    async fn search_items(
        &self,
        query: &str,
        field: SearchField,
        limit: usize,
    ) -> Result<Vec<ItemSummary>> {
        let condition = match field {
            SearchField::Title => "LOWER(t.title) LIKE ?1 ESCAPE '\\'",
            SearchField::Body => "LOWER(t.body) LIKE ?1 ESCAPE '\\'",
            SearchField::Author => "LOWER(t.author) LIKE ?1 ESCAPE '\\'",
            SearchField::All => {
                "(LOWER(t.title) LIKE ?1 ESCAPE '\\'
                  OR LOWER(t.body) LIKE ?1 ESCAPE '\\'
                  OR LOWER(t.author) LIKE ?1 ESCAPE '\\')"
            }
        };

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM threads t WHERE {} ORDER BY t.updated_at DESC, t.id DESC LIMIT ?2",
            SUMMARY_COLUMNS, condition
        ))?;
        let items = stmt
            .query_map(params![like_pattern(query), limit as i64], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}
