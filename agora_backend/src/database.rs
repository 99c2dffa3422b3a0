use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::forum::ItemId;

/// What a turn did to the forum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    StartTopic,
    Reply,
    Skip,
}

impl ActionKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ActionKind::StartTopic => "start_topic",
            ActionKind::Reply => "reply",
            ActionKind::Skip => "skip",
        }
    }

    fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start_topic" | "create_thread" => Some(ActionKind::StartTopic),
            "reply" | "reply_to_thread" => Some(ActionKind::Reply),
            "skip" => Some(ActionKind::Skip),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipationRecord {
    pub agent_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One row of the audit trail. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub agent_name: String,
    pub cycle_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub action_kind: ActionKind,
    pub target_item_id: Option<ItemId>,
    pub created_item_id: Option<ItemId>,
    pub success: bool,
    pub error: Option<String>,
    pub rationale: Option<String>,
}

impl TurnRecord {
    pub fn new(agent_name: &str, timestamp: DateTime<Utc>, action_kind: ActionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.to_string(),
            cycle_id: None,
            timestamp,
            action_kind,
            target_item_id: None,
            created_item_id: None,
            success: true,
            error: None,
            rationale: None,
        }
    }
}

fn to_stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

const TURN_COLUMNS: &str = "id, agent_name, cycle_id, run_timestamp, action_kind,
     target_item_id, created_item_id, success, error_message, rationale";

fn turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRecord> {
    let kind_raw: String = row.get(4)?;
    let action_kind = ActionKind::from_db(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown action kind '{}'", kind_raw).into(),
        )
    })?;
    Ok(TurnRecord {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        cycle_id: row.get(2)?,
        timestamp: parse_stamp(3, row.get(3)?)?,
        action_kind,
        target_item_id: row.get(5)?,
        created_item_id: row.get(6)?,
        success: row.get(7)?,
        error: row.get(8)?,
        rationale: row.get(9)?,
    })
}

/// Durable per-agent participation state: last run, seen items, turn history.
///
/// Every write is committed before the call returns, so a crash loses at
/// most the turn that was in flight.
pub struct ParticipationStore {
    conn: Mutex<Connection>,
}

impl ParticipationStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open state database {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_runs (
                agent_name TEXT PRIMARY KEY,
                last_run_at TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS seen_items (
                agent_name TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                seen_at TEXT NOT NULL,
                UNIQUE(agent_name, item_id)
            )"#,
            [],
        )?;

        // seq preserves append order independently of clock resolution
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS run_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                agent_name TEXT NOT NULL,
                cycle_id TEXT,
                run_timestamp TEXT NOT NULL,
                action_kind TEXT NOT NULL,
                target_item_id INTEGER,
                created_item_id INTEGER,
                success INTEGER NOT NULL,
                error_message TEXT,
                rationale TEXT
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_history_agent ON run_history(agent_name, seq)",
            [],
        )?;

        Ok(())
    }

    /// `None` means the agent has never run.
    pub fn get_last_run(&self, agent: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_run_at FROM agent_runs WHERE agent_name = ?1",
                [agent],
                |row| row.get(0),
            )
            .optional()?;

        match raw.flatten() {
            Some(raw) => Ok(Some(parse_stamp(0, raw)?)),
            None => Ok(None),
        }
    }

    /// Unconditional upsert; the caller always supplies the latest dispatch time.
    pub fn set_last_run(&self, agent: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::upsert_last_run(&conn, agent, timestamp)
    }

    fn upsert_last_run(conn: &Connection, agent: &str, timestamp: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT INTO agent_runs (agent_name, last_run_at, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_name) DO UPDATE SET last_run_at = excluded.last_run_at",
            params![agent, to_stamp(timestamp), to_stamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_participants(&self) -> Result<Vec<ParticipationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT agent_name, last_run_at, created_at FROM agent_runs ORDER BY agent_name ASC",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(ParticipationRecord {
                    agent_name: row.get(0)?,
                    last_run_at: row
                        .get::<_, Option<String>>(1)?
                        .map(|raw| parse_stamp(1, raw))
                        .transpose()?,
                    created_at: parse_stamp(2, row.get(2)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get_seen_items(&self, agent: &str) -> Result<HashSet<ItemId>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT item_id FROM seen_items WHERE agent_name = ?1")?;
        let ids = stmt
            .query_map([agent], |row| row.get(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Marking an item twice is a no-op.
    pub fn mark_seen(&self, agent: &str, item_id: ItemId) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO seen_items (agent_name, item_id, seen_at) VALUES (?1, ?2, ?3)",
            params![agent, item_id, to_stamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Same as [`mark_seen`](Self::mark_seen) for a batch, in one transaction.
    /// Returns how many items were new.
    pub fn mark_seen_many(&self, agent: &str, item_ids: &[ItemId]) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = to_stamp(Utc::now());
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_items (agent_name, item_id, seen_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for item_id in item_ids {
                inserted += stmt.execute(params![agent, item_id, now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Administrative reset. Returns the number of rows removed.
    pub fn clear_seen(&self, agent: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM seen_items WHERE agent_name = ?1", [agent])?;
        Ok(removed)
    }

    /// Append one turn to the audit trail.
    pub fn record_turn(&self, turn: &TurnRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::insert_turn(&conn, turn)
    }

    /// Append the turn and move `last_run_at` to its timestamp atomically, so
    /// a record never exists without the matching participation update.
    pub fn commit_turn(&self, turn: &TurnRecord) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::insert_turn(&tx, turn)?;
        Self::upsert_last_run(&tx, &turn.agent_name, turn.timestamp)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_turn(conn: &Connection, turn: &TurnRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO run_history
             (id, agent_name, cycle_id, run_timestamp, action_kind, target_item_id,
              created_item_id, success, error_message, rationale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                turn.id,
                turn.agent_name,
                turn.cycle_id,
                to_stamp(turn.timestamp),
                turn.action_kind.as_db_str(),
                turn.target_item_id,
                turn.created_item_id,
                turn.success,
                turn.error,
                turn.rationale,
            ],
        )
        .with_context(|| format!("Failed to record turn for {}", turn.agent_name))?;
        Ok(())
    }

    /// Turns in append order. With `limit`, the most recent `limit` turns.
    pub fn list_turns(&self, agent: Option<&str>, limit: Option<usize>) -> Result<Vec<TurnRecord>> {
        let conn = self.lock_conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM (
                 SELECT seq, {} FROM run_history
                 WHERE (?1 IS NULL OR agent_name = ?1)
                 ORDER BY seq DESC
                 LIMIT ?2
             ) ORDER BY seq ASC",
            TURN_COLUMNS, TURN_COLUMNS
        ))?;
        let turns = stmt
            .query_map(params![agent, limit], turn_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    pub fn count_turns(&self, agent: Option<&str>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_history WHERE (?1 IS NULL OR agent_name = ?1)",
            params![agent],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn last_run_is_absent_then_overwritten() {
        let store = ParticipationStore::open_in_memory().expect("db init");
        assert_eq!(store.get_last_run("opus").expect("read"), None);

        let later = Utc::now();
        let earlier = later - Duration::minutes(5);
        store.set_last_run("opus", later).expect("set");
        // No "only if newer" logic: the last write wins.
        store.set_last_run("opus", earlier).expect("set again");

        let stored = store.get_last_run("opus").expect("read").expect("present");
        assert_eq!(stored.timestamp_micros(), earlier.timestamp_micros());

        let participants = store.list_participants().expect("participants");
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].agent_name, "opus");
    }

    #[test]
    fn mark_seen_is_idempotent_and_clear_resets() {
        let store = ParticipationStore::open_in_memory().expect("db init");
        store.mark_seen("a", 7).expect("mark");
        store.mark_seen("a", 7).expect("mark duplicate");
        store.mark_seen("b", 7).expect("other agent");

        let seen = store.get_seen_items("a").expect("seen");
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&7));

        assert_eq!(store.mark_seen_many("a", &[7, 8, 9, 8]).expect("batch"), 2);
        assert_eq!(store.get_seen_items("a").expect("seen").len(), 3);

        assert_eq!(store.clear_seen("a").expect("clear"), 3);
        assert!(store.get_seen_items("a").expect("seen").is_empty());
        assert_eq!(store.get_seen_items("b").expect("seen").len(), 1);
    }

    #[test]
    fn turns_are_appended_in_order() {
        let store = ParticipationStore::open_in_memory().expect("db init");
        let base = Utc::now();
        for i in 0..5 {
            let kind = if i % 2 == 0 {
                ActionKind::Skip
            } else {
                ActionKind::Reply
            };
            let agent = if i < 3 { "a" } else { "b" };
            let mut turn = TurnRecord::new(agent, base + Duration::seconds(i), kind);
            turn.target_item_id = (kind == ActionKind::Reply).then_some(i);
            store.record_turn(&turn).expect("record");
        }

        let turns = store.list_turns(None, None).expect("list");
        assert_eq!(turns.len(), 5);
        assert!(turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(turns[1].action_kind, ActionKind::Reply);
        assert_eq!(turns[1].target_item_id, Some(1));

        assert_eq!(store.count_turns(Some("a")).expect("count"), 3);
        let recent = store.list_turns(Some("a"), Some(2)).expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].timestamp.timestamp(), (base + Duration::seconds(2)).timestamp());
    }

    #[test]
    fn commit_turn_updates_last_run_with_the_record() {
        let store = ParticipationStore::open_in_memory().expect("db init");
        let mut turn = TurnRecord::new("a", Utc::now(), ActionKind::StartTopic);
        turn.created_item_id = Some(3);
        turn.cycle_id = Some("cycle-1".to_string());
        store.commit_turn(&turn).expect("commit");

        let last = store.get_last_run("a").expect("read").expect("present");
        let stored = &store.list_turns(Some("a"), None).expect("list")[0];
        assert!(last >= stored.timestamp);
        assert_eq!(stored.id, turn.id);
        assert_eq!(stored.cycle_id.as_deref(), Some("cycle-1"));

        // Duplicate ids are rejected; the audit trail is never rewritten.
        assert!(store.commit_turn(&turn).is_err());
        assert_eq!(store.count_turns(None).expect("count"), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("agents.db");
        {
            let store = ParticipationStore::open(&path).expect("db init");
            store
                .commit_turn(&TurnRecord::new("a", Utc::now(), ActionKind::Skip))
                .expect("commit");
            store.mark_seen("a", 1).expect("mark");
        }

        let reopened = ParticipationStore::open(&path).expect("reopen");
        assert_eq!(reopened.count_turns(None).expect("count"), 1);
        assert!(reopened.get_last_run("a").expect("read").is_some());
        assert!(reopened.get_seen_items("a").expect("seen").contains(&1));
    }
}
