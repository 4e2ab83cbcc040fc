// ABOUTME: Durable SQLite message store with idempotent writes and sync tracking
// ABOUTME: Owns the messages, sync_state, and message_reads tables and their queries

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::message::{Message, MessageKind, MessageSource};

/// Thread-safe handle to the message database. Cheap to clone.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Connection>>,
}

/// Per-participant sync position plus how far behind they are.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub last_sync: i64,
    pub unsynced_count: i64,
}

/// A single read receipt for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadReceipt {
    pub reader_id: String,
    pub read_at: i64,
}

/// Optional constraints for message search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub sender: Option<String>,
    pub source: Option<MessageSource>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total: i64,
    pub today: i64,
    pub by_sender: HashMap<String, i64>,
}

impl MessageStore {
    /// Open (or create) the store under `store_dir`. The schema is applied
    /// idempotently on every open.
    pub fn new<P: AsRef<Path>>(store_dir: P) -> Result<Self> {
        let store_dir = store_dir.as_ref();
        std::fs::create_dir_all(store_dir)
            .with_context(|| format!("Failed to create store dir {}", store_dir.display()))?;
        let db_path = store_dir.join("messages.db");

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                source TEXT NOT NULL,
                at_targets TEXT,
                reply_to TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);

            CREATE TABLE IF NOT EXISTS sync_state (
                participant TEXT PRIMARY KEY,
                last_sync INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                reader_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, reader_id)
            );
            CREATE INDEX IF NOT EXISTS idx_reads_reader ON message_reads(reader_id);",
        )
        .context("Failed to initialize schema")?;

        tracing::info!(path = %db_path.display(), "Message store opened");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a message. Returns false if a message with the same id
    /// already exists (the write is silently skipped).
    pub fn add_message(&self, msg: &Message) -> Result<bool> {
        let at_targets = msg
            .at_targets
            .as_ref()
            .map(|t| serde_json::to_string(t))
            .transpose()
            .context("Failed to serialize at_targets")?;

        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let changed = db.execute(
            "INSERT OR IGNORE INTO messages (id, type, sender, content, timestamp, source, at_targets, reply_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.kind.to_string(),
                msg.sender,
                msg.content,
                msg.timestamp,
                msg.source.to_string(),
                at_targets,
                msg.reply_to,
            ],
        )?;

        if changed == 0 {
            tracing::debug!(message_id = %msg.id, "Duplicate message ignored");
        }
        Ok(changed > 0)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT id, type, sender, content, timestamp, source, at_targets, reply_to
             FROM messages WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    /// Delete a message and its read receipts in one transaction.
    /// Returns true if a message row was removed.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let mut db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM message_reads WHERE message_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Most recent `limit` messages, returned oldest-first.
    pub fn get_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT id, type, sender, content, timestamp, source, at_targets, reply_to
             FROM messages ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map(params![limit as i64], |row| {
                Ok(row_to_message(row))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Messages newer than a participant's recorded sync position,
    /// oldest-first.
    pub fn get_unsynced_messages(&self, participant: &str) -> Result<Vec<Message>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT m.id, m.type, m.sender, m.content, m.timestamp, m.source, m.at_targets, m.reply_to
             FROM messages m
             WHERE m.timestamp > COALESCE(
                 (SELECT last_sync FROM sync_state WHERE participant = ?1), 0)
             ORDER BY m.timestamp ASC",
        )?;
        let messages = stmt
            .query_map(params![participant], |row| Ok(row_to_message(row)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Record that `participant` has seen everything up to `timestamp`.
    /// The stored position never moves backwards.
    pub fn mark_synced(&self, participant: &str, timestamp: i64) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT INTO sync_state (participant, last_sync) VALUES (?1, ?2)
             ON CONFLICT(participant) DO UPDATE SET
                 last_sync = MAX(last_sync, excluded.last_sync)",
            params![participant, timestamp],
        )?;
        Ok(())
    }

    /// Sync position and backlog depth for every known participant.
    pub fn sync_status(&self) -> Result<HashMap<String, SyncStatus>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT s.participant, s.last_sync,
                    (SELECT COUNT(*) FROM messages m WHERE m.timestamp > s.last_sync)
             FROM sync_state s",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                SyncStatus {
                    last_sync: row.get(1)?,
                    unsynced_count: row.get(2)?,
                },
            ))
        })?;
        let mut status = HashMap::new();
        for row in rows {
            let (participant, s) = row?;
            status.insert(participant, s);
        }
        Ok(status)
    }

    /// Full-text-ish search over message content with optional filters.
    pub fn search_messages(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Message>> {
        let mut sql = String::from(
            "SELECT id, type, sender, content, timestamp, source, at_targets, reply_to
             FROM messages WHERE content LIKE ?",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(format!("%{}%", query))];

        if let Some(sender) = &filters.sender {
            sql.push_str(" AND sender = ?");
            args.push(Box::new(sender.clone()));
        }
        if let Some(source) = &filters.source {
            sql.push_str(" AND source = ?");
            args.push(Box::new(source.to_string()));
        }
        if let Some(start) = filters.start_time {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(start));
        }
        if let Some(end) = filters.end_time {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(end));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
        args.push(Box::new(filters.limit.unwrap_or(50) as i64));
        args.push(Box::new(filters.offset.unwrap_or(0) as i64));

        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(&sql)?;
        let messages = stmt
            .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(row_to_message(row))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Record that `reader` has read one message. Re-reads refresh read_at.
    pub fn mark_as_read(&self, message_id: &str, reader: &str, read_at: i64) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        db.execute(
            "INSERT OR REPLACE INTO message_reads (message_id, reader_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![message_id, reader, read_at],
        )?;
        Ok(())
    }

    /// Mark every message at or before `before_ts` as read by `reader`,
    /// skipping the reader's own messages. A single statement, so no
    /// message written concurrently can be half-marked. Returns how many
    /// receipts were created.
    pub fn mark_all_as_read(&self, reader: &str, before_ts: i64, read_at: i64) -> Result<usize> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let changed = db.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, reader_id, read_at)
             SELECT m.id, ?1, ?3
             FROM messages m
             LEFT JOIN message_reads r
                 ON r.message_id = m.id AND r.reader_id = ?1
             WHERE m.timestamp <= ?2
               AND m.sender != ?1
               AND r.message_id IS NULL",
            params![reader, before_ts, read_at],
        )?;
        tracing::debug!(reader = %reader, marked = changed, "Marked messages read");
        Ok(changed)
    }

    /// Messages `reader` hasn't read yet (excluding their own), oldest-first.
    pub fn get_unread_messages(&self, reader: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT m.id, m.type, m.sender, m.content, m.timestamp, m.source, m.at_targets, m.reply_to
             FROM messages m
             LEFT JOIN message_reads r
                 ON r.message_id = m.id AND r.reader_id = ?1
             WHERE m.sender != ?1 AND r.message_id IS NULL
             ORDER BY m.timestamp ASC LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![reader, limit as i64], |row| {
                Ok(row_to_message(row))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn get_unread_count(&self, reader: &str) -> Result<i64> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let count = db.query_row(
            "SELECT COUNT(*)
             FROM messages m
             LEFT JOIN message_reads r
                 ON r.message_id = m.id AND r.reader_id = ?1
             WHERE m.sender != ?1 AND r.message_id IS NULL",
            params![reader],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Who has read a given message, in read order.
    pub fn read_status(&self, message_id: &str) -> Result<Vec<ReadReceipt>> {
        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let mut stmt = db.prepare(
            "SELECT reader_id, read_at FROM message_reads
             WHERE message_id = ?1 ORDER BY read_at ASC",
        )?;
        let receipts = stmt
            .query_map(params![message_id], |row| {
                Ok(ReadReceipt {
                    reader_id: row.get(0)?,
                    read_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(receipts)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let midnight = chrono::Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(chrono::Local).single())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);

        let db = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))?;
        let total = db.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let today = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE timestamp >= ?1",
            params![midnight],
            |row| row.get(0),
        )?;

        let mut stmt =
            db.prepare("SELECT sender, COUNT(*) FROM messages GROUP BY sender")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut by_sender = HashMap::new();
        for row in rows {
            let (sender, count) = row?;
            by_sender.insert(sender, count);
        }

        Ok(StoreStats {
            total,
            today,
            by_sender,
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message> {
    let kind_str: String = row.get(1)?;
    let source_str: String = row.get(5)?;
    let at_targets_json: Option<String> = row.get(6)?;

    let kind: MessageKind = kind_str
        .parse()
        .with_context(|| format!("Bad message kind in database: {}", kind_str))?;
    let source: MessageSource = source_str
        .parse()
        .with_context(|| format!("Bad message source in database: {}", source_str))?;
    let at_targets = at_targets_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .context("Bad at_targets JSON in database")?;

    Ok(Message {
        id: row.get(0)?,
        kind,
        sender: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        source,
        at_targets,
        reply_to: row.get(7)?,
        forwarded: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (MessageStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();
        (store, dir)
    }

    fn msg(id: &str, sender: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            kind: MessageKind::Human,
            sender: sender.to_string(),
            content: format!("message {}", id),
            timestamp: ts,
            source: MessageSource::Web,
            at_targets: None,
            reply_to: None,
            forwarded: None,
        }
    }

    #[test]
    fn test_add_message_idempotent() {
        let (store, _dir) = test_store();
        let m = msg("m1", "alice", 100);
        assert!(store.add_message(&m).unwrap());
        assert!(!store.add_message(&m).unwrap());
        assert_eq!(store.get_messages(10).unwrap().len(), 1);
    }

    #[test]
    fn test_get_messages_oldest_first_window() {
        let (store, _dir) = test_store();
        for i in 0..5 {
            store.add_message(&msg(&format!("m{}", i), "alice", i)).unwrap();
        }
        let recent = store.get_messages(3).unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_at_targets_round_trip() {
        let (store, _dir) = test_store();
        let mut m = msg("m1", "alice", 100);
        m.at_targets = Some(vec!["bot".to_string(), "bob".to_string()]);
        store.add_message(&m).unwrap();
        let loaded = store.get_message("m1").unwrap().unwrap();
        assert_eq!(
            loaded.at_targets,
            Some(vec!["bot".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn test_sync_position_monotonic() {
        let (store, _dir) = test_store();
        store.mark_synced("web", 500).unwrap();
        store.mark_synced("web", 300).unwrap();
        let status = store.sync_status().unwrap();
        assert_eq!(status["web"].last_sync, 500);
    }

    #[test]
    fn test_unsynced_messages() {
        let (store, _dir) = test_store();
        for i in 1..=4 {
            store.add_message(&msg(&format!("m{}", i), "alice", i * 100)).unwrap();
        }
        store.mark_synced("web", 200).unwrap();
        let unsynced = store.get_unsynced_messages("web").unwrap();
        let ids: Vec<_> = unsynced.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
        // Unknown participant gets everything
        assert_eq!(store.get_unsynced_messages("im").unwrap().len(), 4);
    }

    #[test]
    fn test_mark_all_as_read_skips_own_and_counts() {
        let (store, _dir) = test_store();
        store.add_message(&msg("m1", "alice", 100)).unwrap();
        store.add_message(&msg("m2", "bob", 200)).unwrap();
        store.add_message(&msg("m3", "alice", 300)).unwrap();
        store.add_message(&msg("m4", "bob", 400)).unwrap();

        let marked = store.mark_all_as_read("bob", 300, 1000).unwrap();
        assert_eq!(marked, 2); // m1 and m3 only
        assert_eq!(store.get_unread_count("bob").unwrap(), 0);

        // Second pass marks nothing new
        assert_eq!(store.mark_all_as_read("bob", 300, 2000).unwrap(), 0);
        let receipts = store.read_status("m1").unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].read_at, 1000);
    }

    #[test]
    fn test_mark_as_read_counts_per_reader() {
        let (store, _dir) = test_store();
        store.add_message(&msg("m1", "alice", 100)).unwrap();
        store.mark_as_read("m1", "bob", 150).unwrap();

        // Read for bob, still unread for carol
        assert_eq!(store.get_unread_count("bob").unwrap(), 0);
        assert_eq!(store.get_unread_count("carol").unwrap(), 1);
        assert!(store.get_unread_messages("bob", 10).unwrap().is_empty());
        assert_eq!(store.get_unread_messages("carol", 10).unwrap()[0].id, "m1");
    }

    #[test]
    fn test_unread_excludes_own_messages() {
        let (store, _dir) = test_store();
        store.add_message(&msg("m1", "alice", 100)).unwrap();
        store.add_message(&msg("m2", "bob", 200)).unwrap();
        let unread = store.get_unread_messages("alice", 10).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "m2");
    }

    #[test]
    fn test_search_with_filters() {
        let (store, _dir) = test_store();
        let mut m1 = msg("m1", "alice", 100);
        m1.content = "deploy finished".to_string();
        let mut m2 = msg("m2", "bob", 200);
        m2.content = "deploy failed".to_string();
        store.add_message(&m1).unwrap();
        store.add_message(&m2).unwrap();

        let all = store.search_messages("deploy", &SearchFilters::default()).unwrap();
        assert_eq!(all.len(), 2);

        let filters = SearchFilters {
            sender: Some("bob".to_string()),
            ..Default::default()
        };
        let bobs = store.search_messages("deploy", &filters).unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id, "m2");
    }

    #[test]
    fn test_delete_message() {
        let (store, _dir) = test_store();
        store.add_message(&msg("m1", "alice", 100)).unwrap();
        store.mark_as_read("m1", "bob", 150).unwrap();
        assert!(store.delete_message("m1").unwrap());
        assert!(!store.delete_message("m1").unwrap());
        assert!(store.get_message("m1").unwrap().is_none());
        assert!(store.read_status("m1").unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let (store, _dir) = test_store();
        let now = crate::message::now_ms();
        store.add_message(&msg("m1", "alice", now)).unwrap();
        store.add_message(&msg("m2", "alice", now)).unwrap();
        store.add_message(&msg("m3", "bob", 5)).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.today, 2);
        assert_eq!(stats.by_sender["alice"], 2);
        assert_eq!(stats.by_sender["bob"], 1);
    }
}
