//! SQLite persistence adapter (component B).
//!
//! Treated by the rest of the core as an opaque store: callers never see
//! SQL, only the operations below. Four tables — settings, peers, messages,
//! files — created in WAL mode on open.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreResult;

pub struct Db {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerRow {
    pub guid: String,
    pub name: String,
    pub public_key: Option<String>,
    pub ip: String,
    pub port: u16,
    pub last_seen: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub sender_guid: String,
    pub receiver_guid: String,
    pub kind: String,
    pub scope: String,
    pub content: Vec<u8>,
    pub timestamp: i64,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileRow {
    pub file_id: String,
    pub sender_guid: String,
    pub receiver_guid: Option<String>,
    pub filename: String,
    pub path: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: i64,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    pub fn open_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peers (
                guid       TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                public_key TEXT,
                ip         TEXT NOT NULL,
                port       INTEGER NOT NULL,
                last_seen  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id            TEXT PRIMARY KEY,
                sender_guid   TEXT NOT NULL,
                receiver_guid TEXT NOT NULL,
                kind          TEXT NOT NULL,
                scope         TEXT NOT NULL,
                content       BLOB NOT NULL,
                timestamp     INTEGER NOT NULL,
                source_ip     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS files (
                file_id       TEXT PRIMARY KEY,
                sender_guid   TEXT NOT NULL,
                receiver_guid TEXT,
                filename      TEXT NOT NULL,
                path          TEXT NOT NULL,
                size          INTEGER NOT NULL,
                mime_type     TEXT NOT NULL,
                created_at    INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── settings ─────────────────────────────────────────────────────

    pub fn save_setting(&self, key: &str, value: &str) -> CoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn load_setting(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self
            .conn
            .lock()
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    // ── peers ────────────────────────────────────────────────────────

    pub fn upsert_peer(&self, peer: &PeerRow) -> CoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO peers (guid, name, public_key, ip, port, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(guid) DO UPDATE SET
                name = excluded.name,
                public_key = COALESCE(excluded.public_key, peers.public_key),
                ip = excluded.ip,
                port = excluded.port,
                last_seen = excluded.last_seen",
            params![peer.guid, peer.name, peer.public_key, peer.ip, peer.port, peer.last_seen],
        )?;
        Ok(())
    }

    pub fn get_peer(&self, guid: &str) -> CoreResult<Option<PeerRow>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT guid, name, public_key, ip, port, last_seen FROM peers WHERE guid = ?1",
                params![guid],
                Self::row_to_peer,
            )
            .optional()?)
    }

    pub fn list_peers_since(&self, cutoff: i64) -> CoreResult<Vec<PeerRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT guid, name, public_key, ip, port, last_seen FROM peers WHERE last_seen > ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], Self::row_to_peer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_peer(&self, guid: &str) -> CoreResult<()> {
        self.conn.lock().execute("DELETE FROM peers WHERE guid = ?1", params![guid])?;
        Ok(())
    }

    fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<PeerRow> {
        Ok(PeerRow {
            guid: row.get(0)?,
            name: row.get(1)?,
            public_key: row.get(2)?,
            ip: row.get(3)?,
            port: row.get::<_, i64>(4)? as u16,
            last_seen: row.get(5)?,
        })
    }

    // ── messages ─────────────────────────────────────────────────────

    /// Authoritative dedup check: `id` is the table's literal primary key,
    /// so this is a direct lookup rather than a scan over a surrogate key.
    pub fn message_exists(&self, id: &str) -> CoreResult<bool> {
        Ok(self
            .conn
            .lock()
            .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Inserts the message, returning `Ok(false)` without writing if the id
    /// already exists (at-most-once per node).
    pub fn insert_message(&self, msg: &MessageRow) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO messages
                (id, sender_guid, receiver_guid, kind, scope, content, timestamp, source_ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.sender_guid,
                msg.receiver_guid,
                msg.kind,
                msg.scope,
                msg.content,
                msg.timestamp,
                msg.source_ip,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn list_messages_since(&self, since: i64, limit: i64) -> CoreResult<Vec<MessageRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender_guid, receiver_guid, kind, scope, content, timestamp, source_ip
             FROM messages WHERE timestamp >= ?1 ORDER BY timestamp ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since, limit], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    sender_guid: row.get(1)?,
                    receiver_guid: row.get(2)?,
                    kind: row.get(3)?,
                    scope: row.get(4)?,
                    content: row.get(5)?,
                    timestamp: row.get(6)?,
                    source_ip: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn truncate_messages(&self) -> CoreResult<()> {
        self.conn.lock().execute("DELETE FROM messages", [])?;
        Ok(())
    }

    /// Daily sweep: delete messages older than the retention window.
    pub fn delete_messages_older_than(&self, cutoff: i64) -> CoreResult<usize> {
        Ok(self
            .conn
            .lock()
            .execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])?)
    }

    // ── files ────────────────────────────────────────────────────────

    pub fn insert_file(&self, file: &FileRow) -> CoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO files
                (file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.file_id,
                file.sender_guid,
                file.receiver_guid,
                file.filename,
                file.path,
                file.size,
                file.mime_type,
                file.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, file_id: &str) -> CoreResult<Option<FileRow>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at
                 FROM files WHERE file_id = ?1",
                params![file_id],
                Self::row_to_file,
            )
            .optional()?)
    }

    pub fn list_files(&self) -> CoreResult<Vec<FileRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at FROM files",
        )?;
        let rows = stmt.query_map([], Self::row_to_file)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn truncate_files(&self) -> CoreResult<()> {
        self.conn.lock().execute("DELETE FROM files", [])?;
        Ok(())
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRow> {
        Ok(FileRow {
            file_id: row.get(0)?,
            sender_guid: row.get(1)?,
            receiver_guid: row.get(2)?,
            filename: row.get(3)?,
            path: row.get(4)?,
            size: row.get(5)?,
            mime_type: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}
