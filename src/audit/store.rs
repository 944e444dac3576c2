//! SQLite-backed message store with an append-only delivery log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row};

use super::types::{DeliveryLog, DeliveryStatus, MessageStatus, StoredMessage};
use crate::error::{Error, Result};
use crate::protocol::{format_instant, parse_instant, Envelope};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT UNIQUE NOT NULL,
        correlation_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        body_type TEXT NOT NULL,
        priority TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        expiration TEXT NOT NULL,
        raw_xml TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_correlation ON messages(correlation_id);
    CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
    CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient);
    CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
    CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);

    CREATE TABLE IF NOT EXISTS delivery_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        delivered_at TEXT NOT NULL,
        FOREIGN KEY (message_id) REFERENCES messages(message_id)
    );
    CREATE INDEX IF NOT EXISTS idx_delivery_message_id ON delivery_logs(message_id);
"#;

pub(crate) const MESSAGE_COLUMNS: &str = "id, message_id, correlation_id, sender, recipient, body_type, \
     priority, timestamp, expiration, raw_xml, status, created_at";

/// Durable message table plus per-attempt delivery log.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn =
            Connection::open(path).map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    /// Volatile store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("message store lock poisoned".to_string()))
    }

    /// Insert a message. A message id already stored is `Error::Duplicate`.
    pub fn save(&self, envelope: &Envelope, status: MessageStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (message_id, correlation_id, sender, recipient, body_type, priority, \
             timestamp, expiration, raw_xml, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                envelope.message_id,
                envelope.correlation_id,
                envelope.sender.agent_name,
                envelope.recipient.agent_name,
                envelope.body_type().as_str(),
                envelope.priority.as_str(),
                format_instant(envelope.timestamp),
                format_instant(envelope.expiration),
                envelope.raw,
                status.as_str(),
                format_instant(Utc::now()),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == ErrorCode::ConstraintViolation =>
            {
                Error::Duplicate(format!("message {}", envelope.message_id))
            }
            e => Error::Storage(format!("sqlite insert message: {}", e)),
        })?;
        Ok(())
    }

    pub fn find_by_id(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let mut found = self.query_messages(
            &format!("SELECT {} FROM messages WHERE message_id = ?1", MESSAGE_COLUMNS),
            &[message_id.to_string()],
        )?;
        Ok(found.pop())
    }

    /// Messages of one conversation, oldest first.
    pub fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE correlation_id = ?1 ORDER BY timestamp ASC, id ASC",
                MESSAGE_COLUMNS
            ),
            &[correlation_id.to_string()],
        )
    }

    /// Newest first.
    pub fn find_by_sender(&self, sender: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        self.find_by_column("sender", sender, limit)
    }

    /// Newest first.
    pub fn find_by_recipient(
        &self,
        recipient: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.find_by_column("recipient", recipient, limit)
    }

    /// Messages in one state, oldest first.
    pub fn find_by_status(&self, status: MessageStatus) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE status = ?1 ORDER BY timestamp ASC, id ASC",
                MESSAGE_COLUMNS
            ),
            &[status.as_str().to_string()],
        )
    }

    pub(crate) fn find_by_column(
        &self,
        column: &'static str,
        value: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE {} = ?1 ORDER BY timestamp DESC, id DESC{}",
                MESSAGE_COLUMNS,
                column,
                limit_clause(limit)
            ),
            &[value.to_string()],
        )
    }

    /// Returns false when the message is unknown.
    pub fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE messages SET status = ?1 WHERE message_id = ?2",
                params![status.as_str(), message_id],
            )
            .map_err(|e| Error::Storage(format!("sqlite update status: {}", e)))?;
        Ok(changed > 0)
    }

    /// Replace the stored wire text and header instants of a message.
    pub fn update_envelope(&self, envelope: &Envelope) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE messages SET raw_xml = ?1, timestamp = ?2, expiration = ?3 WHERE message_id = ?4",
                params![
                    envelope.raw,
                    format_instant(envelope.timestamp),
                    format_instant(envelope.expiration),
                    envelope.message_id
                ],
            )
            .map_err(|e| Error::Storage(format!("sqlite update envelope: {}", e)))?;
        Ok(changed > 0)
    }

    /// Record a replay in one transaction: the optional rewritten envelope,
    /// an attempt-0 `retry` log carrying `note`, and the return to pending.
    pub fn mark_replayed(
        &self,
        message_id: &str,
        refreshed: Option<&Envelope>,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("sqlite begin replay: {}", e)))?;
        if let Some(envelope) = refreshed {
            tx.execute(
                "UPDATE messages SET raw_xml = ?1, timestamp = ?2, expiration = ?3 WHERE message_id = ?4",
                params![
                    envelope.raw,
                    format_instant(envelope.timestamp),
                    format_instant(envelope.expiration),
                    envelope.message_id
                ],
            )
            .map_err(|e| Error::Storage(format!("sqlite update envelope: {}", e)))?;
        }
        tx.execute(
            "INSERT INTO delivery_logs (message_id, attempt_number, status, error_message, delivered_at) \
             VALUES (?1, 0, ?2, ?3, ?4)",
            params![
                message_id,
                DeliveryStatus::Retry.as_str(),
                note,
                format_instant(at)
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite insert delivery log: {}", e)))?;
        tx.execute(
            "UPDATE messages SET status = ?1 WHERE message_id = ?2",
            params![MessageStatus::Pending.as_str(), message_id],
        )
        .map_err(|e| Error::Storage(format!("sqlite update status: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::Storage(format!("sqlite commit replay: {}", e)))
    }

    pub fn log_delivery(
        &self,
        message_id: &str,
        attempt_number: u32,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.log_delivery_at(message_id, attempt_number, status, error_message, Utc::now())
    }

    pub fn log_delivery_at(
        &self,
        message_id: &str,
        attempt_number: u32,
        status: DeliveryStatus,
        error_message: Option<&str>,
        delivered_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO delivery_logs (message_id, attempt_number, status, error_message, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message_id,
                attempt_number,
                status.as_str(),
                error_message,
                format_instant(delivered_at)
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite insert delivery log: {}", e)))?;
        Ok(())
    }

    /// Delivery attempts of a message, in attempt order.
    pub fn delivery_logs(&self, message_id: &str) -> Result<Vec<DeliveryLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, message_id, attempt_number, status, error_message, delivered_at \
                 FROM delivery_logs WHERE message_id = ?1 ORDER BY attempt_number ASC, id ASC",
            )
            .map_err(|e| Error::Storage(format!("sqlite prepare delivery logs: {}", e)))?;
        let rows = stmt
            .query_map(params![message_id], delivery_from_row)
            .map_err(|e| Error::Storage(format!("sqlite query delivery logs: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("sqlite read delivery logs: {}", e)))
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| Error::Storage(format!("sqlite count messages: {}", e)))?;
        Ok(count as usize)
    }

    pub fn count_by_status(&self, status: MessageStatus) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("sqlite count by status: {}", e)))?;
        Ok(count as usize)
    }

    /// Delete messages created before `cutoff`, with their delivery logs.
    /// Returns the number of messages removed.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("sqlite begin prune: {}", e)))?;
        let cutoff = format_instant(cutoff);
        tx.execute(
            "DELETE FROM delivery_logs WHERE message_id IN \
             (SELECT message_id FROM messages WHERE timestamp < ?1)",
            params![cutoff],
        )
        .map_err(|e| Error::Storage(format!("sqlite prune delivery logs: {}", e)))?;
        let removed = tx
            .execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])
            .map_err(|e| Error::Storage(format!("sqlite prune messages: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::Storage(format!("sqlite commit prune: {}", e)))?;
        Ok(removed)
    }

    /// Run a message query with positional text parameters.
    pub(crate) fn query_messages(&self, sql: &str, values: &[String]) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("sqlite prepare messages: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), message_from_row)
            .map_err(|e| Error::Storage(format!("sqlite query messages: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("sqlite read messages: {}", e)))
    }
}

pub(crate) fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        correlation_id: row.get(2)?,
        sender: row.get(3)?,
        recipient: row.get(4)?,
        body_type: row.get(5)?,
        priority: row.get(6)?,
        timestamp: instant_column(row, 7)?,
        expiration: instant_column(row, 8)?,
        raw_xml: row.get(9)?,
        status: wire_column(row, 10)?,
        created_at: instant_column(row, 11)?,
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryLog> {
    Ok(DeliveryLog {
        id: row.get(0)?,
        message_id: row.get(1)?,
        attempt_number: row.get(2)?,
        status: wire_column(row, 3)?,
        error_message: row.get(4)?,
        delivered_at: instant_column(row, 5)?,
    })
}

pub(crate) fn instant_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_instant(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid instant: {}", text).into(),
        )
    })
}

pub(crate) fn wire_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
