//! Append-only, tamper-evident audit log.
//!
//! Each event carries a SHA-256 over its own stored fields, so any event can be
//! verified on its own regardless of insertion order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use super::store::{instant_column, limit_clause, wire_column};
use super::types::{
    AuditEvent, AuditEventType, AuditStats, ComplianceReport, IntegrityReport, TimeRange,
};
use crate::error::{Error, Result};
use crate::protocol::{format_instant, generate_id};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT UNIQUE NOT NULL,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        message_id TEXT NOT NULL,
        actor_agent TEXT NOT NULL,
        details TEXT NOT NULL,
        immutable_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_events(event_type);
    CREATE INDEX IF NOT EXISTS idx_audit_message_id ON audit_events(message_id);
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_events(actor_agent);
"#;

const EVENT_COLUMNS: &str =
    "event_id, timestamp, event_type, message_id, actor_agent, details, immutable_hash";

/// Filter for [`AuditLogger::search`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub message_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub actor: Option<String>,
    pub range: Option<TimeRange>,
    pub limit: Option<usize>,
}

pub struct AuditLogger {
    conn: Mutex<Connection>,
}

impl AuditLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("sqlite open audit log: {}", e)))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("sqlite open audit log: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("sqlite init audit log: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("audit log lock poisoned".to_string()))
    }

    /// Append an event stamped with the current time.
    pub fn log(
        &self,
        event_type: AuditEventType,
        message_id: &str,
        actor: &str,
        details: serde_json::Value,
    ) -> Result<AuditEvent> {
        self.log_at(event_type, message_id, actor, details, Utc::now())
    }

    pub fn log_at(
        &self,
        event_type: AuditEventType,
        message_id: &str,
        actor: &str,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditEvent> {
        let event_id = generate_id();
        let stamp = format_instant(timestamp);
        let details_json = serde_json::to_string(&details)?;
        let hash = compute_hash(
            &event_id,
            &stamp,
            event_type.as_str(),
            message_id,
            actor,
            &details_json,
        );

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_events (event_id, timestamp, event_type, message_id, actor_agent, \
             details, immutable_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event_id,
                stamp,
                event_type.as_str(),
                message_id,
                actor,
                details_json,
                hash,
                format_instant(Utc::now()),
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite insert audit event: {}", e)))?;

        Ok(AuditEvent {
            event_id,
            timestamp,
            event_type,
            message_id: message_id.to_string(),
            actor_agent: actor.to_string(),
            details,
            immutable_hash: hash,
        })
    }

    /// Every event of one message, oldest first.
    pub fn trail(&self, message_id: &str) -> Result<Vec<AuditEvent>> {
        self.query(
            &format!(
                "SELECT {} FROM audit_events WHERE message_id = ?1 ORDER BY timestamp ASC, id ASC",
                EVENT_COLUMNS
            ),
            &[message_id.to_string()],
        )
    }

    /// Newest first.
    pub fn events_by_type(
        &self,
        event_type: AuditEventType,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEvent>> {
        self.search(&AuditQuery {
            event_type: Some(event_type),
            limit,
            ..Default::default()
        })
    }

    /// Newest first.
    pub fn events_by_actor(&self, actor: &str, limit: Option<usize>) -> Result<Vec<AuditEvent>> {
        self.search(&AuditQuery {
            actor: Some(actor.to_string()),
            limit,
            ..Default::default()
        })
    }

    /// Events inside `range`, oldest first.
    pub fn events_in_range(&self, range: &TimeRange) -> Result<Vec<AuditEvent>> {
        self.query(
            &format!(
                "SELECT {} FROM audit_events WHERE timestamp >= ?1 AND timestamp <= ?2 \
                 ORDER BY timestamp ASC, id ASC",
                EVENT_COLUMNS
            ),
            &[format_instant(range.start), format_instant(range.end)],
        )
    }

    /// Events matching every set field, newest first.
    pub fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut clauses = String::new();
        let mut values = Vec::new();
        let mut push = |clause: &str, value: String| {
            values.push(value);
            clauses.push_str(&format!(" AND {} ?{}", clause, values.len()));
        };

        if let Some(message_id) = &query.message_id {
            push("message_id =", message_id.clone());
        }
        if let Some(event_type) = query.event_type {
            push("event_type =", event_type.as_str().to_string());
        }
        if let Some(actor) = &query.actor {
            push("actor_agent =", actor.clone());
        }
        if let Some(range) = &query.range {
            push("timestamp >=", format_instant(range.start));
            push("timestamp <=", format_instant(range.end));
        }

        self.query(
            &format!(
                "SELECT {} FROM audit_events WHERE 1=1{} ORDER BY timestamp DESC, id DESC{}",
                EVENT_COLUMNS,
                clauses,
                limit_clause(query.limit)
            ),
            &values,
        )
    }

    /// Aggregate the events of `range` into a compliance report.
    pub fn report(&self, range: &TimeRange) -> Result<ComplianceReport> {
        let events = self.events_in_range(range)?;

        let mut by_event_type = BTreeMap::new();
        let mut validation_failures = 0;
        let mut expired_messages = 0;
        let mut first_attempt: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut delivered: HashMap<&str, DateTime<Utc>> = HashMap::new();

        for event in &events {
            *by_event_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            match event.event_type {
                AuditEventType::ValidationFailed => validation_failures += 1,
                AuditEventType::MessageExpired => expired_messages += 1,
                AuditEventType::DeliveryAttempted => {
                    first_attempt
                        .entry(event.message_id.as_str())
                        .or_insert(event.timestamp);
                }
                AuditEventType::DeliverySuccess => {
                    if first_attempt.contains_key(event.message_id.as_str()) {
                        delivered
                            .entry(event.message_id.as_str())
                            .or_insert(event.timestamp);
                    }
                }
                _ => {}
            }
        }

        let delivery_success_rate = if first_attempt.is_empty() {
            0.0
        } else {
            delivered.len() as f64 / first_attempt.len() as f64 * 100.0
        };

        let durations: Vec<f64> = delivered
            .iter()
            .filter_map(|(id, done)| first_attempt.get(id).map(|start| *done - *start))
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();
        let average_delivery_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Ok(ComplianceReport {
            range: *range,
            total_events: events.len(),
            by_event_type,
            validation_failures,
            delivery_success_rate,
            average_delivery_seconds,
            expired_messages,
        })
    }

    /// Recompute an event's hash from its stored fields. Unknown events fail.
    pub fn verify_integrity(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT event_id, timestamp, event_type, message_id, actor_agent, details, immutable_hash \
                 FROM audit_events WHERE event_id = ?1",
                params![event_id],
                |row| {
                    let fields: [String; 7] = [
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ];
                    Ok(fields)
                },
            )
            .optional()
            .map_err(|e| Error::Storage(format!("sqlite read audit event: {}", e)))?;

        Ok(match row {
            Some([id, stamp, kind, message_id, actor, details, stored]) => {
                compute_hash(&id, &stamp, &kind, &message_id, &actor, &details) == stored
            }
            None => false,
        })
    }

    /// Verify every event, or those inside `range`.
    pub fn verify_integrity_batch(&self, range: Option<&TimeRange>) -> Result<IntegrityReport> {
        let ids: Vec<String> = {
            let conn = self.conn()?;
            let (sql, values) = match range {
                Some(range) => (
                    "SELECT event_id FROM audit_events WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY id",
                    vec![format_instant(range.start), format_instant(range.end)],
                ),
                None => ("SELECT event_id FROM audit_events ORDER BY id", Vec::new()),
            };
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| Error::Storage(format!("sqlite prepare audit ids: {}", e)))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get(0))
                .map_err(|e| Error::Storage(format!("sqlite query audit ids: {}", e)))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
                .map_err(|e| Error::Storage(format!("sqlite read audit ids: {}", e)))?
        };

        let mut verified = 0;
        for id in &ids {
            if self.verify_integrity(id)? {
                verified += 1;
            }
        }
        Ok(IntegrityReport {
            total: ids.len(),
            verified,
            failed: ids.len() - verified,
        })
    }

    pub fn stats(&self) -> Result<AuditStats> {
        let events = self.query(
            &format!("SELECT {} FROM audit_events ORDER BY id", EVENT_COLUMNS),
            &[],
        )?;
        let mut by_event_type = BTreeMap::new();
        let mut messages = HashSet::new();
        let mut actors = HashSet::new();
        for event in &events {
            *by_event_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            messages.insert(event.message_id.as_str());
            actors.insert(event.actor_agent.as_str());
        }
        Ok(AuditStats {
            total_events: events.len(),
            by_event_type,
            unique_messages: messages.len(),
            unique_actors: actors.len(),
        })
    }

    /// Retention purge. Returns the number of events removed.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM audit_events WHERE timestamp < ?1",
            params![format_instant(cutoff)],
        )
        .map_err(|e| Error::Storage(format!("sqlite prune audit events: {}", e)))
    }

    fn query(&self, sql: &str, values: &[String]) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("sqlite prepare audit events: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), event_from_row)
            .map_err(|e| Error::Storage(format!("sqlite query audit events: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("sqlite read audit events: {}", e)))
    }
}

/// Hex SHA-256 of the pipe-joined event fields.
fn compute_hash(
    event_id: &str,
    timestamp: &str,
    event_type: &str,
    message_id: &str,
    actor: &str,
    details_json: &str,
) -> String {
    let data = format!(
        "{}|{}|{}|{}|{}|{}",
        event_id, timestamp, event_type, message_id, actor, details_json
    );
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let details: String = row.get(5)?;
    let details = serde_json::from_str(&details)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(AuditEvent {
        event_id: row.get(0)?,
        timestamp: instant_column(row, 1)?,
        event_type: wire_column(row, 2)?,
        message_id: row.get(3)?,
        actor_agent: row.get(4)?,
        details,
        immutable_hash: row.get(6)?,
    })
}
