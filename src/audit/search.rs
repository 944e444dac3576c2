//! Read-only queries and aggregates over the message store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use serde::Serialize;

use super::store::{limit_clause, MessageStore, MESSAGE_COLUMNS};
use super::types::{MessageStatus, StoredMessage, TimeRange};
use crate::error::{Error, Result};
use crate::protocol::{format_instant, BodyType, Priority};

/// Conjunctive message filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub body_type: Option<BodyType>,
    pub priority: Option<Priority>,
    pub status: Option<MessageStatus>,
    pub range: Option<TimeRange>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub total_messages: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub by_body_type: BTreeMap<String, usize>,
    /// Percentage (0-100) of messages in the delivered state
    pub delivery_rate: f64,
    /// Seconds from message timestamp to first successful delivery
    pub avg_delivery_seconds: f64,
}

/// Agent name with its message count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked {
    pub agent: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub period: String,
    pub count: usize,
}

/// Bucket width for [`MessageSearch::trends`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendInterval {
    Hour,
    Day,
    Week,
}

impl TrendInterval {
    fn format(&self) -> &'static str {
        match self {
            TrendInterval::Hour => "%Y-%m-%d %H:00:00",
            TrendInterval::Day => "%Y-%m-%d",
            TrendInterval::Week => "%Y-W%W",
        }
    }
}

impl std::str::FromStr for TrendInterval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hour" => Ok(TrendInterval::Hour),
            "day" => Ok(TrendInterval::Day),
            "week" => Ok(TrendInterval::Week),
            _ => Err(format!("Unknown interval: {} (expected hour, day or week)", s)),
        }
    }
}

/// Accumulates `AND` clauses with their positional parameters.
#[derive(Default)]
struct Filter {
    clauses: String,
    values: Vec<String>,
}

impl Filter {
    fn eq(&mut self, column: &str, value: impl Into<String>) -> &mut Self {
        self.values.push(value.into());
        self.clauses
            .push_str(&format!(" AND {} = ?{}", column, self.values.len()));
        self
    }

    fn since(&mut self, column: &str, start: DateTime<Utc>) -> &mut Self {
        self.values.push(format_instant(start));
        self.clauses
            .push_str(&format!(" AND {} >= ?{}", column, self.values.len()));
        self
    }

    fn range(&mut self, column: &str, range: Option<&TimeRange>) -> &mut Self {
        if let Some(range) = range {
            self.since(column, range.start);
            self.values.push(format_instant(range.end));
            self.clauses
                .push_str(&format!(" AND {} <= ?{}", column, self.values.len()));
        }
        self
    }
}

pub struct MessageSearch<'a> {
    store: &'a MessageStore,
}

impl<'a> MessageSearch<'a> {
    pub fn new(store: &'a MessageStore) -> Self {
        Self { store }
    }

    /// Messages whose timestamp falls in `range`, newest first.
    pub fn find_by_time_range(&self, range: &TimeRange) -> Result<Vec<StoredMessage>> {
        let mut filter = Filter::default();
        filter.range("timestamp", Some(range));
        self.select(&filter, None)
    }

    pub fn find_by_sender(&self, sender: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        self.store.find_by_sender(sender, limit)
    }

    pub fn find_by_recipient(
        &self,
        recipient: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.store.find_by_recipient(recipient, limit)
    }

    pub fn find_conversation_chain(&self, correlation_id: &str) -> Result<Vec<StoredMessage>> {
        self.store.find_by_correlation(correlation_id)
    }

    pub fn find_failed(&self, since: Option<DateTime<Utc>>) -> Result<Vec<StoredMessage>> {
        self.find_in_state(MessageStatus::Failed, since)
    }

    pub fn find_expired(&self, since: Option<DateTime<Utc>>) -> Result<Vec<StoredMessage>> {
        self.find_in_state(MessageStatus::Expired, since)
    }

    fn find_in_state(
        &self,
        status: MessageStatus,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let mut filter = Filter::default();
        filter.eq("status", status.as_str());
        if let Some(since) = since {
            filter.since("timestamp", since);
        }
        self.select(&filter, None)
    }

    pub fn find_by_body_type(
        &self,
        body_type: BodyType,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.store.find_by_column("body_type", body_type.as_str(), limit)
    }

    pub fn find_by_priority(
        &self,
        priority: Priority,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.store.find_by_column("priority", priority.as_str(), limit)
    }

    /// Messages matching every set criterion, newest first.
    pub fn search(&self, criteria: &SearchCriteria) -> Result<Vec<StoredMessage>> {
        let mut filter = Filter::default();
        if let Some(sender) = &criteria.sender {
            filter.eq("sender", sender.as_str());
        }
        if let Some(recipient) = &criteria.recipient {
            filter.eq("recipient", recipient.as_str());
        }
        if let Some(body_type) = criteria.body_type {
            filter.eq("body_type", body_type.as_str());
        }
        if let Some(priority) = criteria.priority {
            filter.eq("priority", priority.as_str());
        }
        if let Some(status) = criteria.status {
            filter.eq("status", status.as_str());
        }
        filter.range("timestamp", criteria.range.as_ref());
        self.select(&filter, criteria.limit)
    }

    fn select(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE 1=1{} ORDER BY timestamp DESC, id DESC{}",
            MESSAGE_COLUMNS,
            filter.clauses,
            limit_clause(limit)
        );
        self.store.query_messages(&sql, &filter.values)
    }

    /// Volume, mix and delivery figures, optionally restricted to `range`.
    pub fn stats(&self, range: Option<&TimeRange>) -> Result<MessageStats> {
        let mut filter = Filter::default();
        filter.range("timestamp", range);

        let grouped = |column: &str| -> Result<BTreeMap<String, usize>> {
            let sql = format!(
                "SELECT {col}, COUNT(*) FROM messages WHERE 1=1{} GROUP BY {col}",
                filter.clauses,
                col = column
            );
            Ok(self.counts(&sql, &filter.values)?.into_iter().collect())
        };
        let by_priority = grouped("priority")?;
        let by_body_type = grouped("body_type")?;
        let by_status = grouped("status")?;

        let total: usize = by_status.values().sum();
        let delivered = by_status
            .get(MessageStatus::Delivered.as_str())
            .copied()
            .unwrap_or(0);
        let delivery_rate = if total > 0 {
            delivered as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(MessageStats {
            total_messages: total,
            by_priority,
            by_body_type,
            delivery_rate,
            avg_delivery_seconds: self.avg_delivery_seconds(range)?,
        })
    }

    fn avg_delivery_seconds(&self, range: Option<&TimeRange>) -> Result<f64> {
        let mut filter = Filter::default();
        filter.range("m.timestamp", range);
        let sql = format!(
            "SELECT AVG((julianday(d.first_success) - julianday(m.timestamp)) * 86400.0) \
             FROM messages m \
             JOIN (SELECT message_id, MIN(delivered_at) AS first_success FROM delivery_logs \
                   WHERE status = 'success' GROUP BY message_id) d \
             ON d.message_id = m.message_id WHERE 1=1{}",
            filter.clauses
        );
        let conn = self.store.conn()?;
        let avg: Option<f64> = conn
            .query_row(&sql, params_from_iter(filter.values.iter()), |row| row.get(0))
            .map_err(|e| Error::Storage(format!("sqlite average delivery time: {}", e)))?;
        Ok(avg.unwrap_or(0.0))
    }

    pub fn top_senders(&self, limit: usize, range: Option<&TimeRange>) -> Result<Vec<Ranked>> {
        self.top("sender", limit, range)
    }

    pub fn top_recipients(&self, limit: usize, range: Option<&TimeRange>) -> Result<Vec<Ranked>> {
        self.top("recipient", limit, range)
    }

    fn top(&self, column: &str, limit: usize, range: Option<&TimeRange>) -> Result<Vec<Ranked>> {
        let mut filter = Filter::default();
        filter.range("timestamp", range);
        let sql = format!(
            "SELECT {col}, COUNT(*) AS count FROM messages WHERE 1=1{} \
             GROUP BY {col} ORDER BY count DESC, {col} ASC LIMIT {}",
            filter.clauses,
            limit,
            col = column
        );
        Ok(self
            .counts(&sql, &filter.values)?
            .into_iter()
            .map(|(agent, count)| Ranked { agent, count })
            .collect())
    }

    /// Message counts per period, oldest period first.
    pub fn trends(
        &self,
        interval: TrendInterval,
        range: Option<&TimeRange>,
    ) -> Result<Vec<TrendPoint>> {
        let mut filter = Filter::default();
        filter.range("timestamp", range);
        let sql = format!(
            "SELECT strftime('{}', timestamp) AS period, COUNT(*) AS count FROM messages \
             WHERE 1=1{} GROUP BY period ORDER BY period ASC",
            interval.format(),
            filter.clauses
        );
        Ok(self
            .counts(&sql, &filter.values)?
            .into_iter()
            .map(|(period, count)| TrendPoint { period, count })
            .collect())
    }

    fn counts(&self, sql: &str, values: &[String]) -> Result<Vec<(String, usize)>> {
        let conn = self.store.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("sqlite prepare aggregate: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let key: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((key, count as usize))
            })
            .map_err(|e| Error::Storage(format!("sqlite query aggregate: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("sqlite read aggregate: {}", e)))
    }
}
