//! Persisted records of the message store and audit log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::hours_before;
use crate::protocol::types::wire_enum;

wire_enum! {
    /// Lifecycle state of a stored message.
    MessageStatus {
        Pending => "pending",
        Delivered => "delivered",
        Failed => "failed",
        Expired => "expired",
    }
}

wire_enum! {
    /// Outcome of one delivery attempt.
    DeliveryStatus {
        Success => "success",
        Retry => "retry",
        Failed => "failed",
    }
}

wire_enum! {
    /// Lifecycle milestones recorded in the audit log.
    AuditEventType {
        MessageReceived => "message-received",
        ValidationPassed => "validation-passed",
        ValidationFailed => "validation-failed",
        MessageQueued => "message-queued",
        DeliveryAttempted => "delivery-attempted",
        DeliverySuccess => "delivery-success",
        DeliveryFailed => "delivery-failed",
        MessageExpired => "message-expired",
        MessageReplayed => "message-replayed",
    }
}

/// A message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub correlation_id: String,
    pub sender: String,
    pub recipient: String,
    pub body_type: String,
    pub priority: String,
    pub timestamp: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    /// Envelope wire text
    #[serde(skip)]
    pub raw_xml: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// One delivery attempt. Attempt 0 marks a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryLog {
    pub id: i64,
    pub message_id: String,
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Inclusive instant range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` leading up to now.
    pub fn last_hours(hours: u32) -> Self {
        let end = Utc::now();
        Self::new(hours_before(end, u64::from(hours)), end)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// An append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub message_id: String,
    pub actor_agent: String,
    pub details: serde_json::Value,
    /// Hex SHA-256 over every other field
    pub immutable_hash: String,
}

/// Aggregates over a window of audit events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub range: TimeRange,
    pub total_events: usize,
    pub by_event_type: BTreeMap<String, usize>,
    pub validation_failures: usize,
    /// Percentage (0-100) of attempted messages that were delivered
    pub delivery_success_rate: f64,
    /// Seconds from first attempt to success, averaged over delivered messages
    pub average_delivery_seconds: f64,
    pub expired_messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub total: usize,
    pub verified: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total_events: usize,
    pub by_event_type: BTreeMap<String, usize>,
    pub unique_messages: usize,
    pub unique_actors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_wire_values() {
        assert_eq!("expired".parse::<MessageStatus>(), Ok(MessageStatus::Expired));
        assert_eq!(DeliveryStatus::Retry.as_str(), "retry");
        assert_eq!(AuditEventType::ALL.len(), 9);
        assert_eq!(
            "message-replayed".parse::<AuditEventType>(),
            Ok(AuditEventType::MessageReplayed)
        );
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let range = TimeRange::last_hours(1);
        assert!(range.contains(range.start));
        assert!(range.contains(range.end));
        assert!(!range.contains(range.end + Duration::milliseconds(1)));

        let everything = TimeRange::last_hours(u32::MAX);
        assert_eq!(everything.start, DateTime::<Utc>::MIN_UTC);
    }
}
