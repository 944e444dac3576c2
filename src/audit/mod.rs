//! Audit - durable message history, search, replay and the compliance log.
//!
//! The message store and the audit log live in separate SQLite databases.
//! [`MessageSearch`] and [`MessageReplay`] borrow a [`MessageStore`].

pub mod logger;
pub mod replay;
pub mod search;
pub mod store;
pub mod types;

pub use logger::{AuditLogger, AuditQuery};
pub use replay::{MessageReplay, ReplayOptions, ReplayResult, ReplayStats};
pub use search::{MessageSearch, MessageStats, Ranked, SearchCriteria, TrendInterval, TrendPoint};
pub use store::MessageStore;
pub use types::{
    AuditEvent, AuditEventType, AuditStats, ComplianceReport, DeliveryLog, DeliveryStatus,
    IntegrityReport, MessageStatus, StoredMessage, TimeRange,
};
