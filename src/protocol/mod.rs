//! Agent-message protocol.
//!
//! This module defines the wire-level envelope exchanged between agents:
//! - Typed header, body and signature model
//! - Strict XML parsing into [`Envelope`]
//! - XML rendering through [`EnvelopeBuilder`]

pub mod envelope;
pub mod types;
pub mod xml;

pub use envelope::{
    format_instant, generate_id, hours_before, parse_instant, Envelope, EnvelopeBuilder,
};
pub use types::{
    AgentRef, AgentRole, Assignment, BackoffStrategy, BodyType, CompletionStatus, ErrorKind,
    ErrorSeverity, MessageBody, Priority, QueryKind, RetryPolicy, Signature, TaskSpec, TaskStatus,
    Tier,
};
