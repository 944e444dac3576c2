//! Typed vocabulary of the agent-message protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a closed set of wire values with `as_str`, `Display` and `FromStr`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire spellings, in declaration order.
            pub const WIRE: &'static [&'static str] = &[$($wire),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $wire ),+
                }
            }

            /// Comma-separated list of accepted wire values.
            pub fn expected() -> String {
                Self::WIRE.join(", ")
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok($name::$variant), )+
                    _ => Err(format!("Unknown {} value: {}", stringify!($name), s)),
                }
            }
        }
    };
}

pub(crate) use wire_enum;

wire_enum! {
    /// Message priority levels, listed in dispatch order.
    Priority {
        Critical => "critical",
        High => "high",
        Normal => "normal",
        Low => "low",
    }
}

impl Priority {
    /// Position in dispatch order (0 = dispatched first).
    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Critical and high messages are expected to be short-lived.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

wire_enum! {
    /// Position of an agent in the orchestration hierarchy.
    AgentRole {
        Coordinator => "coordinator",
        Specialist => "specialist",
        Orchestrator => "orchestrator",
    }
}

wire_enum! {
    /// Capability class of an agent.
    Tier {
        Opus => "opus",
        Sonnet => "sonnet",
        Haiku => "haiku",
    }
}

wire_enum! {
    /// Function mapping a retry attempt number to a delay.
    BackoffStrategy {
        Exponential => "exponential",
        Linear => "linear",
        Fixed => "fixed",
    }
}

wire_enum! {
    /// Discriminant of the envelope body.
    BodyType {
        TaskDelegation => "task-delegation",
        StatusUpdate => "status-update",
        TaskCompletion => "task-completion",
        Error => "error",
        Query => "query",
    }
}

wire_enum! {
    TaskStatus {
        InProgress => "in-progress",
        Blocked => "blocked",
        Completed => "completed",
        Failed => "failed",
        Pending => "pending",
    }
}

wire_enum! {
    CompletionStatus {
        Success => "success",
        PartialSuccess => "partial-success",
        Failed => "failed",
    }
}

wire_enum! {
    ErrorKind {
        TaskFailed => "task-failed",
        Timeout => "timeout",
        Blocked => "blocked",
        ValidationError => "validation-error",
        SystemError => "system-error",
    }
}

wire_enum! {
    ErrorSeverity {
        Critical => "critical",
        Warning => "warning",
        Info => "info",
    }
}

wire_enum! {
    QueryKind {
        AskForHelp => "ask-for-help",
        RequestReview => "request-review",
        RequestAnalysis => "request-analysis",
        GetStatus => "get-status",
        RequestGuidance => "request-guidance",
    }
}

/// Sender or recipient of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub agent_name: String,
    pub agent_role: AgentRole,
    pub tier: Tier,
}

impl AgentRef {
    pub fn new(name: impl Into<String>, role: AgentRole, tier: Tier) -> Self {
        Self {
            agent_name: name.into(),
            agent_role: role,
            tier,
        }
    }
}

/// Delivery retry policy carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub task_type: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub assigned_to: String,
    pub assigned_by: String,
    pub assigned_timestamp: DateTime<Utc>,
}

/// Tagged envelope body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    TaskDelegation {
        task: TaskSpec,
        assignment: Assignment,
    },
    StatusUpdate {
        task_id: String,
        status: TaskStatus,
        progress_percentage: u8,
        current_activity: String,
    },
    TaskCompletion {
        task_id: String,
        status: CompletionStatus,
        summary: String,
        completion_timestamp: DateTime<Utc>,
    },
    Error {
        error_id: String,
        error_type: ErrorKind,
        severity: ErrorSeverity,
        message: String,
    },
    Query {
        query_type: QueryKind,
        subject: String,
        urgency: Priority,
    },
}

impl MessageBody {
    pub fn body_type(&self) -> BodyType {
        match self {
            MessageBody::TaskDelegation { .. } => BodyType::TaskDelegation,
            MessageBody::StatusUpdate { .. } => BodyType::StatusUpdate,
            MessageBody::TaskCompletion { .. } => BodyType::TaskCompletion,
            MessageBody::Error { .. } => BodyType::Error,
            MessageBody::Query { .. } => BodyType::Query,
        }
    }

    /// Create a query body.
    pub fn query(query_type: QueryKind, subject: impl Into<String>, urgency: Priority) -> Self {
        MessageBody::Query {
            query_type,
            subject: subject.into(),
            urgency,
        }
    }

    /// Create a status-update body.
    pub fn status_update(
        task_id: impl Into<String>,
        status: TaskStatus,
        progress_percentage: u8,
        current_activity: impl Into<String>,
    ) -> Self {
        MessageBody::StatusUpdate {
            task_id: task_id.into(),
            status,
            progress_percentage,
            current_activity: current_activity.into(),
        }
    }
}

/// Signature block of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: String,
    pub signer: String,
    pub timestamp: DateTime<Utc>,
    pub public_key_id: String,
    pub signature_value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_dispatch_order() {
        let order: Vec<usize> = Priority::ALL.iter().map(|p| p.index()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(Priority::Critical.is_urgent());
        assert!(Priority::High.is_urgent());
        assert!(!Priority::Normal.is_urgent());
    }

    #[test]
    fn test_wire_values() {
        assert_eq!("partial-success".parse::<CompletionStatus>(), Ok(CompletionStatus::PartialSuccess));
        assert_eq!(TaskStatus::InProgress.to_string(), "in-progress");
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Tier::expected(), "opus, sonnet, haiku");
    }

    #[test]
    fn test_body_type() {
        let body = MessageBody::query(QueryKind::GetStatus, "build", Priority::Low);
        assert_eq!(body.body_type(), BodyType::Query);
        assert_eq!(body.body_type().as_str(), "query");
    }
}
