//! Agent-message envelopes: typed model, XML parsing and XML rendering.

use std::fmt::{Display, Write as _};
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use super::types::{
    AgentRef, Assignment, BodyType, MessageBody, Priority, RetryPolicy, Signature, TaskSpec,
};
use super::xml::{self, body_content, child, child_text, escape};
use crate::error::{Error, Result};

/// A parsed, typed agent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (lowercase UUID)
    pub message_id: String,
    /// Creation instant
    pub timestamp: DateTime<Utc>,
    pub sender: AgentRef,
    pub recipient: AgentRef,
    /// Conversation the message belongs to
    pub correlation_id: String,
    pub priority: Priority,
    /// Instant after which the message is no longer deliverable
    pub expiration: DateTime<Utc>,
    pub retry_policy: Option<RetryPolicy>,
    pub body: MessageBody,
    pub signature: Signature,
    /// Wire text the envelope was parsed from (or rendered to)
    #[serde(skip)]
    pub raw: String,
}

impl Envelope {
    /// Parse wire text into a typed envelope.
    ///
    /// This is strict: any missing or malformed field is an error. Run the schema
    /// validator first when a full defect list is wanted.
    pub fn parse(raw: &str) -> Result<Self> {
        let doc = Document::parse(raw)
            .map_err(|e| Error::Parse(format!("malformed envelope: {}", e)))?;
        let root = doc.root_element();
        if root.tag_name().name() != xml::ROOT {
            return Err(Error::Parse(format!(
                "root element must be <{}>, found <{}>",
                xml::ROOT,
                root.tag_name().name()
            )));
        }

        let header = required(root, "header", "/agent-message")?;
        let hpath = "/agent-message/header";

        let retry_policy = match child(header, "retry-policy") {
            Some(policy) => {
                let path = "/agent-message/header/retry-policy";
                Some(RetryPolicy {
                    max_attempts: required_parse(policy, "max-attempts", path)?,
                    backoff_strategy: required_parse(policy, "backoff-strategy", path)?,
                    timeout_seconds: required_parse(policy, "timeout-seconds", path)?,
                })
            }
            None => None,
        };

        let body_node = required(root, "body", "/agent-message")?;
        let body = parse_body(body_node)?;

        let sig = required(root, "signature", "/agent-message")?;
        let spath = "/agent-message/signature";
        let signature = Signature {
            algorithm: required_text(sig, "algorithm", spath)?.to_string(),
            signer: required_text(sig, "signer", spath)?.to_string(),
            timestamp: required_instant(sig, "timestamp", spath)?,
            public_key_id: required_text(sig, "public-key-id", spath)?.to_string(),
            signature_value: required_text(sig, "signature-value", spath)?.to_string(),
        };

        Ok(Self {
            message_id: required_text(header, "message-id", hpath)?.to_string(),
            timestamp: required_instant(header, "timestamp", hpath)?,
            sender: parse_agent_ref(required(header, "sender", hpath)?, "/agent-message/header/sender")?,
            recipient: parse_agent_ref(
                required(header, "recipient", hpath)?,
                "/agent-message/header/recipient",
            )?,
            correlation_id: required_text(header, "correlation-id", hpath)?.to_string(),
            priority: required_parse(header, "priority", hpath)?,
            expiration: required_instant(header, "expiration", hpath)?,
            retry_policy,
            body,
            signature,
            raw: raw.to_string(),
        })
    }

    /// Whether the envelope is expired at `now` (expiration at or before `now`).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Check if envelope has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time between creation and expiration.
    pub fn expiration_window(&self) -> Duration {
        self.expiration - self.timestamp
    }

    pub fn body_type(&self) -> BodyType {
        self.body.body_type()
    }

    /// Render the envelope in wire format.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            out,
            "<{} version=\"{}\" xmlns=\"{}\">",
            xml::ROOT,
            xml::VERSION,
            xml::NAMESPACE
        );

        out.push_str("  <header>\n");
        leaf(&mut out, 2, "message-id", &self.message_id);
        leaf(&mut out, 2, "timestamp", &format_instant(self.timestamp));
        agent_ref(&mut out, "sender", &self.sender);
        agent_ref(&mut out, "recipient", &self.recipient);
        leaf(&mut out, 2, "correlation-id", &self.correlation_id);
        leaf(&mut out, 2, "priority", self.priority.as_str());
        leaf(&mut out, 2, "expiration", &format_instant(self.expiration));
        if let Some(policy) = &self.retry_policy {
            out.push_str("    <retry-policy>\n");
            leaf(&mut out, 3, "max-attempts", &policy.max_attempts.to_string());
            leaf(&mut out, 3, "backoff-strategy", policy.backoff_strategy.as_str());
            leaf(&mut out, 3, "timeout-seconds", &policy.timeout_seconds.to_string());
            out.push_str("    </retry-policy>\n");
        }
        out.push_str("  </header>\n");

        let _ = writeln!(out, "  <body type=\"{}\">", self.body_type());
        render_body(&mut out, &self.body);
        out.push_str("  </body>\n");

        out.push_str("  <signature>\n");
        leaf(&mut out, 2, "algorithm", &self.signature.algorithm);
        leaf(&mut out, 2, "signer", &self.signature.signer);
        leaf(&mut out, 2, "timestamp", &format_instant(self.signature.timestamp));
        leaf(&mut out, 2, "public-key-id", &self.signature.public_key_id);
        leaf(&mut out, 2, "signature-value", &self.signature.signature_value);
        out.push_str("  </signature>\n");

        let _ = writeln!(out, "</{}>", xml::ROOT);
        out
    }
}

/// Parse an ISO-8601 instant with a zone designator.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    if !value.contains('T') {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `now` moved back by `hours`, clamped at the earliest representable instant.
pub fn hours_before(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Canonical text form of an instant (millisecond precision, `Z` suffix).
///
/// Lexicographic order of this form matches chronological order, which the
/// stores rely on for range queries.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn required<'a, 'input>(node: Node<'a, 'input>, name: &str, path: &str) -> Result<Node<'a, 'input>> {
    xml::present_child(node, name)
        .ok_or_else(|| Error::Parse(format!("missing element {}/{}", path, name)))
}

fn required_text<'a>(node: Node<'a, '_>, name: &str, path: &str) -> Result<&'a str> {
    child_text(node, name).ok_or_else(|| Error::Parse(format!("missing element {}/{}", path, name)))
}

fn required_parse<T>(node: Node<'_, '_>, name: &str, path: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = required_text(node, name, path)?;
    value
        .parse()
        .map_err(|e| Error::Parse(format!("invalid {}/{} '{}': {}", path, name, value, e)))
}

fn required_instant(node: Node<'_, '_>, name: &str, path: &str) -> Result<DateTime<Utc>> {
    let value = required_text(node, name, path)?;
    parse_instant(value)
        .ok_or_else(|| Error::Parse(format!("invalid instant at {}/{}: {}", path, name, value)))
}

fn parse_agent_ref(node: Node<'_, '_>, path: &str) -> Result<AgentRef> {
    Ok(AgentRef {
        agent_name: required_text(node, "agent-name", path)?.to_string(),
        agent_role: required_parse(node, "agent-role", path)?,
        tier: required_parse(node, "tier", path)?,
    })
}

fn parse_body(body: Node<'_, '_>) -> Result<MessageBody> {
    let path = "/agent-message/body";
    let type_attr = body
        .attribute("type")
        .ok_or_else(|| Error::Parse("missing attribute /agent-message/body/@type".to_string()))?;
    let body_type: BodyType = type_attr.parse().map_err(|e| Error::Parse(format!("{}", e)))?;
    let content = body_content(body, type_attr);

    let parsed = match body_type {
        BodyType::TaskDelegation => {
            let task = required(content, "task", path)?;
            let tpath = "/agent-message/body/task";
            let assignment = required(content, "assignment", path)?;
            let apath = "/agent-message/body/assignment";
            MessageBody::TaskDelegation {
                task: TaskSpec {
                    task_id: required_text(task, "task-id", tpath)?.to_string(),
                    task_type: required_text(task, "task-type", tpath)?.to_string(),
                    title: required_text(task, "title", tpath)?.to_string(),
                    description: required_text(task, "description", tpath)?.to_string(),
                },
                assignment: Assignment {
                    assigned_to: required_text(assignment, "assigned-to", apath)?.to_string(),
                    assigned_by: required_text(assignment, "assigned-by", apath)?.to_string(),
                    assigned_timestamp: required_instant(assignment, "assigned-timestamp", apath)?,
                },
            }
        }
        BodyType::StatusUpdate => {
            let progress: u8 = required_parse(content, "progress-percentage", path)?;
            if progress > 100 {
                return Err(Error::Parse(format!(
                    "progress-percentage out of range: {}",
                    progress
                )));
            }
            MessageBody::StatusUpdate {
                task_id: required_text(content, "task-id", path)?.to_string(),
                status: required_parse(content, "status", path)?,
                progress_percentage: progress,
                current_activity: required_text(content, "current-activity", path)?.to_string(),
            }
        }
        BodyType::TaskCompletion => MessageBody::TaskCompletion {
            task_id: required_text(content, "task-id", path)?.to_string(),
            status: required_parse(content, "status", path)?,
            summary: required_text(content, "summary", path)?.to_string(),
            completion_timestamp: required_instant(content, "completion-timestamp", path)?,
        },
        BodyType::Error => MessageBody::Error {
            error_id: required_text(content, "error-id", path)?.to_string(),
            error_type: required_parse(content, "error-type", path)?,
            severity: required_parse(content, "severity", path)?,
            message: required_text(content, "message", path)?.to_string(),
        },
        BodyType::Query => MessageBody::Query {
            query_type: required_parse(content, "query-type", path)?,
            subject: required_text(content, "subject", path)?.to_string(),
            urgency: required_parse(content, "urgency", path)?,
        },
    };
    Ok(parsed)
}

fn leaf(out: &mut String, depth: usize, name: &str, value: &str) {
    let _ = writeln!(
        out,
        "{}<{}>{}</{}>",
        "  ".repeat(depth),
        name,
        escape(value),
        name
    );
}

fn agent_ref(out: &mut String, name: &str, agent: &AgentRef) {
    let _ = writeln!(out, "    <{}>", name);
    leaf(out, 3, "agent-name", &agent.agent_name);
    leaf(out, 3, "agent-role", agent.agent_role.as_str());
    leaf(out, 3, "tier", agent.tier.as_str());
    let _ = writeln!(out, "    </{}>", name);
}

fn render_body(out: &mut String, body: &MessageBody) {
    match body {
        MessageBody::TaskDelegation { task, assignment } => {
            out.push_str("    <task>\n");
            leaf(out, 3, "task-id", &task.task_id);
            leaf(out, 3, "task-type", &task.task_type);
            leaf(out, 3, "title", &task.title);
            leaf(out, 3, "description", &task.description);
            out.push_str("    </task>\n");
            out.push_str("    <assignment>\n");
            leaf(out, 3, "assigned-to", &assignment.assigned_to);
            leaf(out, 3, "assigned-by", &assignment.assigned_by);
            leaf(out, 3, "assigned-timestamp", &format_instant(assignment.assigned_timestamp));
            out.push_str("    </assignment>\n");
        }
        MessageBody::StatusUpdate {
            task_id,
            status,
            progress_percentage,
            current_activity,
        } => {
            leaf(out, 2, "task-id", task_id);
            leaf(out, 2, "status", status.as_str());
            leaf(out, 2, "progress-percentage", &progress_percentage.to_string());
            leaf(out, 2, "current-activity", current_activity);
        }
        MessageBody::TaskCompletion {
            task_id,
            status,
            summary,
            completion_timestamp,
        } => {
            leaf(out, 2, "task-id", task_id);
            leaf(out, 2, "status", status.as_str());
            leaf(out, 2, "summary", summary);
            leaf(out, 2, "completion-timestamp", &format_instant(*completion_timestamp));
        }
        MessageBody::Error {
            error_id,
            error_type,
            severity,
            message,
        } => {
            leaf(out, 2, "error-id", error_id);
            leaf(out, 2, "error-type", error_type.as_str());
            leaf(out, 2, "severity", severity.as_str());
            leaf(out, 2, "message", message);
        }
        MessageBody::Query {
            query_type,
            subject,
            urgency,
        } => {
            leaf(out, 2, "query-type", query_type.as_str());
            leaf(out, 2, "subject", subject);
            leaf(out, 2, "urgency", urgency.as_str());
        }
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    sender: AgentRef,
    recipient: Option<AgentRef>,
    message_id: Option<String>,
    correlation_id: Option<String>,
    priority: Priority,
    timestamp: Option<DateTime<Utc>>,
    expiration: Option<DateTime<Utc>>,
    ttl: Duration,
    retry_policy: Option<RetryPolicy>,
    body: Option<MessageBody>,
    signature: Option<Signature>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(sender: AgentRef) -> Self {
        Self {
            sender,
            recipient: None,
            message_id: None,
            correlation_id: None,
            priority: Priority::Normal,
            timestamp: None,
            expiration: None,
            ttl: Duration::hours(1),
            retry_policy: None,
            body: None,
            signature: None,
        }
    }

    /// Address to a single agent.
    pub fn to(mut self, recipient: AgentRef) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set correlation ID.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the creation instant (defaults to now).
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set an absolute expiration, overriding the TTL.
    pub fn expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set TTL relative to the timestamp.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the message body.
    pub fn body(mut self, body: MessageBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Build the envelope and render its wire text.
    pub fn build(self) -> Result<Envelope> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::Other("Recipient is required".to_string()))?;
        let body = self
            .body
            .ok_or_else(|| Error::Other("Body is required".to_string()))?;

        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let expiration = match self.expiration {
            Some(expiration) => expiration,
            None => timestamp
                .checked_add_signed(self.ttl)
                .ok_or_else(|| Error::Other("Expiration is out of range".to_string()))?,
        };
        let signature = self.signature.unwrap_or_else(|| Signature {
            algorithm: "RSA-SHA256".to_string(),
            signer: self.sender.agent_name.clone(),
            timestamp,
            public_key_id: format!("{}-key", self.sender.agent_name),
            signature_value: "unsigned".to_string(),
        });

        let mut envelope = Envelope {
            message_id: self.message_id.unwrap_or_else(generate_id),
            timestamp,
            sender: self.sender,
            recipient,
            correlation_id: self.correlation_id.unwrap_or_else(generate_id),
            priority: self.priority,
            expiration,
            retry_policy: self.retry_policy,
            body,
            signature,
            raw: String::new(),
        };
        envelope.raw = envelope.to_xml();
        Ok(envelope)
    }
}

/// New lowercase v4 UUID.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{
        AgentRole, BackoffStrategy, CompletionStatus, ErrorKind, ErrorSeverity, QueryKind, Tier,
    };

    fn sender() -> AgentRef {
        AgentRef::new("backend-specialist", AgentRole::Specialist, Tier::Sonnet)
    }

    fn recipient() -> AgentRef {
        AgentRef::new("engineering-coordinator", AgentRole::Coordinator, Tier::Opus)
    }

    #[test]
    fn test_builder_renders_parseable_envelope() {
        let envelope = EnvelopeBuilder::from(sender())
            .to(recipient())
            .priority(Priority::High)
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                backoff_strategy: BackoffStrategy::Linear,
                timeout_seconds: 30,
            })
            .body(MessageBody::query(QueryKind::AskForHelp, "flaky test <ci>", Priority::High))
            .build()
            .unwrap();

        let parsed = Envelope::parse(&envelope.raw).unwrap();
        assert_eq!(parsed.message_id, envelope.message_id);
        assert_eq!(parsed.sender, envelope.sender);
        assert_eq!(parsed.retry_policy, envelope.retry_policy);
        assert_eq!(parsed.body, envelope.body);
        assert_eq!(parsed.expiration_window(), Duration::hours(1));
    }

    #[test]
    fn test_parse_wrapped_body_layout() {
        let envelope = EnvelopeBuilder::from(sender())
            .to(recipient())
            .body(MessageBody::Error {
                error_id: "err-1".to_string(),
                error_type: ErrorKind::Timeout,
                severity: ErrorSeverity::Warning,
                message: "upstream slow".to_string(),
            })
            .build()
            .unwrap();
        let wrapped = envelope
            .raw
            .replace("<body type=\"error\">", "<body type=\"error\"><error>")
            .replace("  </body>", "</error></body>");

        let parsed = Envelope::parse(&wrapped).unwrap();
        assert_eq!(parsed.body, envelope.body);
    }

    #[test]
    fn test_task_completion_roundtrip_keeps_instants() {
        let done = Utc::now();
        let envelope = EnvelopeBuilder::from(sender())
            .to(recipient())
            .body(MessageBody::TaskCompletion {
                task_id: "t-9".to_string(),
                status: CompletionStatus::PartialSuccess,
                summary: "2 of 3 endpoints migrated".to_string(),
                completion_timestamp: done,
            })
            .build()
            .unwrap();
        let parsed = Envelope::parse(&envelope.raw).unwrap();
        match parsed.body {
            MessageBody::TaskCompletion { completion_timestamp, .. } => {
                assert_eq!(format_instant(completion_timestamp), format_instant(done));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_header_field() {
        let envelope = EnvelopeBuilder::from(sender())
            .to(recipient())
            .body(MessageBody::query(QueryKind::GetStatus, "deploy", Priority::Normal))
            .build()
            .unwrap();
        let broken = envelope.raw.replace("<priority>normal</priority>", "");
        let err = Envelope::parse(&broken).unwrap_err();
        assert!(err.to_string().contains("priority"));
    }

    #[test]
    fn test_expiration() {
        let now = Utc::now();
        let envelope = EnvelopeBuilder::from(sender())
            .to(recipient())
            .timestamp(now - Duration::hours(2))
            .ttl(Duration::hours(1))
            .body(MessageBody::query(QueryKind::GetStatus, "late", Priority::Low))
            .build()
            .unwrap();
        assert!(envelope.is_expired());
        assert!(envelope.is_expired_at(envelope.expiration));
        assert!(!envelope.is_expired_at(envelope.expiration - Duration::milliseconds(1)));
    }

    #[test]
    fn test_out_of_range_instants() {
        let now = Utc::now();
        assert_eq!(hours_before(now, 24), now - Duration::hours(24));
        assert_eq!(hours_before(now, u64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(hours_before(now, u64::from(u32::MAX)), DateTime::<Utc>::MIN_UTC);

        let err = EnvelopeBuilder::from(sender())
            .to(recipient())
            .ttl(Duration::days(365 * 300_000))
            .body(MessageBody::query(QueryKind::GetStatus, "forever", Priority::Low))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_parse_instant_requires_zone() {
        assert!(parse_instant("2025-11-06T14:30:00Z").is_some());
        assert!(parse_instant("2025-11-06T14:30:00+02:00").is_some());
        assert!(parse_instant("2025-11-06T14:30:00").is_none());
        assert!(parse_instant("2025-11-06").is_none());
    }
}
