//! Structural validation of raw envelope text.
//!
//! Checks run in a fixed order: XML syntax (fatal), root element and version,
//! required top-level sections, header fields, body content, signature. Every
//! structural defect is collected; only a syntax failure stops early.

use std::sync::OnceLock;

use regex::Regex;
use roxmltree::{Document, Node};

use super::types::{ValidationIssue, ValidationResult};
use crate::protocol::envelope::parse_instant;
use crate::protocol::types::{
    AgentRole, BackoffStrategy, BodyType, CompletionStatus, ErrorKind, ErrorSeverity, Priority,
    QueryKind, TaskStatus, Tier,
};
use crate::protocol::xml::{self, body_content, child, elements, present_child, text};

/// Canonical lowercase 8-4-4-4-12 UUID.
const UUID_PATTERN: &str = r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";

static UUID_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

fn uuid_regex() -> Option<&'static Regex> {
    UUID_REGEX.get_or_init(|| Regex::new(UUID_PATTERN).ok()).as_ref()
}

pub fn is_valid_uuid(value: &str) -> bool {
    uuid_regex().is_some_and(|re| re.is_match(value))
}

/// Expected shape of a leaf value.
#[derive(Clone, Copy)]
enum Field {
    Text,
    Instant,
    OneOf(&'static [&'static str]),
    Percentage,
}

/// Required children of a body, optionally nested under a grouping element.
struct Group {
    element: Option<&'static str>,
    fields: &'static [(&'static str, Field)],
}

const TASK_DELEGATION: &[Group] = &[
    Group {
        element: Some("task"),
        fields: &[
            ("task-id", Field::Text),
            ("task-type", Field::Text),
            ("title", Field::Text),
            ("description", Field::Text),
        ],
    },
    Group {
        element: Some("assignment"),
        fields: &[
            ("assigned-to", Field::Text),
            ("assigned-by", Field::Text),
            ("assigned-timestamp", Field::Instant),
        ],
    },
];

const STATUS_UPDATE: &[Group] = &[Group {
    element: None,
    fields: &[
        ("task-id", Field::Text),
        ("status", Field::OneOf(TaskStatus::WIRE)),
        ("progress-percentage", Field::Percentage),
        ("current-activity", Field::Text),
    ],
}];

const TASK_COMPLETION: &[Group] = &[Group {
    element: None,
    fields: &[
        ("task-id", Field::Text),
        ("status", Field::OneOf(CompletionStatus::WIRE)),
        ("summary", Field::Text),
        ("completion-timestamp", Field::Instant),
    ],
}];

const ERROR: &[Group] = &[Group {
    element: None,
    fields: &[
        ("error-id", Field::Text),
        ("error-type", Field::OneOf(ErrorKind::WIRE)),
        ("severity", Field::OneOf(ErrorSeverity::WIRE)),
        ("message", Field::Text),
    ],
}];

const QUERY: &[Group] = &[Group {
    element: None,
    fields: &[
        ("query-type", Field::OneOf(QueryKind::WIRE)),
        ("subject", Field::Text),
        ("urgency", Field::OneOf(Priority::WIRE)),
    ],
}];

fn body_groups(body_type: BodyType) -> &'static [Group] {
    match body_type {
        BodyType::TaskDelegation => TASK_DELEGATION,
        BodyType::StatusUpdate => STATUS_UPDATE,
        BodyType::TaskCompletion => TASK_COMPLETION,
        BodyType::Error => ERROR,
        BodyType::Query => QUERY,
    }
}

/// Stateless structural validator; safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate raw envelope text.
    pub fn validate(&self, raw: &str) -> ValidationResult {
        let doc = match Document::parse(raw) {
            Ok(doc) => doc,
            Err(e) => {
                let pos = e.pos();
                return ValidationResult::failure(
                    ValidationIssue::error(format!("XML syntax error: {}", e))
                        .located((pos.row, pos.col)),
                );
            }
        };

        let mut checker = Checker::default();
        let root = doc.root_element();
        if checker.root(root) {
            checker.structure(root);
        }
        ValidationResult::new(checker.errors, checker.warnings)
    }
}

#[derive(Default)]
struct Checker {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Checker {
    fn error(&mut self, message: String, path: &str, node: Node<'_, '_>) {
        self.errors
            .push(ValidationIssue::error(message).at(path).located(xml::position(node)));
    }

    fn missing(&mut self, field: &str, parent_path: &str, parent: Node<'_, '_>) {
        self.error(format!("Missing required element: {}", field), parent_path, parent);
    }

    /// Returns false when the root is not an envelope at all.
    fn root(&mut self, root: Node<'_, '_>) -> bool {
        if root.tag_name().name() != xml::ROOT {
            self.error(format!("Root element must be <{}>", xml::ROOT), "/", root);
            return false;
        }

        let path = "/agent-message";
        match root.tag_name().namespace() {
            Some(xml::NAMESPACE) => {}
            other => self.warnings.push(
                ValidationIssue::warning(format!(
                    "Unexpected namespace: expected \"{}\", got \"{}\"",
                    xml::NAMESPACE,
                    other.unwrap_or("")
                ))
                .at(path)
                .located(xml::position(root)),
            ),
        }

        match root.attribute("version") {
            None => self.error("Missing required attribute: version".to_string(), path, root),
            Some(xml::VERSION) => {}
            Some(other) => self.error(
                format!("Invalid version: expected \"{}\", got \"{}\"", xml::VERSION, other),
                "/agent-message/@version",
                root,
            ),
        }
        true
    }

    fn structure(&mut self, root: Node<'_, '_>) {
        let path = "/agent-message";

        match child(root, "header") {
            Some(header) => self.header(header),
            None => self.missing("header", path, root),
        }
        match child(root, "body") {
            Some(body) => self.body(body),
            None => self.missing("body", path, root),
        }
        match child(root, "signature") {
            Some(signature) => self.signature(signature),
            None => self.missing("signature", path, root),
        }
    }

    fn header(&mut self, header: Node<'_, '_>) {
        let path = "/agent-message/header";

        for field in [
            "message-id",
            "timestamp",
            "sender",
            "recipient",
            "correlation-id",
            "priority",
            "expiration",
        ] {
            if present_child(header, field).is_none() {
                self.missing(field, path, header);
            }
        }

        for field in ["message-id", "correlation-id"] {
            if let Some((node, value)) = leaf(header, field) {
                if !is_valid_uuid(value) {
                    self.error(
                        format!("Invalid UUID format for {}: {}", field, value),
                        &format!("{}/{}", path, field),
                        node,
                    );
                }
            }
        }

        for field in ["timestamp", "expiration"] {
            self.instant(header, field, path);
        }

        if let Some((node, value)) = leaf(header, "priority") {
            if value.parse::<Priority>().is_err() {
                self.error(
                    format!(
                        "Invalid priority value: {}. Must be one of: {}",
                        value,
                        Priority::expected()
                    ),
                    &format!("{}/priority", path),
                    node,
                );
            }
        }

        for side in ["sender", "recipient"] {
            if let Some(agent) = present_child(header, side) {
                self.agent_ref(agent, &format!("{}/{}", path, side));
            }
        }

        if let Some(policy) = child(header, "retry-policy") {
            self.retry_policy(policy, &format!("{}/retry-policy", path));
        }
    }

    fn agent_ref(&mut self, agent: Node<'_, '_>, path: &str) {
        for field in ["agent-name", "agent-role", "tier"] {
            if present_child(agent, field).is_none() {
                self.missing(field, path, agent);
            }
        }

        if let Some((node, value)) = leaf(agent, "agent-role") {
            if value.parse::<AgentRole>().is_err() {
                self.error(
                    format!(
                        "Invalid agent-role: {}. Must be one of: {}",
                        value,
                        AgentRole::expected()
                    ),
                    &format!("{}/agent-role", path),
                    node,
                );
            }
        }

        if let Some((node, value)) = leaf(agent, "tier") {
            if value.parse::<Tier>().is_err() {
                self.error(
                    format!("Invalid tier: {}. Must be one of: {}", value, Tier::expected()),
                    &format!("{}/tier", path),
                    node,
                );
            }
        }
    }

    fn retry_policy(&mut self, policy: Node<'_, '_>, path: &str) {
        for field in ["max-attempts", "backoff-strategy", "timeout-seconds"] {
            if present_child(policy, field).is_none() {
                self.missing(field, path, policy);
            }
        }

        if let Some((node, value)) = leaf(policy, "backoff-strategy") {
            if value.parse::<BackoffStrategy>().is_err() {
                self.error(
                    format!(
                        "Invalid backoff-strategy: {}. Must be one of: {}",
                        value,
                        BackoffStrategy::expected()
                    ),
                    &format!("{}/backoff-strategy", path),
                    node,
                );
            }
        }

        if let Some((node, value)) = leaf(policy, "max-attempts") {
            if !matches!(value.parse::<u32>(), Ok(n) if n > 0) {
                self.error(
                    format!("max-attempts must be a positive integer, got: {}", value),
                    &format!("{}/max-attempts", path),
                    node,
                );
            }
        }

        if let Some((node, value)) = leaf(policy, "timeout-seconds") {
            if !matches!(value.parse::<u64>(), Ok(n) if n > 0) {
                self.error(
                    format!("timeout-seconds must be a positive integer, got: {}", value),
                    &format!("{}/timeout-seconds", path),
                    node,
                );
            }
        }
    }

    fn body(&mut self, body: Node<'_, '_>) {
        let path = "/agent-message/body";

        let Some(type_attr) = body.attribute("type") else {
            self.error("Missing required attribute: type".to_string(), path, body);
            return;
        };

        let Ok(body_type) = type_attr.parse::<BodyType>() else {
            self.error(
                format!(
                    "Invalid body type: {}. Must be one of: {}",
                    type_attr,
                    BodyType::expected()
                ),
                "/agent-message/body/@type",
                body,
            );
            return;
        };

        let content = body_content(body, type_attr);
        if elements(content).next().is_none() {
            self.error(
                format!("Body with type=\"{}\" must contain content elements", type_attr),
                path,
                body,
            );
            return;
        }

        for group in body_groups(body_type) {
            let (node, group_path) = match group.element {
                Some(name) => match present_child(content, name) {
                    Some(node) => (node, format!("{}/{}", path, name)),
                    None => {
                        self.missing(name, path, content);
                        continue;
                    }
                },
                None => (content, path.to_string()),
            };

            for (name, kind) in group.fields {
                match leaf(node, name) {
                    Some((leaf_node, value)) => {
                        self.field(leaf_node, name, value, *kind, &format!("{}/{}", group_path, name))
                    }
                    None => self.missing(name, &group_path, node),
                }
            }
        }
    }

    fn field(&mut self, node: Node<'_, '_>, name: &str, value: &str, kind: Field, path: &str) {
        match kind {
            Field::Text => {}
            Field::Instant => {
                if parse_instant(value).is_none() {
                    self.error(
                        format!("Invalid ISO 8601 datetime format for {}: {}", name, value),
                        path,
                        node,
                    );
                }
            }
            Field::OneOf(allowed) => {
                if !allowed.iter().any(|a| *a == value) {
                    self.error(
                        format!(
                            "Invalid {}: {}. Must be one of: {}",
                            name,
                            value,
                            allowed.join(", ")
                        ),
                        path,
                        node,
                    );
                }
            }
            Field::Percentage => {
                if !matches!(value.parse::<u8>(), Ok(n) if n <= 100) {
                    self.error(
                        format!("{} must be an integer between 0 and 100, got: {}", name, value),
                        path,
                        node,
                    );
                }
            }
        }
    }

    fn signature(&mut self, signature: Node<'_, '_>) {
        let path = "/agent-message/signature";

        for field in ["algorithm", "signer", "timestamp", "public-key-id", "signature-value"] {
            if present_child(signature, field).is_none() {
                self.missing(field, path, signature);
            }
        }

        self.instant(signature, "timestamp", path);
    }

    fn instant(&mut self, parent: Node<'_, '_>, field: &str, path: &str) {
        if let Some((node, value)) = leaf(parent, field) {
            if parse_instant(value).is_none() {
                self.error(
                    format!("Invalid ISO 8601 datetime format for {}: {}", field, value),
                    &format!("{}/{}", path, field),
                    node,
                );
            }
        }
    }
}

/// A child element with non-blank text.
fn leaf<'a, 'input>(parent: Node<'a, 'input>, name: &str) -> Option<(Node<'a, 'input>, &'a str)> {
    let node = child(parent, name)?;
    text(node).map(|value| (node, value))
}
