//! Envelope validation pipeline.
//!
//! - [`SchemaValidator`]: structural checks over raw text
//! - [`BusinessRulesValidator`]: semantic rules over a parsed envelope
//! - [`ErrorReporter`]: merged human-facing report
//!
//! [`EnvelopeValidator`] chains the three. All of them are pure and hold no state.

pub mod report;
pub mod rules;
pub mod schema;
pub mod types;

pub use report::{ErrorReporter, ReportEntry, ValidationReport};
pub use rules::BusinessRulesValidator;
pub use schema::SchemaValidator;
pub use types::{RuleViolation, Severity, ValidationIssue, ValidationResult};

use chrono::{DateTime, Utc};

use crate::protocol::{xml, BodyType, Envelope};

/// Full outcome of the validation pipeline for one envelope.
#[derive(Debug, Clone)]
pub struct Validation {
    /// Structural result
    pub schema: ValidationResult,
    /// Rule findings; only the body-type check runs on a structurally invalid envelope
    pub violations: Vec<RuleViolation>,
    /// Typed envelope, present when structurally valid
    pub envelope: Option<Envelope>,
    /// Set when the schema passed but the envelope still failed to parse
    pub parse_error: Option<ValidationIssue>,
    /// Schema and rule findings folded together; rule errors block validity
    pub merged: ValidationResult,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.merged.valid
    }

    /// Valid, and when `reject_warnings` is set, free of warnings too.
    pub fn is_accepted(&self, reject_warnings: bool) -> bool {
        self.is_valid() && !(reject_warnings && self.has_warnings())
    }

    pub fn has_warnings(&self) -> bool {
        self.merged
            .warnings
            .iter()
            .any(|w| w.severity == Severity::Warning)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeValidator {
    schema: SchemaValidator,
    rules: BusinessRulesValidator,
    reporter: ErrorReporter,
}

impl EnvelopeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, raw: &str) -> Validation {
        self.validate_at(raw, Utc::now())
    }

    /// Run schema, parse and rules, treating `now` as the current time.
    pub fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> Validation {
        let schema = self.schema.validate(raw);
        let mut errors = schema.errors.clone();
        let mut warnings = schema.warnings.clone();

        let mut parse_error = None;
        let envelope = if schema.valid {
            match Envelope::parse(raw) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    let issue = ValidationIssue::error(e.to_string()).at("/agent-message");
                    errors.push(issue.clone());
                    parse_error = Some(issue);
                    None
                }
            }
        } else {
            None
        };

        let mut violations = match &envelope {
            Some(envelope) => self.rules.validate_at(envelope, now),
            None => Vec::new(),
        };
        if let Some((declared, wrapper)) = body_wrapper(raw) {
            violations.extend(self.rules.validate_body_type_consistency(&declared, &wrapper));
        }

        for violation in &violations {
            let mut issue = ValidationIssue::error(format!("[{}] {}", violation.rule, violation.message));
            issue.severity = violation.severity;
            issue.path = violation.path.clone();
            if violation.is_error() {
                errors.push(issue);
            } else {
                warnings.push(issue);
            }
        }

        Validation {
            schema,
            violations,
            envelope,
            parse_error,
            merged: ValidationResult::new(errors, warnings),
        }
    }

    /// Human-facing report for a pipeline outcome.
    pub fn report(&self, validation: &Validation, raw: &str) -> ValidationReport {
        let mut structural = validation.schema.clone();
        if let Some(issue) = &validation.parse_error {
            structural = ValidationResult::new(
                structural.errors.into_iter().chain([issue.clone()]).collect(),
                structural.warnings,
            );
        }
        self.reporter.format(&structural, &validation.violations, raw)
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }
}

/// Declared body type and the name of a body-type wrapper element, when the
/// body is wrapped in an element named after some body type.
fn body_wrapper(raw: &str) -> Option<(String, String)> {
    let doc = roxmltree::Document::parse(raw).ok()?;
    let body = xml::child(doc.root_element(), "body")?;
    let declared = body.attribute("type")?;
    let first = xml::elements(body).next()?;
    let name = first.tag_name().name();
    if BodyType::WIRE.iter().any(|w| *w == name) {
        Some((declared.to_string(), name.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AgentRef, AgentRole, EnvelopeBuilder, MessageBody, Priority, QueryKind, Tier,
    };
    use chrono::Duration;

    fn build(priority: Priority, ttl: Duration, to: AgentRef) -> Envelope {
        EnvelopeBuilder::from(AgentRef::new("api-specialist", AgentRole::Specialist, Tier::Sonnet))
            .to(to)
            .priority(priority)
            .ttl(ttl)
            .body(MessageBody::query(QueryKind::AskForHelp, "migration", priority))
            .build()
            .unwrap()
    }

    fn coordinator() -> AgentRef {
        AgentRef::new("eng-coordinator", AgentRole::Coordinator, Tier::Opus)
    }

    #[test]
    fn test_clean_envelope_passes() {
        let env = build(Priority::Critical, Duration::minutes(30), coordinator());
        let validation = EnvelopeValidator::new().validate_at(&env.raw, env.timestamp);
        assert!(validation.is_valid());
        assert!(validation.violations.is_empty());
        assert_eq!(validation.envelope.as_ref().unwrap().message_id, env.message_id);
        assert!(validation.is_accepted(true));
    }

    #[test]
    fn test_rule_error_blocks_validity() {
        let env = build(Priority::Normal, Duration::seconds(-5), coordinator());
        let validation = EnvelopeValidator::new().validate_at(&env.raw, env.timestamp);
        assert!(validation.schema.valid);
        assert!(!validation.is_valid());
        assert!(validation.merged.errors[0].message.starts_with("[temporal-expiration]"));
    }

    #[test]
    fn test_warnings_only_reject_on_request() {
        let env = build(Priority::High, Duration::hours(8), coordinator());
        let validation = EnvelopeValidator::new().validate_at(&env.raw, env.timestamp);
        assert!(validation.is_valid());
        assert!(validation.has_warnings());
        assert!(validation.is_accepted(false));
        assert!(!validation.is_accepted(true));
    }

    #[test]
    fn test_info_does_not_count_as_warning() {
        let env = build(
            Priority::Normal,
            Duration::hours(1),
            AgentRef::new("db-specialist", AgentRole::Specialist, Tier::Haiku),
        );
        let validation = EnvelopeValidator::new().validate_at(&env.raw, env.timestamp);
        assert_eq!(validation.merged.warnings.len(), 1);
        assert!(!validation.has_warnings());
        assert!(validation.is_accepted(true));
    }

    #[test]
    fn test_structural_failure_skips_rules() {
        let validation = EnvelopeValidator::new().validate("<agent-message");
        assert!(!validation.is_valid());
        assert!(validation.envelope.is_none());
        assert!(validation.violations.is_empty());
    }

    #[test]
    fn test_mismatched_wrapper_is_reported() {
        let env = build(Priority::Normal, Duration::hours(1), coordinator());
        let start = env.raw.find("<query-type>").unwrap();
        let end = env.raw.find("</body>").unwrap();
        let wrapped = format!(
            "{}<status-update>{}</status-update>{}",
            &env.raw[..start],
            &env.raw[start..end],
            &env.raw[end..]
        );
        let validation = EnvelopeValidator::new().validate_at(&wrapped, env.timestamp);
        assert!(!validation.is_valid());
        assert!(validation
            .violations
            .iter()
            .any(|v| v.rule == "body-type-mismatch"));
    }

    #[test]
    fn test_report_renders() {
        let env = build(Priority::High, Duration::hours(8), coordinator());
        let validator = EnvelopeValidator::new();
        let validation = validator.validate_at(&env.raw, env.timestamp);
        let report = validator.report(&validation, &env.raw);
        assert_eq!(report.warnings.len(), 1);
        let text = validator.reporter().format_as_text(&report);
        assert!(text.contains("priority-expiration-window"));
    }

    #[test]
    fn test_report_includes_parse_failure() {
        let env = build(Priority::Normal, Duration::hours(1), coordinator());
        let validator = EnvelopeValidator::new();
        let mut validation = validator.validate_at(&env.raw, env.timestamp);
        assert!(validation.parse_error.is_none());

        let issue = ValidationIssue::error("Envelope parse error: bad header").at("/agent-message");
        validation.envelope = None;
        validation.parse_error = Some(issue.clone());
        validation.merged = ValidationResult::new(vec![issue], Vec::new());

        let report = validator.report(&validation, &env.raw);
        assert_eq!(report.errors.len(), validation.merged.errors.len());
        assert_eq!(report.errors[0].message, "Envelope parse error: bad header");
        assert!(!report.is_clean());
    }
}
