//! Semantic rules over a structurally valid envelope.
//!
//! Every rule is evaluated independently; only a non-increasing expiration is a
//! hard error, everything else is advisory.

use chrono::{DateTime, Utc};

use super::types::{RuleViolation, Severity};
use crate::protocol::{format_instant, AgentRole, BackoffStrategy, Envelope, Tier};

/// Longest expiration window, in hours, tolerated for urgent messages.
pub const URGENT_WINDOW_HOURS: f64 = 5.0;

/// Recommended ceiling for `max-attempts`.
pub const MAX_RECOMMENDED_ATTEMPTS: u32 = 5;

/// Ceiling for `max-attempts` under exponential backoff.
pub const MAX_EXPONENTIAL_ATTEMPTS: u32 = 10;

/// Ceiling for `timeout-seconds` (10 minutes).
pub const MAX_TIMEOUT_SECONDS: u64 = 600;

const HEADER: &str = "/agent-message/header";
const EXPIRATION: &str = "/agent-message/header/expiration";

#[derive(Debug, Clone, Copy, Default)]
pub struct BusinessRulesValidator;

impl BusinessRulesValidator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate all rules against the current time.
    pub fn validate(&self, envelope: &Envelope) -> Vec<RuleViolation> {
        self.validate_at(envelope, Utc::now())
    }

    /// Evaluate all rules, treating `now` as the current time.
    pub fn validate_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> Vec<RuleViolation> {
        let mut violations = Vec::new();
        temporal(envelope, now, &mut violations);
        priority_window(envelope, &mut violations);
        retry_policy(envelope, &mut violations);
        hierarchy(envelope, &mut violations);
        violations
    }

    /// The body `type` attribute must name its wrapper element.
    pub fn validate_body_type_consistency(
        &self,
        body_type: &str,
        child_element: &str,
    ) -> Option<RuleViolation> {
        if body_type == child_element {
            return None;
        }
        Some(
            RuleViolation::new(
                "body-type-mismatch",
                Severity::Error,
                format!(
                    "Body type attribute \"{}\" does not match child element \"{}\"",
                    body_type, child_element
                ),
            )
            .at("/agent-message/body")
            .suggest(format!(
                "Change body type to \"{}\" or use correct child element",
                child_element
            )),
        )
    }

    /// The correlation id should reference a message of the conversation chain.
    /// An empty chain is not checked.
    pub fn validate_correlation_chain(
        &self,
        correlation_id: &str,
        chain: &[String],
    ) -> Vec<RuleViolation> {
        if chain.is_empty() || chain.iter().any(|id| id == correlation_id) {
            return Vec::new();
        }
        vec![RuleViolation::new(
            "correlation-chain-mismatch",
            Severity::Warning,
            "correlation-id should match at least one message-ref in conversation-chain",
        )
        .at(HEADER)
        .suggest("Ensure correlation-id matches the original message that started this conversation")]
    }
}

fn temporal(envelope: &Envelope, now: DateTime<Utc>, out: &mut Vec<RuleViolation>) {
    if envelope.expiration <= envelope.timestamp {
        out.push(
            RuleViolation::new(
                "temporal-expiration",
                Severity::Error,
                format!(
                    "Message expiration ({}) must be after timestamp ({})",
                    format_instant(envelope.expiration),
                    format_instant(envelope.timestamp)
                ),
            )
            .at(EXPIRATION)
            .suggest("Set expiration to a future time relative to timestamp"),
        );
    }

    if envelope.expiration < now {
        out.push(
            RuleViolation::new(
                "temporal-pre-expired",
                Severity::Warning,
                format!(
                    "Message is already expired. Expiration: {}, Current time: {}",
                    format_instant(envelope.expiration),
                    format_instant(now)
                ),
            )
            .at(EXPIRATION)
            .suggest("Update expiration to a future time"),
        );
    }
}

fn priority_window(envelope: &Envelope, out: &mut Vec<RuleViolation>) {
    if !envelope.priority.is_urgent() {
        return;
    }
    let hours = envelope.expiration_window().num_milliseconds() as f64 / 3_600_000.0;
    if hours > URGENT_WINDOW_HOURS {
        out.push(
            RuleViolation::new(
                "priority-expiration-window",
                Severity::Warning,
                format!(
                    "{} priority messages should expire within 5 hours. Current window: {:.2} hours",
                    envelope.priority, hours
                ),
            )
            .at(HEADER)
            .suggest("Reduce expiration window to ≤5 hours or lower priority to \"normal\""),
        );
    }
}

fn retry_policy(envelope: &Envelope, out: &mut Vec<RuleViolation>) {
    let Some(policy) = envelope.retry_policy else {
        return;
    };

    if policy.max_attempts > MAX_RECOMMENDED_ATTEMPTS {
        out.push(
            RuleViolation::new(
                "retry-max-attempts",
                Severity::Warning,
                format!(
                    "max-attempts ({}) exceeds recommended limit of {}",
                    policy.max_attempts, MAX_RECOMMENDED_ATTEMPTS
                ),
            )
            .at("/agent-message/header/retry-policy/max-attempts")
            .suggest("Reduce max-attempts to ≤5 to prevent excessive retries"),
        );
    }

    if policy.timeout_seconds > MAX_TIMEOUT_SECONDS {
        out.push(
            RuleViolation::new(
                "retry-timeout-excessive",
                Severity::Warning,
                format!(
                    "timeout-seconds ({}) is excessive (>10 minutes)",
                    policy.timeout_seconds
                ),
            )
            .at("/agent-message/header/retry-policy/timeout-seconds")
            .suggest("Consider reducing timeout to a more reasonable value"),
        );
    }

    if policy.backoff_strategy == BackoffStrategy::Exponential
        && policy.max_attempts > MAX_EXPONENTIAL_ATTEMPTS
    {
        out.push(
            RuleViolation::new(
                "retry-exponential-explosion",
                Severity::Warning,
                format!(
                    "Exponential backoff with {} attempts may cause extremely long delays",
                    policy.max_attempts
                ),
            )
            .at("/agent-message/header/retry-policy")
            .suggest("Reduce max-attempts or use linear/fixed backoff strategy"),
        );
    }
}

fn hierarchy(envelope: &Envelope, out: &mut Vec<RuleViolation>) {
    let sender = &envelope.sender;
    let recipient = &envelope.recipient;

    match (sender.agent_role, recipient.agent_role) {
        (AgentRole::Coordinator, AgentRole::Orchestrator) => out.push(
            RuleViolation::new(
                "agent-hierarchy-coordinator-to-orchestrator",
                Severity::Warning,
                "Coordinators should not directly message orchestrators. Use proper escalation channels.",
            )
            .at(HEADER)
            .suggest("Route through appropriate coordinator or tech-lead"),
        ),
        (AgentRole::Specialist, AgentRole::Specialist) => out.push(
            RuleViolation::new(
                "agent-hierarchy-specialist-to-specialist",
                Severity::Info,
                "Specialists should communicate through their coordinator, not directly",
            )
            .at(HEADER)
            .suggest("Route message through coordinator for proper context filtering"),
        ),
        _ => {}
    }

    if sender.tier == Tier::Opus && recipient.tier == Tier::Haiku {
        out.push(
            RuleViolation::new(
                "tier-alignment-inefficient",
                Severity::Info,
                "High-tier agent (opus) sending to low-tier agent (haiku) may indicate inefficient routing",
            )
            .at(HEADER)
            .suggest("Consider if task is appropriate for recipient tier"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AgentRef, EnvelopeBuilder, MessageBody, Priority, QueryKind, RetryPolicy,
    };
    use chrono::Duration;

    fn agent(name: &str, role: AgentRole, tier: Tier) -> AgentRef {
        AgentRef::new(name, role, tier)
    }

    fn envelope(
        from: AgentRef,
        to: AgentRef,
        priority: Priority,
        ttl: Duration,
        policy: Option<RetryPolicy>,
    ) -> Envelope {
        let mut builder = EnvelopeBuilder::from(from)
            .to(to)
            .priority(priority)
            .ttl(ttl)
            .body(MessageBody::query(QueryKind::GetStatus, "release", priority));
        if let Some(policy) = policy {
            builder = builder.retry_policy(policy);
        }
        builder.build().unwrap()
    }

    fn rules(violations: &[RuleViolation]) -> Vec<&str> {
        violations.iter().map(|v| v.rule.as_str()).collect()
    }

    fn coordinator() -> AgentRef {
        agent("eng-coordinator", AgentRole::Coordinator, Tier::Sonnet)
    }

    fn specialist(name: &str) -> AgentRef {
        agent(name, AgentRole::Specialist, Tier::Sonnet)
    }

    #[test]
    fn test_clean_envelope_has_no_violations() {
        let env = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Critical,
            Duration::minutes(30),
            None,
        );
        let violations = BusinessRulesValidator::new().validate_at(&env, env.timestamp);
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_expiration_not_after_timestamp_is_error() {
        let env = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Normal,
            Duration::zero(),
            None,
        );
        let violations = BusinessRulesValidator::new().validate_at(&env, env.timestamp);
        assert_eq!(rules(&violations), vec!["temporal-expiration"]);
        assert!(violations[0].is_error());
        assert_eq!(violations[0].path.as_deref(), Some(EXPIRATION));
    }

    #[test]
    fn test_pre_expired_is_warning() {
        let env = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Normal,
            Duration::minutes(10),
            None,
        );
        let later = env.expiration + Duration::seconds(1);
        let violations = BusinessRulesValidator::new().validate_at(&env, later);
        assert_eq!(rules(&violations), vec!["temporal-pre-expired"]);
        assert_eq!(violations[0].severity, Severity::Warning);
    }

    #[test]
    fn test_urgent_window() {
        let validator = BusinessRulesValidator::new();
        for priority in [Priority::Critical, Priority::High] {
            let env = envelope(
                specialist("api-specialist"),
                coordinator(),
                priority,
                Duration::hours(6),
                None,
            );
            let violations = validator.validate_at(&env, env.timestamp);
            assert_eq!(rules(&violations), vec!["priority-expiration-window"]);
            assert!(violations[0].message.contains("6.00 hours"));
        }

        let exactly_five = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::High,
            Duration::hours(5),
            None,
        );
        assert!(validator.validate_at(&exactly_five, exactly_five.timestamp).is_empty());

        let normal = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Normal,
            Duration::hours(48),
            None,
        );
        assert!(validator.validate_at(&normal, normal.timestamp).is_empty());
    }

    #[test]
    fn test_retry_policy_rules() {
        let env = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Normal,
            Duration::hours(1),
            Some(RetryPolicy {
                max_attempts: 11,
                backoff_strategy: BackoffStrategy::Exponential,
                timeout_seconds: 601,
            }),
        );
        let violations = BusinessRulesValidator::new().validate_at(&env, env.timestamp);
        assert_eq!(
            rules(&violations),
            vec![
                "retry-max-attempts",
                "retry-timeout-excessive",
                "retry-exponential-explosion"
            ]
        );
        assert!(violations.iter().all(|v| v.severity == Severity::Warning));

        let linear = envelope(
            specialist("api-specialist"),
            coordinator(),
            Priority::Normal,
            Duration::hours(1),
            Some(RetryPolicy {
                max_attempts: 11,
                backoff_strategy: BackoffStrategy::Linear,
                timeout_seconds: 600,
            }),
        );
        let violations = BusinessRulesValidator::new().validate_at(&linear, linear.timestamp);
        assert_eq!(rules(&violations), vec!["retry-max-attempts"]);
    }

    #[test]
    fn test_hierarchy_rules() {
        let validator = BusinessRulesValidator::new();

        let up = envelope(
            coordinator(),
            agent("cto", AgentRole::Orchestrator, Tier::Opus),
            Priority::Normal,
            Duration::hours(1),
            None,
        );
        let violations = validator.validate_at(&up, up.timestamp);
        assert_eq!(rules(&violations), vec!["agent-hierarchy-coordinator-to-orchestrator"]);
        assert_eq!(violations[0].severity, Severity::Warning);

        let sideways = envelope(
            specialist("frontend-specialist"),
            specialist("backend-specialist"),
            Priority::Normal,
            Duration::hours(1),
            None,
        );
        let violations = validator.validate_at(&sideways, sideways.timestamp);
        assert_eq!(rules(&violations), vec!["agent-hierarchy-specialist-to-specialist"]);
        assert_eq!(violations[0].severity, Severity::Info);

        let down = envelope(
            agent("cto", AgentRole::Orchestrator, Tier::Opus),
            agent("qa-coordinator", AgentRole::Coordinator, Tier::Haiku),
            Priority::Normal,
            Duration::hours(1),
            None,
        );
        let violations = validator.validate_at(&down, down.timestamp);
        assert_eq!(rules(&violations), vec!["tier-alignment-inefficient"]);
    }

    #[test]
    fn test_body_type_consistency() {
        let validator = BusinessRulesValidator::new();
        assert!(validator.validate_body_type_consistency("query", "query").is_none());
        let violation = validator
            .validate_body_type_consistency("query", "task-delegation")
            .unwrap();
        assert_eq!(violation.rule, "body-type-mismatch");
        assert!(violation.is_error());
    }

    #[test]
    fn test_correlation_chain() {
        let validator = BusinessRulesValidator::new();
        let chain = vec!["a".to_string(), "b".to_string()];
        assert!(validator.validate_correlation_chain("a", &chain).is_empty());
        assert!(validator.validate_correlation_chain("z", &[]).is_empty());
        let violations = validator.validate_correlation_chain("z", &chain);
        assert_eq!(rules(&violations), vec!["correlation-chain-mismatch"]);
    }
}
