//! Human-facing diagnostics for validation outcomes.

use serde::Serialize;

use super::types::{RuleViolation, Severity, ValidationIssue, ValidationResult};
use crate::protocol::{AgentRole, BackoffStrategy, BodyType, Priority, Tier};

const RULE_WIDTH: usize = 80;

/// One formatted finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub message: String,
    pub severity: Severity,
    /// `path at line L:C`, whichever parts are known
    pub location: Option<String>,
    /// Numbered source lines around the defect
    pub context: Option<String>,
    pub suggestion: Option<String>,
}

/// Merged schema and rule findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub summary: String,
    pub errors: Vec<ReportEntry>,
    pub warnings: Vec<ReportEntry>,
    /// Deduplicated, in first-seen order
    pub suggestions: Vec<String>,
    /// Source context of every located schema finding
    pub source_context: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Stateless formatter; holds no validation logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(
        &self,
        result: &ValidationResult,
        violations: &[RuleViolation],
        source: &str,
    ) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut suggestions: Vec<String> = Vec::new();

        for issue in &result.errors {
            let entry = schema_entry(issue, source, suggestion_for(&issue.message));
            push_suggestion(&mut suggestions, &entry.suggestion);
            errors.push(entry);
        }

        for issue in &result.warnings {
            warnings.push(schema_entry(issue, source, None));
        }

        for violation in violations {
            let entry = ReportEntry {
                message: format!("[{}] {}", violation.rule, violation.message),
                severity: violation.severity,
                location: violation.path.clone(),
                context: None,
                suggestion: violation.suggestion.clone(),
            };
            push_suggestion(&mut suggestions, &entry.suggestion);
            if violation.is_error() {
                errors.push(entry);
            } else {
                warnings.push(entry);
            }
        }

        let source_context = result
            .errors
            .iter()
            .chain(result.warnings.iter())
            .filter_map(|issue| issue.line.map(|line| extract_context(source, line)))
            .collect();

        ValidationReport {
            summary: summary(errors.len(), warnings.len()),
            errors,
            warnings,
            suggestions,
            source_context,
        }
    }

    /// Render a report for a terminal.
    pub fn format_as_text(&self, report: &ValidationReport) -> String {
        let heavy = "═".repeat(RULE_WIDTH);
        let light = "─".repeat(RULE_WIDTH);
        let mut lines: Vec<String> = vec![heavy.clone(), report.summary.clone(), heavy.clone()];

        if !report.errors.is_empty() {
            lines.push(String::new());
            lines.push("ERRORS:".to_string());
            lines.push(light.clone());
            for entry in &report.errors {
                lines.push(format!("❌ {}", entry.message));
                render_details(&mut lines, entry, true);
            }
        }

        if !report.warnings.is_empty() {
            lines.push(String::new());
            lines.push("WARNINGS:".to_string());
            lines.push(light.clone());
            for entry in &report.warnings {
                let icon = if entry.severity == Severity::Info { "ℹ️" } else { "⚠️" };
                lines.push(format!("{} {}", icon, entry.message));
                render_details(&mut lines, entry, false);
            }
        }

        if !report.suggestions.is_empty() && !report.is_clean() {
            lines.push(String::new());
            lines.push("RECOMMENDED ACTIONS:".to_string());
            lines.push(light);
            for (i, suggestion) in report.suggestions.iter().enumerate() {
                lines.push(format!("{}. {}", i + 1, suggestion));
            }
        }

        lines.push(heavy);
        lines.join("\n")
    }
}

fn render_details(lines: &mut Vec<String>, entry: &ReportEntry, with_context: bool) {
    if let Some(location) = &entry.location {
        lines.push(format!("   Location: {}", location));
    }
    if with_context {
        if let Some(context) = &entry.context {
            lines.push(format!("   Context:\n{}", context));
        }
    }
    if let Some(suggestion) = &entry.suggestion {
        lines.push(format!("   💡 Suggestion: {}", suggestion));
    }
    lines.push(String::new());
}

fn push_suggestion(suggestions: &mut Vec<String>, suggestion: &Option<String>) {
    if let Some(s) = suggestion {
        if !suggestions.contains(s) {
            suggestions.push(s.clone());
        }
    }
}

fn schema_entry(issue: &ValidationIssue, source: &str, suggestion: Option<String>) -> ReportEntry {
    ReportEntry {
        message: issue.message.clone(),
        severity: issue.severity,
        location: location(issue),
        context: issue.line.map(|line| extract_context(source, line)),
        suggestion,
    }
}

fn summary(errors: usize, warnings: usize) -> String {
    let plural = |n: usize, word: &str| format!("{} {}{}", n, word, if n == 1 { "" } else { "s" });
    match (errors, warnings) {
        (0, 0) => "✅ Validation passed with no errors or warnings".to_string(),
        (0, w) => format!("⚠️ Validation passed with {}", plural(w, "warning")),
        (e, 0) => format!("❌ Validation failed with {}", plural(e, "error")),
        (e, w) => format!(
            "❌ Validation failed with {} and {}",
            plural(e, "error"),
            plural(w, "warning")
        ),
    }
}

fn location(issue: &ValidationIssue) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(path) = &issue.path {
        parts.push(path.clone());
    }
    match (issue.line, issue.column) {
        (Some(line), Some(column)) => parts.push(format!("line {}:{}", line, column)),
        (Some(line), None) => parts.push(format!("line {}", line)),
        _ => {}
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" at "))
    }
}

/// Two lines either side of `line` (one-based), the defect line marked with `→`.
pub fn extract_context(source: &str, line: u32) -> String {
    let lines: Vec<&str> = source.split('\n').collect();
    let line = line as usize;
    let start = line.saturating_sub(3);
    let end = (line + 2).min(lines.len());

    lines
        .iter()
        .enumerate()
        .take(end)
        .skip(start)
        .map(|(i, text)| {
            let number = i + 1;
            let marker = if number == line { "→ " } else { "  " };
            format!("{}{}: {}", marker, number, text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remediation hint keyed on the wording of a structural error.
fn suggestion_for(message: &str) -> Option<String> {
    let lower = message.to_lowercase();

    if lower.contains("missing required") {
        if let Some((_, element)) = message.split_once("element: ") {
            return Some(format!("Add the required <{}> element to your message", element));
        }
    }
    if lower.contains("invalid uuid") {
        return Some(
            "Ensure UUIDs follow RFC 4122 format: xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx (lowercase hex)"
                .to_string(),
        );
    }
    if lower.contains("invalid iso 8601") || lower.contains("datetime format") {
        return Some("Use ISO 8601 format: YYYY-MM-DDTHH:mm:ssZ (e.g., 2025-11-06T14:30:00Z)".to_string());
    }
    if lower.contains("invalid priority") {
        return Some(format!("Priority must be one of: {}", Priority::expected()));
    }
    if lower.contains("invalid agent-role") {
        return Some(format!("agent-role must be one of: {}", AgentRole::expected()));
    }
    if lower.contains("invalid tier") {
        return Some(format!("tier must be one of: {}", Tier::expected()));
    }
    if lower.contains("invalid backoff-strategy") {
        return Some(format!(
            "backoff-strategy must be one of: {}",
            BackoffStrategy::expected()
        ));
    }
    if lower.contains("invalid body type") {
        return Some(format!("body type must be one of: {}", BodyType::expected()));
    }
    if lower.contains("must be a positive integer") {
        return Some("Provide a positive integer value (1, 2, 3, ...)".to_string());
    }
    if lower.contains("version") {
        return Some("Set version attribute to \"1.0\"".to_string());
    }
    if lower.contains("root element") {
        return Some("Ensure your XML document starts with <agent-message> root element".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "line one\nline two\nline three\nline four\nline five\nline six";

    #[test]
    fn test_clean_report() {
        let report = ErrorReporter::new().format(&ValidationResult::new(vec![], vec![]), &[], "");
        assert!(report.is_clean());
        assert_eq!(report.summary, "✅ Validation passed with no errors or warnings");
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn test_summary_wording() {
        assert_eq!(summary(1, 0), "❌ Validation failed with 1 error");
        assert_eq!(summary(2, 1), "❌ Validation failed with 2 errors and 1 warning");
        assert_eq!(summary(0, 3), "⚠️ Validation passed with 3 warnings");
    }

    #[test]
    fn test_context_marks_defect_line() {
        let context = extract_context(SOURCE, 4);
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(
            lines,
            vec![
                "  2: line two",
                "  3: line three",
                "→ 4: line four",
                "  5: line five",
                "  6: line six"
            ]
        );
        assert_eq!(extract_context(SOURCE, 1).lines().count(), 3);
    }

    #[test]
    fn test_merges_and_dedupes_suggestions() {
        let result = ValidationResult::new(
            vec![
                ValidationIssue::error("Missing required element: priority")
                    .at("/agent-message/header")
                    .located((3, 5)),
                ValidationIssue::error("Invalid UUID format for message-id: X"),
                ValidationIssue::error("Invalid UUID format for correlation-id: Y"),
            ],
            vec![],
        );
        let violations = vec![
            RuleViolation::new("tier-alignment-inefficient", Severity::Info, "opus to haiku")
                .at("/agent-message/header")
                .suggest("Consider if task is appropriate for recipient tier"),
        ];

        let report = ErrorReporter::new().format(&result, &violations, SOURCE);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].message, "[tier-alignment-inefficient] opus to haiku");
        assert_eq!(report.suggestions.len(), 3);
        assert_eq!(
            report.suggestions[0],
            "Add the required <priority> element to your message"
        );
        assert_eq!(
            report.errors[0].location.as_deref(),
            Some("/agent-message/header at line 3:5")
        );
        assert_eq!(report.source_context.len(), 1);
    }

    #[test]
    fn test_version_suggestion() {
        assert_eq!(
            suggestion_for("Missing required attribute: version").as_deref(),
            Some("Set version attribute to \"1.0\"")
        );
        assert!(suggestion_for("something unrelated").is_none());
    }

    #[test]
    fn test_text_rendering_sections() {
        let result = ValidationResult::new(
            vec![ValidationIssue::error("Invalid tier: gpt. Must be one of: opus, sonnet, haiku")],
            vec![],
        );
        let reporter = ErrorReporter::new();
        let text = reporter.format_as_text(&reporter.format(&result, &[], SOURCE));
        assert!(text.contains("ERRORS:"));
        assert!(!text.contains("WARNINGS:"));
        assert!(text.contains("RECOMMENDED ACTIONS:"));
        assert!(text.contains("1. tier must be one of: opus, sonnet, haiku"));
    }
}
