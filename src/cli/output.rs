//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{ActionType, ChangeSet, ExecutionReport, Outcome, RunStatus};
use crate::reconciler::{DriftReport, DriftStatus};
use crate::state::DeploymentState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Execution result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a change set for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangeSet, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => plan.to_json().unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a change set as text.
    fn format_plan_text(plan: &ChangeSet, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - '{}' matches its declaration.\n",
                "✓".green(),
                plan.unit
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nChange set for {}\n\n", plan.unit.bold());

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .map(|op| OperationRow {
                index: op.index,
                action: Self::format_action_type(op.action),
                kind: op.kind.to_string(),
                resource: op.id.clone(),
                after: op
                    .dependencies
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.operations.iter().filter(|op| !op.delta.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", op.action.symbol(), op.id.bold());
                for change in &op.delta {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.replaces.to_string().magenta(),
            summary.deletes.to_string().red()
        );

        output
    }

    /// Formats an execution report.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match report.status {
                    RunStatus::Converged => format!("{} {} converged", "✓".green(), report.unit),
                    RunStatus::PartiallyConverged => {
                        format!("{} {} partially converged", "⚠".yellow(), report.unit)
                    }
                    RunStatus::Failed => format!("{} {} failed to converge", "✗".red(), report.unit),
                };
                let mut output = format!("\n{status}\n\n");

                if !report.results.is_empty() {
                    let rows: Vec<ResultRow> = report
                        .results
                        .iter()
                        .map(|r| ResultRow {
                            index: r.index,
                            action: Self::format_action_type(r.action),
                            resource: r.id.clone(),
                            outcome: Self::format_outcome(&r.outcome),
                            attempts: r.attempts,
                            physical_id: r.physical_id.clone().unwrap_or_default(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = write!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped\n",
                    report.succeeded(),
                    report.failed(),
                    report.skipped()
                );
                if report.cancelled {
                    let _ = writeln!(output, "{} Run was cancelled before every operation started.", "⚠".yellow());
                }
                if let Some(reason) = &report.halted {
                    let _ = writeln!(output, "{} Run halted: {reason}", "✗".red());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected in {}:\n\n", "⚠".yellow(), report.unit);
                for resource in report.drifted() {
                    match &resource.status {
                        DriftStatus::Drifted { changes } => {
                            let _ = writeln!(output, "   ~ {} ({})", resource.id.yellow(), resource.physical_id);
                            for change in changes {
                                let _ = writeln!(output, "       {change}");
                            }
                        }
                        DriftStatus::Missing => {
                            let _ = writeln!(
                                output,
                                "   ! {} ({}) no longer exists",
                                resource.id.red(),
                                resource.physical_id
                            );
                        }
                        DriftStatus::Error { message } => {
                            let _ = writeln!(output, "   ? {}: {message}", resource.id.dimmed());
                        }
                        DriftStatus::InSync => {}
                    }
                }
                for id in &report.unrecorded {
                    let _ = writeln!(output, "   + {} is declared but not deployed", id.green());
                }
                for id in &report.undeclared {
                    let _ = writeln!(output, "   - {} is deployed but no longer declared", id.red());
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted().len(),
                    report.resources.len()
                );
                output
            }
        }
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(&self, unit: &str, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = ValidationJson {
                    unit,
                    valid: result.is_valid(),
                    errors: result
                        .errors
                        .iter()
                        .map(|e| FieldMessage {
                            field: &e.field,
                            message: &e.message,
                        })
                        .collect(),
                    warnings: &result.warnings,
                };
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Declaration for {unit} is valid.", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Declaration for {unit} is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.unit.bold());
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Records: {}\n", state.records.len());

                if !state.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            id: r.id.clone(),
                            kind: r.kind.to_string(),
                            physical_id: r.physical_id.clone(),
                            hash: r.attribute_hash.chars().take(8).collect(),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let retired: Vec<_> = state
                    .records
                    .values()
                    .flat_map(|r| r.retired.iter().map(move |old| (r.id.as_str(), old)))
                    .collect();
                if !retired.is_empty() {
                    let _ = write!(output, "\n   Awaiting deletion ({}):\n", retired.len());
                    for (id, old) in retired {
                        let _ = writeln!(output, "     {id}: {} {}", old.kind, old.physical_id);
                    }
                }

                let tainted: Vec<&str> =
                    state.records.values().filter(|r| r.tainted).map(|r| r.id.as_str()).collect();
                if !tainted.is_empty() {
                    let _ = writeln!(output, "\n   Not ready, replaced on next apply: {}", tainted.join(", "));
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {}", error.dimmed());
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action: ActionType) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            ActionType::Create => label.green().to_string(),
            ActionType::Update => label.yellow().to_string(),
            ActionType::Replace => label.magenta().to_string(),
            ActionType::Delete => label.red().to_string(),
        }
    }

    /// Formats an operation outcome with color.
    fn format_outcome(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Succeeded => outcome.to_string().green().to_string(),
            Outcome::Failed { .. } => Self::truncate(&outcome.to_string(), 60).red().to_string(),
            Outcome::Skipped { .. } => outcome.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => text.to_string(),
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct ValidationJson<'a> {
    unit: &'a str,
    valid: bool,
    errors: Vec<FieldMessage<'a>>,
    warnings: &'a [String],
}

#[derive(Serialize)]
struct FieldMessage<'a> {
    field: &'a str,
    message: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationError;
    use serde_json::Value;

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a much longer reason", 10), "a much ...");
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&ChangeSet::empty("shop-dev"), false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_validation_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let result = ValidationResult {
            errors: vec![ValidationError {
                field: String::from("resources[0].id"),
                message: String::from("Invalid id"),
            }],
            warnings: vec![String::from("No provider endpoint configured")],
        };

        let value: Value = serde_json::from_str(&formatter.format_validation("shop-dev", &result, true)).unwrap();
        assert_eq!(value["valid"], false);
        assert_eq!(value["errors"][0]["field"], "resources[0].id");
        assert_eq!(value["warnings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_json_messages() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: Value = serde_json::from_str(&formatter.error("boom")).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "boom");
    }
}
