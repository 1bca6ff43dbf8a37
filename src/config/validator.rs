//! Declaration validation.
//!
//! Checks everything that can be checked without the graph builder or a
//! provider: naming, per-kind required attributes, schedule expressions,
//! malformed references and placeholder literals.

use crate::error::{ConfigError, DriftlessError, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use validator::Validate;

use super::spec::{DriftlessConfig, PlaceholderPolicy, ProjectConfig, StateBackend, StateConfig};
use crate::model::{AttrValue, ResourceKind, ResourceNode};

/// Marker substrings of placeholder values.
const PLACEHOLDER_MARKERS: &[&str] = &["CHANGE_ME", "CHANGEME", "TODO", "REPLACE_ME"];

/// Units accepted in `rate(...)` expressions.
const RATE_UNITS: &[&str] = &["minute", "minutes", "hour", "hours", "day", "days"];

/// Validator for declarations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &DriftlessConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            let message = if result.errors.len() > 1 {
                format!("{} (and {} more)", first_error.message, result.errors.len() - 1)
            } else {
                first_error.message.clone()
            };
            Err(DriftlessError::Config(ConfigError::ValidationError {
                message,
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning.
    #[must_use]
    pub fn check(&self, config: &DriftlessConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_settings(config, &mut result);
        Self::validate_resources(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3 && state.bucket.as_ref().is_none_or(String::is_empty) {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }
    }

    /// Validates provider and execution settings.
    fn validate_settings(config: &DriftlessConfig, result: &mut ValidationResult) {
        for (section, outcome) in [
            ("provider", config.provider.validate()),
            ("execution", config.execution.validate()),
        ] {
            if let Err(errors) = outcome {
                for (field, field_errors) in errors.field_errors() {
                    for e in field_errors {
                        result.error(
                            format!("{section}.{field}"),
                            format!("Value out of range ({})", e.code),
                        );
                    }
                }
            }
        }

        if config.execution.max_delay_ms < config.execution.base_delay_ms {
            result.error(
                "execution.max_delay_ms",
                "Maximum backoff delay is smaller than the base delay",
            );
        }

        match config.provider.endpoint.as_deref() {
            None => result.warnings.push(String::from(
                "provider.endpoint is not set; apply, drift and destroy need it",
            )),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                result.error("provider.endpoint", format!("Endpoint '{url}' is not an http(s) URL"));
            }
            Some(_) => {}
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(config: &DriftlessConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let kinds: HashMap<&str, ResourceKind> = config
            .resources
            .iter()
            .map(|r| (r.id.as_str(), r.kind))
            .collect();
        let mut seen_ids = HashSet::new();

        for (i, node) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_ids.insert(node.id.as_str()) {
                result.error(format!("{prefix}.id"), format!("Duplicate resource id: {}", node.id));
            }

            if !is_valid_name(&node.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        node.id
                    ),
                );
            }

            for required in node.kind.required_attributes() {
                if node.attribute(required).is_none() {
                    result.error(
                        format!("{prefix}.attributes.{required}"),
                        format!("{} '{}' requires attribute '{required}'", node.kind, node.id),
                    );
                }
            }

            for (name, value) in &node.attributes {
                Self::validate_value(value, &format!("{prefix}.attributes.{name}"), result);
            }

            match node.kind {
                ResourceKind::ScheduleRule => Self::validate_schedule(node, &prefix, &kinds, result),
                ResourceKind::Secret => {
                    if node.attribute("value").is_some() || node.attribute("secret_string").is_some() {
                        result.warnings.push(format!(
                            "{prefix}: secret values are not managed; only the secret container is"
                        ));
                    }
                }
                _ => {}
            }

            Self::validate_placeholders(node, &prefix, config.execution.placeholders, result);
        }
    }

    /// Flags maps that look like references but failed to parse as one.
    fn validate_value(value: &AttrValue, field: &str, result: &mut ValidationResult) {
        match value {
            AttrValue::Map(entries) => {
                if let Some(raw) = entries.get("ref") {
                    let shown = raw.as_str().unwrap_or("<non-string>");
                    result.error(
                        field,
                        format!("Malformed reference '{shown}'. Expected {{ ref: <resource>.<output> }}"),
                    );
                }
                for (key, nested) in entries {
                    Self::validate_value(nested, &format!("{field}.{key}"), result);
                }
            }
            AttrValue::List(items) => {
                for (i, nested) in items.iter().enumerate() {
                    Self::validate_value(nested, &format!("{field}[{i}]"), result);
                }
            }
            AttrValue::Reference(_) | AttrValue::Literal(_) => {}
        }
    }

    /// Validates a schedule rule's expression and target.
    fn validate_schedule(
        node: &ResourceNode,
        prefix: &str,
        kinds: &HashMap<&str, ResourceKind>,
        result: &mut ValidationResult,
    ) {
        if let Some(schedule) = node.attribute("schedule") {
            match schedule.as_str() {
                Some(expr) if is_valid_schedule(expr) => {}
                Some(expr) => result.error(
                    format!("{prefix}.attributes.schedule"),
                    format!("Invalid schedule '{expr}'. Expected cron(<6 fields>) or rate(<n> <unit>)"),
                ),
                None => result.error(
                    format!("{prefix}.attributes.schedule"),
                    "Schedule must be a string literal",
                ),
            }
        }

        if let Some(target) = node.attribute("target") {
            let target_kind = target
                .as_reference()
                .and_then(|r| kinds.get(r.target.as_str()).copied());
            match (target.as_reference(), target_kind) {
                (Some(_), Some(ResourceKind::Function)) => {}
                (Some(r), Some(kind)) => result.error(
                    format!("{prefix}.attributes.target"),
                    format!("Schedule target '{}' is a {kind}, expected a function", r.target),
                ),
                // dangling references are reported by the graph builder
                (Some(_), None) => {}
                (None, _) => result.error(
                    format!("{prefix}.attributes.target"),
                    "Schedule target must reference a function, e.g. { ref: cleanup-fn.arn }",
                ),
            }
        }
    }

    /// Applies the placeholder policy to every string literal of a node.
    fn validate_placeholders(
        node: &ResourceNode,
        prefix: &str,
        policy: PlaceholderPolicy,
        result: &mut ValidationResult,
    ) {
        if policy == PlaceholderPolicy::Allow {
            return;
        }

        for (name, value) in &node.attributes {
            for literal in value.string_literals() {
                if !is_placeholder(literal) {
                    continue;
                }
                let field = format!("{prefix}.attributes.{name}");
                let message = format!("Placeholder value '{literal}' in '{}'", node.id);
                if policy == PlaceholderPolicy::Reject {
                    result.error(field, message);
                } else {
                    result.warnings.push(format!("{field}: {message}"));
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Returns true for values that were obviously never filled in.
#[must_use]
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with("your-")
        || trimmed.starts_with("your_")
        || (trimmed.starts_with('<') && trimmed.ends_with('>') && trimmed.len() > 2)
        || PLACEHOLDER_MARKERS.iter().any(|m| trimmed.contains(m))
}

/// Accepts `cron(m h dom mon dow year)` and `rate(n unit)`.
fn is_valid_schedule(expr: &str) -> bool {
    if let Some(body) = expr.strip_prefix("cron(").and_then(|s| s.strip_suffix(')')) {
        return body.split_whitespace().count() == 6;
    }
    if let Some(body) = expr.strip_prefix("rate(").and_then(|s| s.strip_suffix(')')) {
        let mut parts = body.split_whitespace();
        return match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(unit), None) => {
                n.parse::<u32>().is_ok_and(|n| n > 0) && RATE_UNITS.contains(&unit)
            }
            _ => false,
        };
    }
    false
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
