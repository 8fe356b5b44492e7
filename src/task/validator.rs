//! Admission validation for raw task descriptors.
//!
//! The validator is a pure check: it never raises and never touches the
//! filesystem. Callers decide whether to reject, quarantine, or request
//! correction based on the returned field-level errors.

use serde::Serialize;

use crate::config::ValidatorConfig;
use crate::task::descriptor::{self, HeaderError, Priority};

/// A single field-level validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// An error not attributable to a single header field.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new("document", message)
    }
}

/// Result of validating one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    fn failed(errors: Vec<FieldError>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// Validates task descriptors before admission.
pub struct TaskValidator {
    config: ValidatorConfig,
}

impl TaskValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a raw descriptor document.
    ///
    /// Idempotent: the same input always yields the identical error list.
    pub fn validate(&self, raw: &str) -> ValidationReport {
        let header = match descriptor::parse_header(raw) {
            Ok(map) => map,
            Err(HeaderError::Syntax(msg)) => {
                // Malformed headers are a single syntax error, no partial parsing.
                return ValidationReport::failed(vec![FieldError::new(
                    "frontmatter",
                    format!("malformed metadata header: {msg}"),
                )]);
            }
            Err(HeaderError::Missing) => serde_yaml::Mapping::new(),
        };

        let mut errors = Vec::new();

        for field in &self.config.required_fields {
            let value = header.get(field.as_str());
            let missing = match value {
                None => true,
                Some(serde_yaml::Value::Null) => true,
                Some(serde_yaml::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            if missing {
                errors.push(FieldError::new(
                    field.clone(),
                    "required field is missing or empty",
                ));
            }
        }

        if let Some(value) = header.get("priority") {
            match value.as_str() {
                Some(s) if Priority::parse(s).is_some() => {}
                Some(s) => errors.push(FieldError::new(
                    "priority",
                    format!(
                        "'{}' is not one of {}",
                        s,
                        Priority::RECOGNIZED.join("|")
                    ),
                )),
                None => errors.push(FieldError::new("priority", "must be a string")),
            }
        }

        if let Some(value) = header.get("type") {
            match value.as_str() {
                Some(task_type) => {
                    if !self.config.known_types.is_empty()
                        && !self.config.allow_unregistered_types
                        && !self.config.known_types.contains(task_type)
                    {
                        errors.push(FieldError::new(
                            "type",
                            format!("'{task_type}' is not a registered task type"),
                        ));
                    }
                }
                None => errors.push(FieldError::new("type", "must be a string")),
            }
        }

        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::failed(errors)
        }
    }
}
