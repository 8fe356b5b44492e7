//! Task descriptor model and frontmatter codec.
//!
//! A task is a markdown document with a YAML metadata header between `---`
//! delimiters. The header carries at minimum a task identifier; priority,
//! task type, and required capability are optional. The body is the opaque
//! payload handed to the step executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task priority. The four recognized values, case-sensitive on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// The recognized wire values, in rank order.
    pub const RECOGNIZED: [&'static str; 4] = ["critical", "high", "medium", "low"];

    /// Parse a wire value. Case-sensitive; anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// Typed frontmatter header of a task document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// An admitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, immutable once assigned.
    pub id: String,
    /// Priority; descriptors without one default to low.
    pub priority: Priority,
    /// Free-form type tag.
    pub task_type: Option<String>,
    /// Capability an agent must declare to execute this task.
    pub capability: Option<String>,
    /// Opaque payload (the document body).
    pub body: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Why a header could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// No `---` delimited header at the top of the document.
    Missing,
    /// A header was present but its YAML did not parse.
    Syntax(String),
}

/// Split a document into its raw YAML header and body.
pub fn split_frontmatter(content: &str) -> Result<(&str, &str), HeaderError> {
    let rest = content.strip_prefix("---\n").ok_or(HeaderError::Missing)?;
    match rest.split_once("\n---") {
        Some((yaml, tail)) => {
            // The closing delimiter must end its line.
            let body = match tail.strip_prefix('\n') {
                Some(b) => b,
                None if tail.is_empty() => "",
                None => return Err(HeaderError::Missing),
            };
            Ok((yaml, body))
        }
        None => Err(HeaderError::Missing),
    }
}

/// Parse the header into a YAML mapping for field-level inspection.
pub fn parse_header(content: &str) -> Result<serde_yaml::Mapping, HeaderError> {
    let (yaml, _) = split_frontmatter(content)?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| HeaderError::Syntax(e.to_string()))?;
    match value {
        serde_yaml::Value::Mapping(map) => Ok(map),
        serde_yaml::Value::Null => Ok(serde_yaml::Mapping::new()),
        _ => Err(HeaderError::Syntax("header is not a mapping".to_string())),
    }
}

/// Extract just the task identifier, if the document has one.
pub fn extract_id(content: &str) -> Option<String> {
    let map = parse_header(content).ok()?;
    map.get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

impl Task {
    /// Build a task from a validated document.
    ///
    /// Callers are expected to have run the descriptor through the validator
    /// first; this returns a plain message for anything still inconsistent.
    pub fn from_document(content: &str) -> Result<Self, String> {
        let (yaml, body) = split_frontmatter(content).map_err(|e| match e {
            HeaderError::Missing => "missing metadata header".to_string(),
            HeaderError::Syntax(msg) => msg,
        })?;
        let header: TaskHeader = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
        Ok(Self {
            id: header.id,
            priority: header.priority.unwrap_or(Priority::Low),
            task_type: header.task_type,
            capability: header.capability,
            body: body.to_string(),
            created_at: header.created.unwrap_or_else(Utc::now),
        })
    }

    /// Render the task back into document form (frontmatter + body).
    pub fn to_document(&self) -> String {
        let header = TaskHeader {
            id: self.id.clone(),
            priority: Some(self.priority),
            task_type: self.task_type.clone(),
            capability: self.capability.clone(),
            created: Some(self.created_at),
        };
        let yaml = serde_yaml::to_string(&header).unwrap_or_default();
        format!("---\n{}---\n{}", yaml, self.body)
    }
}
