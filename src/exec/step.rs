//! Plan steps and the collaborator seams of the loop.
//!
//! The loop's "execute step" primitive is an opaque delegated call: it
//! eventually returns, and on success the executor is the sole authority
//! that may relocate a task document to the done location.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::approval::RiskLevel;
use crate::task::descriptor::Task;

/// One planned action of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub risk: RiskLevel,
}

impl Step {
    pub fn new(id: impl Into<String>, description: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            risk,
        }
    }
}

/// Result of a successful delegated step call.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Optional human-readable summary of what the step did.
    pub summary: Option<String>,
}

/// A step's delegated call failed. Recorded and fed to the failure counter.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes a single step of a task.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, task: &Task, step: &Step) -> Result<StepOutput, StepError>;
}

/// Turns an admitted task into an ordered plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &Task) -> Vec<Step>;
}

/// Words that mark a step as an outward-facing action needing a gate.
const SENSITIVE_KEYWORDS: [&str; 20] = [
    "send", "email", "post", "publish", "delete", "remove", "pay", "payment", "invoice",
    "transfer", "purchase", "share", "forward", "reply", "respond", "commit", "deploy",
    "release", "approve", "reject",
];

/// Actions that are always high risk regardless of context.
const HIGH_RISK_ACTIONS: [&str; 11] = [
    "delete", "remove", "cancel", "reject", "pay", "payment", "transfer", "purchase", "deploy",
    "release", "publish",
];

/// Classify a step description by keyword.
pub fn classify_risk(description: &str) -> RiskLevel {
    let lower = description.to_lowercase();
    if HIGH_RISK_ACTIONS.iter().any(|kw| lower.contains(kw)) {
        RiskLevel::High
    } else if SENSITIVE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Keyword-driven planner.
///
/// Prefers an `## Action Items` section in the task body; each checklist line
/// becomes a step. Without one, it falls back to a canned plan per task type.
pub struct HeuristicPlanner;

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&self, task: &Task) -> Vec<Step> {
        if let Some(items) = action_items(&task.body) {
            return items
                .into_iter()
                .enumerate()
                .map(|(i, description)| {
                    let risk = classify_risk(&description);
                    Step::new(format!("step_{}", i + 1), description, risk)
                })
                .collect();
        }
        match task.task_type.as_deref() {
            Some("email_reply") | Some("email_task") => vec![
                Step::new("step_1", "Read and analyze email content", RiskLevel::Low),
                Step::new("step_2", "Draft reply addressing all points", RiskLevel::Low),
                Step::new("step_3", "Review draft for tone and accuracy", RiskLevel::Low),
                Step::new("step_4", "Send email reply", RiskLevel::High),
            ],
            Some(t) if t.contains("project") => vec![
                Step::new("step_1", "Review project requirements", RiskLevel::Low),
                Step::new("step_2", "Break down into subtasks", RiskLevel::Low),
                Step::new("step_3", "Execute each subtask", RiskLevel::Low),
                Step::new("step_4", "Test and verify completion", RiskLevel::Low),
                Step::new("step_5", "Document results", RiskLevel::Low),
            ],
            _ => vec![
                Step::new("step_1", "Analyze task requirements", RiskLevel::Low),
                Step::new("step_2", "Carry out the requested work", RiskLevel::Low),
                Step::new("step_3", "Verify completion", RiskLevel::Low),
            ],
        }
    }
}

/// Parse the checklist lines of an `## Action Items` section, if present.
fn action_items(body: &str) -> Option<Vec<String>> {
    let after = body.split("## Action Items").nth(1)?;
    let section = after.split("\n## ").next().unwrap_or(after);
    let items: Vec<String> = section
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?;
            // Strip an optional checkbox marker.
            let rest = rest
                .strip_prefix("[ ] ")
                .or_else(|| rest.strip_prefix("[x] "))
                .unwrap_or(rest);
            let rest = rest.trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect();
    (!items.is_empty()).then_some(items)
}
