//! Error types for the vault orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::task::validator::FieldError;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Loop error: {0}")]
    Loop(#[from] LoopError),
}

/// Filesystem vault errors.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Task {id} not found in any location")]
    TaskNotFound { id: String },

    #[error("Malformed document {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema/priority/type violations detected before any resources are consumed.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Descriptor rejected: {}", format_field_errors(.errors))]
    Rejected { errors: Vec<FieldError> },
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Agent registry misuse errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent {id} is already registered")]
    DuplicateAgent { id: String },

    #[error("Agent {id} is not registered")]
    UnknownAgent { id: String },

    #[error("Agent {id} still holds {in_flight} in-flight task(s); reassign or cancel first")]
    AgentBusy { id: String, in_flight: usize },

    #[error("Failed to persist registry: {0}")]
    Persist(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

/// No agent with free capacity/capability — the task remains queued.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    #[error("No active agent with capability '{capability}' has free capacity")]
    NoEligibleAgent { capability: String },

    #[error("Agent {id} is at its limit of {max} concurrent task(s)")]
    AgentFull { id: String, max: usize },

    #[error("Agent {id} is at its ceiling of {limit} task(s) of type '{task_type}'")]
    TypeCeilingReached {
        id: String,
        task_type: String,
        limit: usize,
    },
}

/// Approval gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Approval request {id} not found")]
    NotFound { id: Uuid },

    #[error("Approval request {id} expired before a decision was made")]
    Expired { id: Uuid },

    #[error("Approval watcher failed: {0}")]
    Watcher(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Execution-loop errors.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Task {task_id} reached the iteration limit ({limit})")]
    IterationLimitExceeded { task_id: String, limit: u32 },

    #[error("Task {task_id} reached the failure threshold ({threshold})")]
    FailureThresholdExceeded { task_id: String, threshold: u32 },

    #[error("Step {step} failed: {reason}")]
    StepExecution { step: String, reason: String },

    #[error("Step {step} timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    #[error("Cannot resume task {task_id}: {reason}")]
    ResumeFailed { task_id: String, reason: String },

    #[error("Illegal phase transition for task {task_id}: {reason}")]
    Phase { task_id: String, reason: String },

    #[error("State persistence failed for task {task_id}: {reason}")]
    StatePersist { task_id: String, reason: String },

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
