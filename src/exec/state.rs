//! Loop phase machine and the persisted execution record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::step::Step;

/// Phase of a task's execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Loop not yet started, or freshly rehydrated from disk.
    Idle,
    /// Executing steps.
    Running,
    /// Suspended on a pending approval request.
    AwaitingApproval,
    /// Terminal success; the task document reached the done location.
    Done,
    /// Terminal on iteration limit or manual stop; human may resume.
    Stopped,
    /// Terminal on failure threshold; needs human diagnosis.
    Failed,
}

impl LoopPhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: LoopPhase) -> bool {
        use LoopPhase::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Running) |
            // From Running
            (Running, AwaitingApproval) | (Running, Done) |
            (Running, Stopped) | (Running, Failed) |
            // From AwaitingApproval (resolution feeds back into the loop)
            (AwaitingApproval, Running) |
            // Human-sanctioned resumption after intervention
            (Stopped, Running) | (Failed, Running)
        )
    }

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Done => "done",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a loop stopped without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationLimit,
    Manual,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IterationLimit => write!(f, "iteration limit"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A successfully executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub description: String,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// A failed step attempt, kept for the intervention record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_id: String,
    pub description: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// The persisted continuation of one task's loop.
///
/// Rewritten atomically on every iteration, so a crash between iterations
/// loses at most one iteration's partial progress. Resumption picks up from
/// `cursor`, never from step zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    pub agent_id: String,
    pub phase: LoopPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub failure_threshold: u32,
    /// Index of the current step in `plan`.
    pub cursor: usize,
    pub plan: Vec<Step>,
    pub completed: Vec<CompletedStep>,
    pub failed: Vec<FailedStep>,
    pub consecutive_failures: u32,
    pub stop_reason: Option<StopReason>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        plan: Vec<Step>,
        max_iterations: u32,
        failure_threshold: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            phase: LoopPhase::Idle,
            iteration: 0,
            max_iterations,
            failure_threshold,
            cursor: 0,
            plan,
            completed: Vec::new(),
            failed: Vec::new(),
            consecutive_failures: 0,
            stop_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Transition to a new phase, enforcing the machine.
    pub fn transition_to(&mut self, target: LoopPhase) -> Result<(), String> {
        if !self.phase.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.phase, target
            ));
        }
        self.phase = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The step the loop is currently on, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.plan.get(self.cursor)
    }

    /// Record a successful step, reset the failure streak, advance.
    pub fn record_completed(&mut self, step: &Step, duration_ms: u64) {
        self.completed.push(CompletedStep {
            step_id: step.id.clone(),
            description: step.description.clone(),
            duration_ms,
            finished_at: Utc::now(),
        });
        self.consecutive_failures = 0;
        self.cursor += 1;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt. The cursor stays on the step.
    pub fn record_failed(&mut self, step: &Step, reason: impl Into<String>) {
        self.failed.push(FailedStep {
            step_id: step.id.clone(),
            description: step.description.clone(),
            reason: reason.into(),
            failed_at: Utc::now(),
        });
        self.consecutive_failures += 1;
        self.updated_at = Utc::now();
    }
}
