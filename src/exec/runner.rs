//! The per-task execution loop.
//!
//! Each loop is an independent tokio task bound to one admitted task and one
//! agent. Cross-loop coordination goes through the registry (capacity) and
//! the gateway (approvals); the loop itself only touches its own persisted
//! state record and its task document.
//!
//! Stop conditions are evaluated in a fixed order at every iteration
//! boundary: done signal, iteration limit, failure threshold, manual stop.
//! The manual stop is advisory, so an in-flight step finishes before the
//! loop honors it.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::approval::request::{self, ApprovalRequest};
use crate::approval::{ApprovalGateway, Resolution};
use crate::config::OrchestratorConfig;
use crate::error::LoopError;
use crate::exec::state::{ExecutionState, LoopPhase, StopReason};
use crate::exec::step::{Step, StepExecutor};
use crate::task::descriptor::Task;
use crate::vault::{Location, Vault};

/// Terminal summary of one loop run.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub phase: LoopPhase,
    pub stop_reason: Option<StopReason>,
    pub iterations: u32,
}

/// The autonomous control loop for one task.
pub struct ExecutionLoop {
    vault: Arc<Vault>,
    gateway: Arc<ApprovalGateway>,
    executor: Arc<dyn StepExecutor>,
    config: OrchestratorConfig,
    stop: watch::Receiver<bool>,
}

impl ExecutionLoop {
    pub fn new(
        vault: Arc<Vault>,
        gateway: Arc<ApprovalGateway>,
        executor: Arc<dyn StepExecutor>,
        config: OrchestratorConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            vault,
            gateway,
            executor,
            config,
            stop,
        }
    }

    /// Start a fresh loop for an assigned task.
    pub async fn start(
        &self,
        task: &Task,
        agent_id: &str,
        plan: Vec<Step>,
    ) -> Result<LoopOutcome, LoopError> {
        let mut state = ExecutionState::new(
            &task.id,
            agent_id,
            plan,
            self.config.max_iterations,
            self.config.failure_threshold,
        );
        self.transition(&mut state, LoopPhase::Running)?;
        tracing::info!(task = %task.id, agent = %agent_id, steps = state.plan.len(), "Starting execution loop");
        self.run(task, state).await
    }

    /// Resume an interrupted loop from its persisted state.
    ///
    /// Crash recovery: the iteration count and the failure streak carry over
    /// exactly as persisted, so the task gets no more attempts than it would
    /// have had uninterrupted. A loop parked in a terminal phase is refused;
    /// bringing it back takes [`resume_sanctioned`](Self::resume_sanctioned).
    pub async fn resume(&self, task_id: &str) -> Result<LoopOutcome, LoopError> {
        self.resume_inner(task_id, None, false).await
    }

    /// Resume a stopped or failed loop on explicit human instruction.
    ///
    /// Clears the stop reason and the failure streak, optionally raises the
    /// iteration limit, and relocates the parked document back under its
    /// agent.
    pub async fn resume_sanctioned(
        &self,
        task_id: &str,
        max_iterations_override: Option<u32>,
    ) -> Result<LoopOutcome, LoopError> {
        self.resume_inner(task_id, max_iterations_override, true).await
    }

    async fn resume_inner(
        &self,
        task_id: &str,
        max_iterations_override: Option<u32>,
        sanctioned: bool,
    ) -> Result<LoopOutcome, LoopError> {
        let state_path = self.vault.state_path(task_id);
        if !state_path.exists() {
            return Err(LoopError::ResumeFailed {
                task_id: task_id.to_string(),
                reason: "no persisted execution state".to_string(),
            });
        }
        let raw = self.vault.read_doc(&state_path).await?;
        let mut state: ExecutionState =
            serde_json::from_str(&raw).map_err(|e| LoopError::ResumeFailed {
                task_id: task_id.to_string(),
                reason: format!("corrupt execution state: {e}"),
            })?;

        if self.vault.is_done(task_id).await? {
            // Finished before the interruption; just archive the record.
            if state.phase != LoopPhase::Done {
                state.phase = LoopPhase::Done;
            }
            self.archive_state(&state).await?;
            return Ok(outcome(&state));
        }

        if state.phase.is_terminal() && !sanctioned {
            return Err(LoopError::ResumeFailed {
                task_id: task_id.to_string(),
                reason: format!(
                    "parked in terminal phase {}, awaiting a human decision",
                    state.phase
                ),
            });
        }

        let Some((location, path)) = self.vault.find_task(task_id).await? else {
            return Err(LoopError::ResumeFailed {
                task_id: task_id.to_string(),
                reason: "task document no longer exists".to_string(),
            });
        };
        if location == Location::Quarantine {
            return Err(LoopError::ResumeFailed {
                task_id: task_id.to_string(),
                reason: "task document is quarantined".to_string(),
            });
        }
        let content = self.vault.read_doc(&path).await?;
        let task = Task::from_document(&content).map_err(|reason| LoopError::ResumeFailed {
            task_id: task_id.to_string(),
            reason,
        })?;

        // A stopped or failed task was parked for intervention; bring its
        // document back under its agent.
        let workspace = Location::InProgress(state.agent_id.clone());
        if location != workspace {
            self.vault.relocate(&path, &workspace).await?;
        }

        if sanctioned {
            if let Some(max) = max_iterations_override {
                state.max_iterations = max;
            }
            // A human-sanctioned resume starts with a clean failure streak;
            // plain crash recovery keeps the persisted count untouched.
            state.stop_reason = None;
            state.consecutive_failures = 0;
        }
        if state.phase != LoopPhase::Running {
            self.transition(&mut state, LoopPhase::Running)?;
        }
        tracing::info!(
            task = %task_id,
            iteration = state.iteration,
            cursor = state.cursor,
            "Resuming execution loop"
        );
        self.run(&task, state).await
    }

    async fn run(&self, task: &Task, mut state: ExecutionState) -> Result<LoopOutcome, LoopError> {
        loop {
            self.persist(&state).await?;

            // Stop conditions, fixed order.
            if self.vault.is_done(&state.task_id).await? {
                self.transition(&mut state, LoopPhase::Done)?;
                self.archive_state(&state).await?;
                tracing::info!(task = %state.task_id, iterations = state.iteration, "Task done");
                return Ok(outcome(&state));
            }
            if state.iteration >= state.max_iterations {
                return self.halt_stopped(task, state, StopReason::IterationLimit).await;
            }
            if state.consecutive_failures >= state.failure_threshold {
                return self.halt_failed(task, state).await;
            }
            if *self.stop.borrow() {
                return self.halt_stopped(task, state, StopReason::Manual).await;
            }

            state.iteration += 1;
            let Some(step) = state.current_step().cloned() else {
                // Plan exhausted; wait for the executor's done signal.
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                continue;
            };

            if request::requires_gate(
                step.risk,
                task.task_type.as_deref(),
                &self.config.medium_risk_gated_types,
            ) {
                match self.gate(task, &mut state, &step).await? {
                    Resolution::Approved => {}
                    other => {
                        state.record_failed(&step, other.reason_code());
                        continue;
                    }
                }
            }

            self.execute_with_retry(task, &mut state, &step).await;
        }
    }

    /// Suspend on an approval request until the gateway delivers a resolution.
    async fn gate(
        &self,
        task: &Task,
        state: &mut ExecutionState,
        step: &Step,
    ) -> Result<Resolution, LoopError> {
        self.transition(state, LoopPhase::AwaitingApproval)?;
        self.persist(state).await?;
        let request = ApprovalRequest::new(
            &task.id,
            &step.id,
            step.risk,
            &step.description,
            self.config.approval_ttl,
        );
        let ticket = self
            .gateway
            .submit(request)
            .await
            .map_err(|e| LoopError::StepExecution {
                step: step.id.clone(),
                reason: format!("approval submission failed: {e}"),
            })?;
        // A dropped gateway counts as rejection; the loop must not hang.
        let resolution = ticket.resolved.await.unwrap_or(Resolution::Rejected);
        self.transition(state, LoopPhase::Running)?;
        Ok(resolution)
    }

    /// One iteration's worth of attempts at the current step.
    ///
    /// Every failed attempt feeds the consecutive-failure counter; only a
    /// success advances the cursor.
    async fn execute_with_retry(&self, task: &Task, state: &mut ExecutionState, step: &Step) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.config.step_timeout,
                self.executor.execute(task, step),
            )
            .await;
            match result {
                Ok(Ok(_output)) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(task = %task.id, step = %step.id, duration_ms, "Step completed");
                    state.record_completed(step, duration_ms);
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = %task.id, step = %step.id, "Step failed: {}", e);
                    state.record_failed(step, e.to_string());
                }
                Err(_) => {
                    let reason = format!("timed out after {:?}", self.config.step_timeout);
                    tracing::warn!(task = %task.id, step = %step.id, "Step {}", reason);
                    state.record_failed(step, reason);
                }
            }
            if attempts > self.config.step_retry_budget {
                return;
            }
        }
    }

    async fn halt_stopped(
        &self,
        task: &Task,
        mut state: ExecutionState,
        reason: StopReason,
    ) -> Result<LoopOutcome, LoopError> {
        state.stop_reason = Some(reason);
        self.transition(&mut state, LoopPhase::Stopped)?;
        self.persist(&state).await?;
        tracing::warn!(task = %state.task_id, %reason, "Loop stopped");
        self.park_for_intervention(task, &state).await?;
        Ok(outcome(&state))
    }

    async fn halt_failed(
        &self,
        task: &Task,
        mut state: ExecutionState,
    ) -> Result<LoopOutcome, LoopError> {
        self.transition(&mut state, LoopPhase::Failed)?;
        self.persist(&state).await?;
        tracing::error!(
            task = %state.task_id,
            failures = state.consecutive_failures,
            "Loop failed on failure threshold"
        );
        self.park_for_intervention(task, &state).await?;
        Ok(outcome(&state))
    }

    /// Leave a durable, readable record of what was attempted and what
    /// decision is needed, then park the task document for a human.
    async fn park_for_intervention(
        &self,
        task: &Task,
        state: &ExecutionState,
    ) -> Result<(), LoopError> {
        let report = render_report(state);
        let filename = format!("{}_intervention.md", state.task_id);
        self.vault
            .write_doc(&Location::NeedsIntervention, &filename, &report)
            .await?;
        if let Some((location, path)) = self.vault.find_task(&task.id).await? {
            if location != Location::NeedsIntervention {
                self.vault.relocate(&path, &Location::NeedsIntervention).await?;
            }
        } else {
            tracing::warn!(task = %task.id, "Task document missing while parking for intervention");
        }
        Ok(())
    }

    fn transition(&self, state: &mut ExecutionState, target: LoopPhase) -> Result<(), LoopError> {
        state.transition_to(target).map_err(|reason| LoopError::Phase {
            task_id: state.task_id.clone(),
            reason,
        })
    }

    async fn persist(&self, state: &ExecutionState) -> Result<(), LoopError> {
        let json = serde_json::to_string_pretty(state).map_err(|e| LoopError::StatePersist {
            task_id: state.task_id.clone(),
            reason: e.to_string(),
        })?;
        self.vault
            .write_atomic(&self.vault.state_path(&state.task_id), &json)
            .await?;
        Ok(())
    }

    async fn archive_state(&self, state: &ExecutionState) -> Result<(), LoopError> {
        let json = serde_json::to_string_pretty(state).map_err(|e| LoopError::StatePersist {
            task_id: state.task_id.clone(),
            reason: e.to_string(),
        })?;
        self.vault
            .write_atomic(&self.vault.archived_state_path(&state.task_id), &json)
            .await?;
        let live = self.vault.state_path(&state.task_id);
        if live.exists() {
            tokio::fs::remove_file(&live)
                .await
                .map_err(crate::error::VaultError::Io)?;
        }
        Ok(())
    }
}

fn outcome(state: &ExecutionState) -> LoopOutcome {
    LoopOutcome {
        phase: state.phase,
        stop_reason: state.stop_reason,
        iterations: state.iteration,
    }
}

/// Human-facing report for a stopped or failed loop.
///
/// The header deliberately has no `id` field, so location scans never
/// mistake the report for the task document parked beside it.
fn render_report(state: &ExecutionState) -> String {
    let heading = match state.phase {
        LoopPhase::Failed => "Escalation: Human Diagnosis Required",
        _ => "Intervention Required",
    };
    let reason = match (state.phase, state.stop_reason) {
        (LoopPhase::Failed, _) => "failure threshold reached".to_string(),
        (_, Some(r)) => r.to_string(),
        (_, None) => "unknown".to_string(),
    };
    let mut report = format!(
        "---\nreport_for: {task}\nagent: {agent}\nphase: {phase}\nreason: {reason}\n\
         iteration: {iter}\ncreated: {now}\n---\n# {heading}\n\n\
         Task `{task}` halted after {iter} iteration(s): {reason}.\n\n## Progress\n\n",
        task = state.task_id,
        agent = state.agent_id,
        phase = state.phase,
        iter = state.iteration,
        now = chrono::Utc::now().to_rfc3339(),
    );
    report.push_str(&format!(
        "Completed {} of {} planned step(s).\n\n",
        state.completed.len(),
        state.plan.len()
    ));
    for step in &state.completed {
        report.push_str(&format!("- [x] {} ({} ms)\n", step.description, step.duration_ms));
    }
    if let Some(current) = state.current_step() {
        report.push_str(&format!("- [ ] {} (current)\n", current.description));
    }
    if !state.failed.is_empty() {
        report.push_str("\n## Failures\n\n");
        for failure in &state.failed {
            report.push_str(&format!("- {}: {}\n", failure.step_id, failure.reason));
        }
    }
    report.push_str(
        "\n## Decision Needed\n\n\
         - Resume with adjusted limits, or\n\
         - Accept partial completion and archive, or\n\
         - Cancel the task.\n",
    );
    report
}
