//! Top-level wiring: intake, admission, assignment, and loop supervision.
//!
//! The orchestrator owns the periodic intake scan and the lifecycle of one
//! execution loop per active task. Loops never share mutable state with each
//! other; assignment contention is resolved inside the registry's
//! check-then-reserve section, and approvals inside the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::approval::ApprovalGateway;
use crate::config::{OrchestratorConfig, ValidatorConfig};
use crate::error::{Error, Result};
use crate::exec::runner::ExecutionLoop;
use crate::exec::state::{ExecutionState, LoopPhase};
use crate::exec::step::{Planner, StepExecutor};
use crate::registry::{Agent, AgentRegistry, AgentStatus};
use crate::task::descriptor::Task;
use crate::task::validator::{FieldError, TaskValidator};
use crate::vault::{Location, Vault};

struct LoopHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// The orchestration engine.
pub struct Orchestrator {
    vault: Arc<Vault>,
    registry: Arc<AgentRegistry>,
    gateway: Arc<ApprovalGateway>,
    validator: TaskValidator,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn StepExecutor>,
    config: OrchestratorConfig,
    loops: Mutex<HashMap<String, LoopHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub async fn new(
        config: OrchestratorConfig,
        validator_config: ValidatorConfig,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Arc<Self>> {
        let vault = Arc::new(Vault::new(config.vault_path.clone()));
        vault.ensure_dirs().await.map_err(Error::Vault)?;
        let registry = Arc::new(AgentRegistry::load(Arc::clone(&vault)).await?);
        let gateway = Arc::new(ApprovalGateway::new(Arc::clone(&vault)));
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            vault,
            registry,
            gateway,
            validator: TaskValidator::new(validator_config),
            planner,
            executor,
            config,
            loops: Mutex::new(HashMap::new()),
            shutdown,
        }))
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<ApprovalGateway> {
        &self.gateway
    }

    /// Run until shutdown: approval watcher, heartbeat sweep, recovery, then
    /// the periodic intake scan.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let watcher = Arc::clone(&self.gateway).spawn(self.config.approval_poll_interval);
        let sweeper = self.spawn_heartbeat_sweep();

        self.recover().await?;

        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.intake_scan_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_intake().await {
                        tracing::error!("Intake scan failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Shutting down orchestrator");
        watcher.abort();
        sweeper.abort();
        for (task_id, handle) in self.loops.lock().await.drain() {
            let _ = handle.stop.send(true);
            tracing::info!(task = %task_id, "Stop signalled to in-flight loop");
            handle.join.abort();
        }
        Ok(())
    }

    /// Request a graceful shutdown of `run`.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal a manual stop to one task's loop. Advisory: the loop honors it
    /// at its next iteration boundary.
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let loops = self.loops.lock().await;
        match loops.get(task_id) {
            Some(handle) => handle.stop.send(true).is_ok(),
            None => false,
        }
    }

    /// One pass over the intake location. Returns how many tasks were
    /// admitted and assigned; tasks without an eligible agent stay queued.
    pub async fn scan_intake(self: &Arc<Self>) -> Result<usize> {
        let mut assigned = 0;
        for path in self.vault.list_docs(&Location::Inbox).await? {
            if self.admit(&path).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Validate one intake document and try to assign it.
    async fn admit(self: &Arc<Self>, path: &std::path::Path) -> Result<bool> {
        let content = match self.vault.read_doc(path).await {
            Ok(c) => c,
            Err(_) => return Ok(false), // raced with a relocation
        };

        let report = self.validator.validate(&content);
        if !report.is_valid {
            self.quarantine(path, &report.errors).await?;
            return Ok(false);
        }
        let task = match Task::from_document(&content) {
            Ok(t) => t,
            Err(reason) => {
                self.quarantine(path, &[FieldError::other(reason)]).await?;
                return Ok(false);
            }
        };

        if self.loops.lock().await.contains_key(&task.id) {
            return Ok(false);
        }

        for agent in self.candidates(&task).await? {
            match self
                .registry
                .reserve(&agent.id, path, task.task_type.as_deref())
                .await
            {
                Ok(_) => {
                    tracing::info!(task = %task.id, agent = %agent.id, "Task assigned");
                    self.spawn_loop(task, agent.id).await;
                    return Ok(true);
                }
                Err(Error::Capacity(e)) => {
                    tracing::debug!(task = %task.id, agent = %agent.id, "Candidate full: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(task = %task.id, "No eligible agent, task deferred");
        Ok(false)
    }

    /// Eligible agents for a task: active, capability match, least loaded
    /// first with the id as a deterministic tiebreak.
    async fn candidates(&self, task: &Task) -> Result<Vec<Agent>> {
        let pool = match task.capability.as_deref() {
            Some(tag) => self.registry.find_by_capability(tag).await,
            None => self.registry.list_active().await,
        };
        let mut ranked = Vec::new();
        for agent in pool {
            if agent.status != AgentStatus::Active {
                continue;
            }
            let workload = self.registry.current_workload(&agent.id).await?;
            ranked.push((workload, agent));
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(ranked.into_iter().map(|(_, agent)| agent).collect())
    }

    /// Park an invalid descriptor with a field-level error report.
    async fn quarantine(&self, path: &std::path::Path, errors: &[FieldError]) -> Result<()> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("descriptor")
            .to_string();
        let mut report = format!(
            "---\nreport_for: {stem}\ncreated: {}\n---\n# Rejected at Admission\n\n\
             The descriptor `{stem}.md` was rejected before any resources were consumed.\n\n\
             ## Errors\n\n",
            chrono::Utc::now().to_rfc3339(),
        );
        for error in errors {
            report.push_str(&format!("- `{}`: {}\n", error.field, error.message));
        }
        report.push_str("\nFix the header and drop the document back into the Inbox.\n");
        self.vault
            .write_doc(&Location::Quarantine, &format!("{stem}_errors.md"), &report)
            .await?;
        let dest = self.vault.relocate(path, &Location::Quarantine).await?;
        tracing::warn!(doc = %dest.display(), errors = errors.len(), "Descriptor quarantined");
        Ok(())
    }

    /// Spawn the execution loop for a freshly assigned task.
    async fn spawn_loop(self: &Arc<Self>, task: Task, agent_id: String) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task_id = task.id.clone();
        // Hold the table lock across spawn + insert so the loop's own removal
        // cannot run before its handle is registered.
        let mut loops = self.loops.lock().await;
        let join = tokio::spawn(async move {
            let exec_loop = ExecutionLoop::new(
                Arc::clone(&this.vault),
                Arc::clone(&this.gateway),
                Arc::clone(&this.executor),
                this.config.clone(),
                stop_rx,
            );
            let plan = this.planner.plan(&task).await;
            match exec_loop.start(&task, &agent_id, plan).await {
                Ok(outcome) => {
                    tracing::info!(
                        task = %task.id,
                        phase = %outcome.phase,
                        iterations = outcome.iterations,
                        "Loop finished"
                    );
                }
                Err(e) => {
                    tracing::error!(task = %task.id, "Loop aborted: {}", e);
                }
            }
            this.loops.lock().await.remove(&task.id);
        });
        loops.insert(task_id, LoopHandle { stop: stop_tx, join });
    }

    /// Rehydrate loops for interrupted execution state records on disk.
    ///
    /// Records in a terminal phase are left alone: a stopped or failed task
    /// sits in `Needs_Intervention` until a human calls
    /// [`resume_task`](Self::resume_task). Recovery never un-parks it.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        for task_id in self.vault.state_records().await? {
            if self.loops.lock().await.contains_key(&task_id) {
                continue;
            }
            let raw = match self.vault.read_doc(&self.vault.state_path(&task_id)).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::error!(task = %task_id, "Unreadable state record: {}", e);
                    continue;
                }
            };
            let state: ExecutionState = match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(task = %task_id, "Corrupt state record: {}", e);
                    continue;
                }
            };
            if matches!(state.phase, LoopPhase::Stopped | LoopPhase::Failed) {
                tracing::info!(
                    task = %task_id,
                    phase = %state.phase,
                    "Parked record awaits a human decision, not recovering"
                );
                continue;
            }
            tracing::info!(task = %task_id, "Recovering in-flight loop");
            self.spawn_resume(task_id, None, false).await;
        }
        Ok(())
    }

    /// Resume a task parked in `Needs_Intervention`, on explicit operator
    /// instruction. Optionally raises the iteration limit. Returns false if
    /// the task has no live state record or its loop is already running.
    pub async fn resume_task(
        self: &Arc<Self>,
        task_id: &str,
        max_iterations_override: Option<u32>,
    ) -> Result<bool> {
        if !self.vault.state_path(task_id).exists() {
            return Ok(false);
        }
        if self.loops.lock().await.contains_key(task_id) {
            return Ok(false);
        }
        tracing::info!(task = %task_id, "Operator resumed parked task");
        self.spawn_resume(task_id.to_string(), max_iterations_override, true)
            .await;
        Ok(true)
    }

    async fn spawn_resume(
        self: &Arc<Self>,
        task_id: String,
        max_iterations_override: Option<u32>,
        sanctioned: bool,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let id = task_id.clone();
        // Hold the table lock across spawn + insert so the loop's own removal
        // cannot run before its handle is registered.
        let mut loops = self.loops.lock().await;
        let join = tokio::spawn(async move {
            let exec_loop = ExecutionLoop::new(
                Arc::clone(&this.vault),
                Arc::clone(&this.gateway),
                Arc::clone(&this.executor),
                this.config.clone(),
                stop_rx,
            );
            let result = if sanctioned {
                exec_loop.resume_sanctioned(&id, max_iterations_override).await
            } else {
                exec_loop.resume(&id).await
            };
            match result {
                Ok(outcome) => {
                    tracing::info!(task = %id, phase = %outcome.phase, "Resumed loop finished");
                }
                Err(e) => {
                    tracing::error!(task = %id, "Resume failed: {}", e);
                }
            }
            this.loops.lock().await.remove(&id);
        });
        loops.insert(task_id, LoopHandle { stop: stop_tx, join });
    }

    fn spawn_heartbeat_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let timeout = self.config.heartbeat_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout);
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                if let Err(e) = registry.mark_stale_unresponsive(timeout).await {
                    tracing::warn!("Heartbeat sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::RiskLevel;
    use crate::exec::step::{Step, StepError, StepOutput};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    struct SingleStepPlanner;

    #[async_trait]
    impl Planner for SingleStepPlanner {
        async fn plan(&self, _task: &Task) -> Vec<Step> {
            vec![Step::new("step_1", "do the work", RiskLevel::Low)]
        }
    }

    /// Waits for a permit, then relocates the task document to done.
    struct GatedExecutor {
        vault: Arc<Vault>,
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl StepExecutor for GatedExecutor {
        async fn execute(&self, task: &Task, _step: &Step) -> std::result::Result<StepOutput, StepError> {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| StepError::new(e.to_string()))?;
            let (_, path) = self.vault.find_task(&task.id).await.unwrap().unwrap();
            self.vault.relocate(&path, &Location::Done).await.unwrap();
            Ok(StepOutput::default())
        }
    }

    async fn orchestrator_with(
        permits: Arc<Semaphore>,
        step_timeout: Duration,
        failure_threshold: u32,
    ) -> (Arc<Orchestrator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            vault_path: dir.path().to_path_buf(),
            step_timeout,
            failure_threshold,
            ..OrchestratorConfig::default()
        };
        let vault = Arc::new(Vault::new(dir.path().to_path_buf()));
        vault.ensure_dirs().await.unwrap();
        let executor = Arc::new(GatedExecutor {
            vault,
            permits,
        });
        let orchestrator = Orchestrator::new(
            config,
            ValidatorConfig::default(),
            Arc::new(SingleStepPlanner),
            executor,
        )
        .await
        .unwrap();
        (orchestrator, dir)
    }

    async fn seed_inbox(vault: &Vault, id: &str, capability: &str) {
        let doc = format!(
            "---\nid: {id}\npriority: medium\ncapability: {capability}\n---\nwork\n"
        );
        vault
            .write_doc(&Location::Inbox, &format!("{id}.md"), &doc)
            .await
            .unwrap();
    }

    async fn wait_for<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn invalid_descriptor_is_quarantined_with_report() {
        let permits = Arc::new(Semaphore::new(0));
        let (orchestrator, _dir) = orchestrator_with(permits, Duration::from_secs(5), 3).await;
        let vault = Arc::clone(orchestrator.vault());
        vault
            .write_doc(&Location::Inbox, "bad.md", "---\npriority: urgent\n---\nno id\n")
            .await
            .unwrap();

        let assigned = orchestrator.scan_intake().await.unwrap();
        assert_eq!(assigned, 0);
        assert!(vault.list_docs(&Location::Inbox).await.unwrap().is_empty());
        let quarantined = vault.list_docs(&Location::Quarantine).await.unwrap();
        assert_eq!(quarantined.len(), 2); // descriptor + error report
        let report = vault
            .read_doc(&vault.dir(&Location::Quarantine).join("bad_errors.md"))
            .await
            .unwrap();
        assert!(report.contains("`id`"));
        assert!(report.contains("`priority`"));
    }

    #[tokio::test]
    async fn task_without_eligible_agent_stays_queued() {
        let permits = Arc::new(Semaphore::new(0));
        let (orchestrator, _dir) = orchestrator_with(permits, Duration::from_secs(5), 3).await;
        let vault = Arc::clone(orchestrator.vault());
        seed_inbox(&vault, "t1", "email").await;

        let assigned = orchestrator.scan_intake().await.unwrap();
        assert_eq!(assigned, 0);
        assert_eq!(vault.list_docs(&Location::Inbox).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_task_deferred_until_first_reaches_terminal_state() {
        let permits = Arc::new(Semaphore::new(0));
        let (orchestrator, _dir) =
            orchestrator_with(Arc::clone(&permits), Duration::from_secs(5), 3).await;
        let vault = Arc::clone(orchestrator.vault());
        orchestrator
            .registry()
            .register(Agent::new("a1", ["email".to_string()], 1))
            .await
            .unwrap();
        seed_inbox(&vault, "t1", "email").await;
        seed_inbox(&vault, "t2", "email").await;

        let assigned = orchestrator.scan_intake().await.unwrap();
        assert_eq!(assigned, 1);
        // The second task is deferred, not lost.
        assert_eq!(vault.list_docs(&Location::Inbox).await.unwrap().len(), 1);
        assert_eq!(orchestrator.registry().current_workload("a1").await.unwrap(), 1);

        // Let the first loop finish, then rescan.
        permits.add_permits(1);
        let v = Arc::clone(&vault);
        wait_for(|| {
            let v = Arc::clone(&v);
            async move { v.is_done("t1").await.unwrap() }
        })
        .await;
        let orch = Arc::clone(&orchestrator);
        wait_for(|| {
            let orch = Arc::clone(&orch);
            async move { orch.loops.lock().await.is_empty() }
        })
        .await;

        permits.add_permits(1);
        let assigned = orchestrator.scan_intake().await.unwrap();
        assert_eq!(assigned, 1);
        let v = Arc::clone(&vault);
        wait_for(|| {
            let v = Arc::clone(&v);
            async move { v.is_done("t2").await.unwrap() }
        })
        .await;
    }

    #[tokio::test]
    async fn stop_task_signals_running_loop() {
        let permits = Arc::new(Semaphore::new(0));
        // A short step timeout so the blocked step fails fast, and a high
        // failure threshold so the manual stop is what ends the loop.
        let (orchestrator, _dir) =
            orchestrator_with(Arc::clone(&permits), Duration::from_millis(50), 100).await;
        let vault = Arc::clone(orchestrator.vault());
        orchestrator
            .registry()
            .register(Agent::new("a1", ["email".to_string()], 1))
            .await
            .unwrap();
        seed_inbox(&vault, "t1", "email").await;
        orchestrator.scan_intake().await.unwrap();

        assert!(orchestrator.stop_task("t1").await);
        let orch = Arc::clone(&orchestrator);
        wait_for(|| {
            let orch = Arc::clone(&orch);
            async move { orch.loops.lock().await.is_empty() }
        })
        .await;
        // Manual stop parks the task for a human decision.
        let (location, _) = vault.find_task("t1").await.unwrap().unwrap();
        assert_eq!(location, Location::NeedsIntervention);
        assert!(!orchestrator.stop_task("t1").await);
    }

    /// Seed a task that failed its threshold and was parked, as `halt_failed`
    /// leaves it: document in the intervention folder, live state record on
    /// disk.
    async fn park_failed_task(vault: &Vault, id: &str, agent: &str) {
        vault.provision_agent_workspace(agent).await.unwrap();
        let doc = format!("---\nid: {id}\npriority: medium\ncapability: email\n---\nwork\n");
        vault
            .write_doc(&Location::NeedsIntervention, &format!("{id}.md"), &doc)
            .await
            .unwrap();
        let steps = vec![Step::new("step_1", "do the work", RiskLevel::Low)];
        let mut state = ExecutionState::new(id, agent, steps, 10, 3);
        state.transition_to(LoopPhase::Running).unwrap();
        state.consecutive_failures = 3;
        state.transition_to(LoopPhase::Failed).unwrap();
        let json = serde_json::to_string_pretty(&state).unwrap();
        vault
            .write_atomic(&vault.state_path(id), &json)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recovery_leaves_parked_records_alone() {
        let permits = Arc::new(Semaphore::new(100));
        let (orchestrator, _dir) = orchestrator_with(permits, Duration::from_secs(5), 3).await;
        let vault = Arc::clone(orchestrator.vault());
        park_failed_task(&vault, "t1", "a1").await;

        orchestrator.recover().await.unwrap();
        assert!(orchestrator.loops.lock().await.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still parked: not retried, not archived.
        let (location, _) = vault.find_task("t1").await.unwrap().unwrap();
        assert_eq!(location, Location::NeedsIntervention);
        assert!(vault.state_path("t1").exists());
    }

    #[tokio::test]
    async fn resume_task_unparks_on_operator_instruction() {
        let permits = Arc::new(Semaphore::new(100));
        let (orchestrator, _dir) = orchestrator_with(permits, Duration::from_secs(5), 3).await;
        let vault = Arc::clone(orchestrator.vault());
        park_failed_task(&vault, "t1", "a1").await;

        assert!(orchestrator.resume_task("t1", Some(20)).await.unwrap());
        let v = Arc::clone(&vault);
        wait_for(|| {
            let v = Arc::clone(&v);
            async move { v.is_done("t1").await.unwrap() }
        })
        .await;
        // The record was archived with the loop's completion.
        let orch = Arc::clone(&orchestrator);
        wait_for(|| {
            let orch = Arc::clone(&orch);
            async move { orch.loops.lock().await.is_empty() }
        })
        .await;
        assert!(!orchestrator.resume_task("t1", None).await.unwrap());
    }
}
