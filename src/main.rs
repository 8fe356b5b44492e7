use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vault_orchestrator::exec::step::{HeuristicPlanner, Step, StepError, StepExecutor, StepOutput};
use vault_orchestrator::exec::ExecutionState;
use vault_orchestrator::task::descriptor::Task;
use vault_orchestrator::vault::{Location, Vault};
use vault_orchestrator::{Orchestrator, OrchestratorConfig, ValidatorConfig};

/// Stand-in collaborator: logs each step and relocates the task document to
/// the done folder after the plan's final step. A real deployment plugs an
/// agent or tool runner in behind `StepExecutor` instead.
struct SimulatedExecutor {
    vault: Arc<Vault>,
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, step: &Step) -> Result<StepOutput, StepError> {
        tracing::info!(task = %task.id, step = %step.id, "{}", step.description);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The persisted record tells us whether this is the plan's last step.
        let state_path = self.vault.state_path(&task.id);
        let raw = self
            .vault
            .read_doc(&state_path)
            .await
            .map_err(|e| StepError::new(e.to_string()))?;
        let state: ExecutionState =
            serde_json::from_str(&raw).map_err(|e| StepError::new(e.to_string()))?;
        if state.cursor + 1 >= state.plan.len() {
            let Some((_, path)) = self
                .vault
                .find_task(&task.id)
                .await
                .map_err(|e| StepError::new(e.to_string()))?
            else {
                return Err(StepError::new("task document disappeared"));
            };
            self.vault
                .relocate(&path, &Location::Done)
                .await
                .map_err(|e| StepError::new(e.to_string()))?;
        }
        Ok(StepOutput {
            summary: Some(step.description.clone()),
        })
    }
}

fn env_duration(name: &str, default_secs: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default_secs))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let vault_path =
        std::env::var("VAULT_PATH").unwrap_or_else(|_| "./vault".to_string());

    let defaults = OrchestratorConfig::default();
    let config = OrchestratorConfig {
        vault_path: vault_path.clone().into(),
        max_iterations: std::env::var("VAULT_MAX_ITERATIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_iterations),
        failure_threshold: std::env::var("VAULT_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.failure_threshold),
        approval_ttl: env_duration("VAULT_APPROVAL_TTL_SECS", 24 * 3600),
        intake_scan_interval: env_duration("VAULT_SCAN_INTERVAL_SECS", 10),
        ..defaults
    };

    eprintln!("Vault Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Vault: {}", vault_path);
    eprintln!("   Drop task documents into {}/Inbox", vault_path);
    eprintln!("   Approve requests by moving them from Pending_Approval to Approved\n");

    let vault = Arc::new(Vault::new(config.vault_path.clone()));
    let executor = Arc::new(SimulatedExecutor {
        vault: Arc::clone(&vault),
    });
    let orchestrator = Orchestrator::new(
        config,
        ValidatorConfig::default(),
        Arc::new(HeuristicPlanner),
        executor,
    )
    .await?;

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(orchestrator.run())
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    orchestrator.shutdown();
    runner.await??;
    Ok(())
}
