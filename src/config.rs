//! Configuration types.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root directory of the vault.
    pub vault_path: PathBuf,
    /// Maximum loop iterations per task before a forced stop.
    pub max_iterations: u32,
    /// Consecutive step failures before the loop fails the task.
    pub failure_threshold: u32,
    /// Additional attempts for a failing step within one iteration.
    pub step_retry_budget: u32,
    /// Per-step execution timeout.
    pub step_timeout: Duration,
    /// How long an approval request stays open before it expires.
    pub approval_ttl: Duration,
    /// Fallback poll interval covering missed filesystem-event delivery.
    pub approval_poll_interval: Duration,
    /// How often the orchestrator scans the intake location.
    pub intake_scan_interval: Duration,
    /// Heartbeats older than this mark an agent unresponsive.
    pub heartbeat_timeout: Duration,
    /// Task types whose medium-risk steps require approval.
    pub medium_risk_gated_types: HashSet<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vault_path: PathBuf::from("."),
            max_iterations: 10,
            failure_threshold: 3,
            step_retry_budget: 1,
            step_timeout: Duration::from_secs(120),
            approval_ttl: Duration::from_secs(24 * 3600), // 1 day
            approval_poll_interval: Duration::from_secs(5),
            intake_scan_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(300), // 5 minutes
            medium_risk_gated_types: HashSet::new(),
        }
    }
}

/// Task validator configuration.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Frontmatter fields that must be present and non-null.
    pub required_fields: Vec<String>,
    /// Known task types; empty means no membership check.
    pub known_types: HashSet<String>,
    /// When false and `known_types` is non-empty, unknown types are rejected.
    pub allow_unregistered_types: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            required_fields: vec!["id".to_string()],
            known_types: HashSet::new(),
            allow_unregistered_types: true,
        }
    }
}
