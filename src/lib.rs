//! Vault Orchestrator — filesystem-backed task lifecycle engine.
//!
//! Task descriptors dropped into a vault's intake folder are validated,
//! assigned to registered agents with spare capacity, and driven through a
//! per-task execution loop. Risky steps pause for human approval, expressed
//! by relocating the request document between vault folders.

pub mod approval;
pub mod config;
pub mod error;
pub mod exec;
pub mod orchestrator;
pub mod registry;
pub mod task;
pub mod vault;

pub use config::{OrchestratorConfig, ValidatorConfig};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
