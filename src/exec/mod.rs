//! Per-task execution: the loop state machine, step planning, and the runner.

pub mod runner;
pub mod state;
pub mod step;

pub use runner::{ExecutionLoop, LoopOutcome};
pub use state::{ExecutionState, LoopPhase, StopReason};
pub use step::{HeuristicPlanner, Planner, Step, StepError, StepExecutor, StepOutput};
