// Executor loop - polls the job store, claims due jobs and executes them
pub mod executor_loop;
pub mod reconcile;

pub use executor_loop::{CycleReport, ExecutorLoop, ExecutorLoopConfig, JobOutcome};
pub use reconcile::ReconcileConfig;
