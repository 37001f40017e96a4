pub mod executor;
pub mod pool;
pub mod runner;

pub use executor::{StepExecutor, StepOutput, StepRequest};
pub use pool::{WorkResult, WorkerPool};
pub use runner::{next_step, AdvanceOutcome, StepRunner};

// Re-export crossbeam_channel for callers driving the pool
pub use crossbeam_channel;
