pub mod manager;
pub mod runner;

pub use manager::{Preemption, ReleaseOutcome, RunnerPool};
pub use runner::{Runner, RunnerClass, RunnerState};
