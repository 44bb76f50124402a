use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job queue at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Job {job_id} cannot be cancelled from state {state}")]
    NotCancellable { job_id: Uuid, state: String },

    #[error("Compilation failed in unit {unit}: {message}")]
    BuildFailed { unit: String, message: String },

    #[error("Deadline exceeded after {elapsed_ms}ms (tier {tier})")]
    Timeout { tier: String, elapsed_ms: i64 },

    #[error("Infrastructure failure after {attempts} attempts: {message}")]
    InfraFailure { attempts: u32, message: String },

    #[error("No runner of class {0} available before deadline")]
    LeaseTimeout(String),

    #[error("Runner not found: {0}")]
    RunnerNotFound(Uuid),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
