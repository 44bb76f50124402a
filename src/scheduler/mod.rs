pub mod changeset;
pub mod classifier;
pub mod job;
pub mod queue;

pub use changeset::{ChangeKind, ChangeSet, SourceUnit, TargetPlatform, UnitRole};
pub use classifier::classify;
pub use job::{Job, JobState, Tier};
pub use queue::BuildQueue;
