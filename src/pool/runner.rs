use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Capability class of a runner. Class A is the heavyweight macOS-class
/// host; class B is the containerized Linux-class unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerClass {
    MacOs,
    Linux,
}

impl RunnerClass {
    pub const ALL: [RunnerClass; 2] = [RunnerClass::MacOs, RunnerClass::Linux];
}

impl std::fmt::Display for RunnerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerClass::MacOs => write!(f, "macos"),
            RunnerClass::Linux => write!(f, "linux"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Warming,
    Idle,
    Leased,
    Draining,
    Retired,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Warming => write!(f, "warming"),
            RunnerState::Idle => write!(f, "idle"),
            RunnerState::Leased => write!(f, "leased"),
            RunnerState::Draining => write!(f, "draining"),
            RunnerState::Retired => write!(f, "retired"),
        }
    }
}

/// An ephemeral compute unit. Lifecycle state is mutated only by the pool;
/// age is bounded by a hard maximum lifetime checked on every release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: Uuid,
    pub class: RunnerClass,
    pub state: RunnerState,
    /// Project of the last build this runner served; its local daemon state
    /// is still warm for that project.
    pub affinity: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub builds_served: u32,
}

impl Runner {
    pub fn new(class: RunnerClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            class,
            state: RunnerState::Warming,
            affinity: None,
            created_at: Utc::now(),
            consecutive_failures: 0,
            builds_served: 0,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.created_at
    }

    pub fn past_lifetime(&self, now: DateTime<Utc>, max_lifetime: Duration) -> bool {
        self.age(now)
            > ChronoDuration::from_std(max_lifetime).unwrap_or_else(|_| ChronoDuration::hours(1))
    }

    pub fn warmed_up(&self, now: DateTime<Utc>, warmup: Duration) -> bool {
        self.age(now) >= ChronoDuration::from_std(warmup).unwrap_or_else(|_| ChronoDuration::zero())
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, RunnerState::Retired)
    }
}
