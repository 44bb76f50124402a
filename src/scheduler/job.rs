use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::pool::RunnerClass;
use crate::scheduler::changeset::ChangeSet;

/// Scheduling tier of a change, strict priority Hot > Warm > Cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Preempted,
    Expired,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Expired | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Preempted => write!(f, "preempted"),
            JobState::Expired => write!(f, "expired"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A build job: one ChangeSet scheduled at a tier with a hard deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub change: ChangeSet,
    pub tier: Tier,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub retries: u32,
    pub assigned_runner: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    /// Set once the job has waited past its SLA; stays true after promotion.
    pub sla_violated: bool,
}

impl Job {
    pub fn new(change: ChangeSet, tier: Tier, sla: Duration) -> Self {
        let now = Utc::now();
        let sla = ChronoDuration::from_std(sla).unwrap_or_else(|_| ChronoDuration::seconds(120));
        Self {
            id: Uuid::new_v4(),
            change,
            tier,
            state: JobState::Queued,
            submitted_at: now,
            deadline: now + sla,
            retries: 0,
            assigned_runner: None,
            started_at: None,
            completed_at: None,
            artifact_ref: None,
            error: None,
            sla_violated: false,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.change.project_id
    }

    pub fn required_class(&self) -> RunnerClass {
        self.change.platform.required_class()
    }

    pub fn queued_for(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.submitted_at
    }

    pub fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Wall-clock latency from submission to completion (or to now).
    pub fn elapsed(&self, now: DateTime<Utc>) -> ChronoDuration {
        self.completed_at.unwrap_or(now) - self.submitted_at
    }
}
