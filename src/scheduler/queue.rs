use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::config::{QueueConfig, SlaConfig};
use crate::error::{EngineError, Result};
use crate::pool::RunnerClass;
use crate::scheduler::job::{Job, JobState, Tier};

/// Three SLA-tiered FIFO lanes feeding the runner pool.
///
/// Pick order is strict Hot > Warm > Cold, FIFO within a lane, with one
/// exception: a Cold job waiting past `starvation_multiplier x` its SLA is
/// considered at the Warm level for pick order only. Its deadline and SLA
/// target never change.
#[derive(Debug)]
pub struct BuildQueue {
    jobs: HashMap<Uuid, Job>,
    archive: HashMap<Uuid, Job>,
    hot: VecDeque<Uuid>,
    warm: VecDeque<Uuid>,
    cold: VecDeque<Uuid>,
    max_jobs: usize,
    starvation_multiplier: f64,
    sla: SlaConfig,
}

impl BuildQueue {
    pub fn new(cfg: &QueueConfig, sla: SlaConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            archive: HashMap::new(),
            hot: VecDeque::new(),
            warm: VecDeque::new(),
            cold: VecDeque::new(),
            max_jobs: cfg.max_jobs,
            starvation_multiplier: cfg.starvation_multiplier,
            sla,
        }
    }

    fn lane_mut(&mut self, tier: Tier) -> &mut VecDeque<Uuid> {
        match tier {
            Tier::Hot => &mut self.hot,
            Tier::Warm => &mut self.warm,
            Tier::Cold => &mut self.cold,
        }
    }

    /// Accept a job or reject immediately at hard capacity. Never blocks.
    pub fn enqueue(&mut self, job: Job) -> Result<()> {
        if self.jobs.len() >= self.max_jobs {
            return Err(EngineError::QueueFull(self.max_jobs));
        }
        let id = job.id;
        let tier = job.tier;
        self.jobs.insert(id, job);
        self.lane_mut(tier).push_back(id);
        tracing::debug!(job_id = %id, tier = %tier, "Job enqueued");
        Ok(())
    }

    /// Re-enqueue a preempted job at its original tier, retry count bumped.
    pub fn requeue_preempted(&mut self, mut job: Job) {
        job.state = JobState::Queued;
        job.retries += 1;
        job.assigned_runner = None;
        let id = job.id;
        let tier = job.tier;
        self.jobs.insert(id, job);
        self.lane_mut(tier).push_back(id);
        tracing::info!(job_id = %id, tier = %tier, "Preempted job re-enqueued");
    }

    fn sla_for(&self, tier: Tier) -> ChronoDuration {
        ChronoDuration::from_std(self.sla.target(tier)).unwrap_or_else(|_| ChronoDuration::seconds(120))
    }

    fn find_in_lane(
        &self,
        tier: Tier,
        class: RunnerClass,
        starving_only: bool,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let jobs = &self.jobs;
        let matches = |id: &Uuid| {
            let job = &jobs[id];
            job.required_class() == class
                && (!starving_only || {
                    let budget = self.sla.target(job.tier).as_millis() as f64;
                    let waited = job.queued_for(now).num_milliseconds() as f64;
                    waited > budget * self.starvation_multiplier
                })
        };
        match tier {
            Tier::Hot => self.hot.iter().position(matches),
            Tier::Warm => self.warm.iter().position(matches),
            Tier::Cold => self.cold.iter().position(matches),
        }
    }

    fn take_from_lane(
        &mut self,
        tier: Tier,
        class: RunnerClass,
        starving_only: bool,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let pos = self.find_in_lane(tier, class, starving_only, now)?;
        self.lane_mut(tier).remove(pos)
    }

    /// The Warm pick level: Warm-lane jobs compete with Cold jobs starving
    /// past the promotion threshold, earliest submission first.
    fn take_warm_level(&mut self, class: RunnerClass, now: DateTime<Utc>) -> Option<Uuid> {
        let warm = self.find_in_lane(Tier::Warm, class, false, now);
        let cold = self.find_in_lane(Tier::Cold, class, true, now);
        match (warm, cold) {
            (Some(w), Some(c)) => {
                let warm_at = self.jobs[&self.warm[w]].submitted_at;
                let cold_at = self.jobs[&self.cold[c]].submitted_at;
                if cold_at < warm_at {
                    self.cold.remove(c)
                } else {
                    self.warm.remove(w)
                }
            }
            (Some(w), None) => self.warm.remove(w),
            (None, Some(c)) => self.cold.remove(c),
            (None, None) => None,
        }
    }

    /// Pick the next job a runner of `class` should serve, or None.
    ///
    /// The picked job transitions to Assigned; it stays in the job table for
    /// status queries until it reaches a terminal state.
    pub fn dequeue(&mut self, class: RunnerClass) -> Option<Job> {
        let now = Utc::now();

        // Flag SLA violations before picking so promotion never clears them.
        let sla_hot = self.sla_for(Tier::Hot);
        let sla_warm = self.sla_for(Tier::Warm);
        let sla_cold = self.sla_for(Tier::Cold);
        for job in self.jobs.values_mut() {
            if job.state == JobState::Queued && !job.sla_violated {
                let budget = match job.tier {
                    Tier::Hot => sla_hot,
                    Tier::Warm => sla_warm,
                    Tier::Cold => sla_cold,
                };
                if job.queued_for(now) > budget {
                    job.sla_violated = true;
                }
            }
        }

        let picked = self
            .take_from_lane(Tier::Hot, class, false, now)
            // Anti-starvation: Cold jobs past the threshold compete with the
            // Warm lane on submission order.
            .or_else(|| self.take_warm_level(class, now))
            .or_else(|| self.take_from_lane(Tier::Cold, class, false, now))?;

        let job = self.jobs.get_mut(&picked)?;
        job.state = JobState::Assigned;
        tracing::debug!(job_id = %picked, tier = %job.tier, class = %class, "Job dequeued");
        Some(job.clone())
    }

    /// Transition Queued jobs past their deadline to Expired and archive them.
    /// Expired jobs are surfaced as timeouts, never silently retried.
    pub fn expire_overdue(&mut self) -> Vec<Job> {
        let now = Utc::now();
        let overdue: Vec<Uuid> = self
            .hot
            .iter()
            .chain(&self.warm)
            .chain(&self.cold)
            .filter(|id| {
                self.jobs
                    .get(id)
                    .map(|j| j.past_deadline(now))
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            self.hot.retain(|j| *j != id);
            self.warm.retain(|j| *j != id);
            self.cold.retain(|j| *j != id);
            if let Some(mut job) = self.jobs.remove(&id) {
                job.state = JobState::Expired;
                job.sla_violated = true;
                job.completed_at = Some(now);
                job.error = Some(format!(
                    "deadline exceeded after {}ms while queued",
                    job.elapsed(now).num_milliseconds()
                ));
                tracing::warn!(job_id = %id, tier = %job.tier, "Queued job expired");
                self.archive.insert(id, job.clone());
                expired.push(job);
            }
        }
        expired
    }

    /// True when a Hot job is waiting for a runner of `class`; the engine
    /// uses this to decide whether to reclaim a runner from a Cold build.
    pub fn needs_preemption(&self, class: RunnerClass) -> bool {
        self.hot
            .iter()
            .any(|id| self.jobs.get(id).map(|j| j.required_class() == class).unwrap_or(false))
    }

    /// Cancel a job. Queued jobs are removed outright; Assigned/Running jobs
    /// are returned as-is so the caller can cancel the build cooperatively.
    pub fn cancel(&mut self, id: &Uuid) -> Result<JobState> {
        let state = self
            .jobs
            .get(id)
            .map(|j| j.state)
            .or_else(|| self.archive.get(id).map(|j| j.state))
            .ok_or(EngineError::JobNotFound(*id))?;

        match state {
            JobState::Queued => {
                self.hot.retain(|j| j != id);
                self.warm.retain(|j| j != id);
                self.cold.retain(|j| j != id);
                if let Some(mut job) = self.jobs.remove(id) {
                    job.state = JobState::Cancelled;
                    job.completed_at = Some(Utc::now());
                    self.archive.insert(*id, job);
                }
                tracing::info!(job_id = %id, "Queued job cancelled");
                Ok(JobState::Queued)
            }
            JobState::Assigned | JobState::Running => Ok(state),
            _ => Err(EngineError::NotCancellable {
                job_id: *id,
                state: state.to_string(),
            }),
        }
    }

    /// Mark an assigned job as running on a runner.
    pub fn mark_running(&mut self, id: &Uuid, runner_id: Uuid) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.state = JobState::Running;
            job.assigned_runner = Some(runner_id);
            job.started_at = Some(Utc::now());
        }
    }

    /// Move a job to a terminal state and archive it.
    pub fn finish(&mut self, id: &Uuid, state: JobState, artifact_ref: Option<String>, error: Option<String>) {
        debug_assert!(state.is_terminal() || state == JobState::Preempted);
        if let Some(mut job) = self.jobs.remove(id) {
            job.state = state;
            job.completed_at = Some(Utc::now());
            job.artifact_ref = artifact_ref;
            job.error = error;
            self.archive.insert(*id, job);
        }
    }

    /// Take an in-flight job out of the table (for preemption re-enqueue).
    pub fn take_inflight(&mut self, id: &Uuid) -> Option<Job> {
        self.jobs.remove(id)
    }

    /// Archive a job already taken out of the table.
    pub fn archive_job(&mut self, mut job: Job, state: JobState, error: Option<String>) {
        job.state = state;
        job.completed_at = Some(Utc::now());
        job.error = error;
        self.archive.insert(job.id, job);
    }

    /// Reinsert a job loaded from a snapshot: terminal jobs go to the
    /// archive, queued jobs back onto their lane.
    pub fn restore(&mut self, job: Job) {
        if job.state.is_terminal() {
            self.archive.insert(job.id, job);
        } else {
            let id = job.id;
            let tier = job.tier;
            self.jobs.insert(id, job);
            self.lane_mut(tier).push_back(id);
        }
    }

    pub fn job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id).or_else(|| self.archive.get(id))
    }

    pub fn all_jobs(&self) -> Vec<&Job> {
        self.jobs.values().chain(self.archive.values()).collect()
    }

    /// Queued jobs waiting for runners of `class`.
    pub fn queued_depth(&self, class: RunnerClass) -> usize {
        self.hot
            .iter()
            .chain(&self.warm)
            .chain(&self.cold)
            .filter(|id| {
                self.jobs
                    .get(id)
                    .map(|j| j.required_class() == class)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop archived jobs, keeping the most recent ones for status queries.
    pub fn cleanup_archive(&mut self, keep: usize) -> usize {
        if self.archive.len() <= keep {
            return 0;
        }
        let mut by_age: Vec<(Uuid, DateTime<Utc>)> = self
            .archive
            .values()
            .map(|j| (j.id, j.completed_at.unwrap_or(j.submitted_at)))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let excess = by_age.len() - keep;
        let removed: Vec<Uuid> = by_age.into_iter().take(excess).map(|(id, _)| id).collect();
        for id in &removed {
            self.archive.remove(id);
        }
        removed.len()
    }
}
