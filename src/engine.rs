//! The orchestration engine: wires the classifier, queue, runner pool,
//! cache, executor, publisher, and SLA monitor together and drives them
//! from two loops (scheduling and pool maintenance).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ModuleCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{BuildExecutor, Toolchain};
use crate::persist::StateStore;
use crate::pool::{ReleaseOutcome, RunnerClass, RunnerPool, RunnerState};
use crate::publisher::{Artifact, ArtifactStore};
use crate::scheduler::{classify, BuildQueue, ChangeSet, Job, JobState, Tier};
use crate::sla::{ScaleSignal, SlaMonitor};

/// Why a running build's token was cancelled. Decides what happens to the
/// job afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Preempted,
    User,
    Shutdown,
}

/// Caller-facing job status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    pub tier: Tier,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    pub sla_violated: bool,
    pub elapsed_ms: i64,
    pub retries: u32,
}

pub struct Engine {
    cfg: EngineConfig,
    queue: Arc<RwLock<BuildQueue>>,
    pool: Arc<RunnerPool>,
    cache: Arc<ModuleCache>,
    artifacts: Arc<ArtifactStore>,
    monitor: Arc<RwLock<SlaMonitor>>,
    state: Arc<StateStore>,
    executor: Arc<BuildExecutor>,
    cancel_reasons: Arc<RwLock<HashMap<Uuid, CancelReason>>>,
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub async fn new(
        cfg: EngineConfig,
        toolchain: Arc<dyn Toolchain>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(ModuleCache::open(&cfg.cache).await?);
        let artifacts = Arc::new(ArtifactStore::open(cfg.state_dir.join("artifacts")).await?);
        let state = Arc::new(StateStore::open(&cfg.state_dir).await?);
        let queue = Arc::new(RwLock::new(BuildQueue::new(&cfg.queue, cfg.sla.clone())));
        let pool = Arc::new(RunnerPool::new(cfg.pool.clone()));
        let monitor = Arc::new(RwLock::new(SlaMonitor::new(cfg.sla.clone())));
        let executor = Arc::new(BuildExecutor::new(toolchain, Arc::clone(&cache)));

        Ok(Arc::new(Self {
            cfg,
            queue,
            pool,
            cache,
            artifacts,
            monitor,
            state,
            executor,
            cancel_reasons: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }))
    }

    /// Reload persisted state after a restart. Jobs that were in flight when
    /// the process died are re-queued at WARM priority regardless of their
    /// original tier: correctness of their prior progress cannot be assumed.
    /// Runner metadata seeds warm-pool reconstruction.
    pub async fn recover(&self) -> Result<()> {
        let jobs = self.state.load_jobs().await?;
        let runners = self.state.load_runners().await?;

        let mut queue = self.queue.write().await;
        let mut requeued = 0usize;
        for mut job in jobs {
            match job.state {
                JobState::Assigned | JobState::Running | JobState::Preempted => {
                    job.state = JobState::Queued;
                    job.tier = Tier::Warm;
                    job.assigned_runner = None;
                    job.started_at = None;
                    requeued += 1;
                    queue.restore(job);
                }
                _ => queue.restore(job),
            }
        }
        drop(queue);

        let mut per_class: HashMap<RunnerClass, usize> = HashMap::new();
        for runner in runners.iter().filter(|r| r.is_live()) {
            *per_class.entry(runner.class).or_insert(0) += 1;
        }
        for (class, n) in per_class {
            self.pool.prewarm(class, n.min(self.cfg.pool.ceiling)).await;
        }

        tracing::info!(requeued, runners = runners.len(), "Engine state recovered");
        Ok(())
    }

    /// Spawn the scheduling and maintenance loops.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.scheduler_loop().await;
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.maintenance_loop().await;
        });
    }

    /// Accept a change set: classify it, wrap it in a job, and enqueue.
    /// Returns immediately; callers poll `job_status`.
    pub async fn submit(&self, change: ChangeSet) -> Result<Uuid> {
        let tier = classify(&change);
        let sla = self.cfg.sla.target(tier);
        let job = Job::new(change, tier, sla);
        let job_id = job.id;
        let class = job.required_class();

        self.queue.write().await.enqueue(job)?;
        tracing::info!(job_id = %job_id, tier = %tier, class = %class, "Change set submitted");

        if tier == Tier::Hot {
            self.maybe_preempt(class).await;
        }
        Ok(job_id)
    }

    /// Reclaim a runner from a Cold build when a Hot job is waiting and no
    /// compatible runner is idle.
    async fn maybe_preempt(&self, class: RunnerClass) {
        if self.pool.count(class, RunnerState::Idle).await > 0 {
            return;
        }
        if !self.queue.read().await.needs_preemption(class) {
            return;
        }
        if let Some(victim) = self.pool.preempt_cold(class).await {
            // Record the reason before the token fires so the victim's task
            // re-queues instead of treating this as a user cancel.
            self.cancel_reasons
                .write()
                .await
                .insert(victim.job_id, CancelReason::Preempted);
            tracing::info!(
                runner_id = %victim.runner_id,
                job_id = %victim.job_id,
                class = %class,
                "Preempting cold build for hot job"
            );
            victim.cancel.cancel();
        }
    }

    /// Current status of a job, live or archived.
    pub async fn job_status(&self, id: Uuid) -> Result<JobStatus> {
        let queue = self.queue.read().await;
        let job = queue.job(&id).ok_or(EngineError::JobNotFound(id))?;
        Ok(JobStatus {
            id: job.id,
            state: job.state,
            tier: job.tier,
            artifact_ref: job.artifact_ref.clone(),
            error: job.error.clone(),
            sla_violated: job.sla_violated,
            elapsed_ms: job.elapsed(Utc::now()).num_milliseconds(),
            retries: job.retries,
        })
    }

    pub async fn all_jobs(&self) -> Vec<JobStatus> {
        let now = Utc::now();
        let queue = self.queue.read().await;
        queue
            .all_jobs()
            .into_iter()
            .map(|job| JobStatus {
                id: job.id,
                state: job.state,
                tier: job.tier,
                artifact_ref: job.artifact_ref.clone(),
                error: job.error.clone(),
                sla_violated: job.sla_violated,
                elapsed_ms: job.elapsed(now).num_milliseconds(),
                retries: job.retries,
            })
            .collect()
    }

    /// Cancel a job. Queued jobs are removed outright; running jobs are
    /// cancelled cooperatively and their runner released as Discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let prior = self.queue.write().await.cancel(&id)?;
        if matches!(prior, JobState::Assigned | JobState::Running) {
            self.cancel_reasons
                .write()
                .await
                .insert(id, CancelReason::User);
            if let Some(token) = self.tokens.read().await.get(&id) {
                token.cancel();
            }
        }
        Ok(())
    }

    pub async fn get_artifact(&self, artifact_ref: &str) -> Result<Artifact> {
        self.artifacts.get(artifact_ref).await
    }

    pub async fn sla_percentile(&self, tier: Tier, p: f64) -> Option<std::time::Duration> {
        self.monitor.read().await.percentile(tier, p)
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<RunnerPool> {
        &self.pool
    }

    /// Main scheduling loop: expire overdue queued jobs, probe for
    /// preemption, and dispatch queued work up to available capacity.
    async fn scheduler_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.cfg.tick);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Scheduler loop stopping");
                    break;
                }
                _ = tick.tick() => {}
            }

            let _expired = self.queue.write().await.expire_overdue();

            for class in RunnerClass::ALL {
                self.maybe_preempt(class).await;

                // Dispatch at most idle-capacity + one waiter, so a freed
                // runner always goes to the highest-priority job dequeued.
                let idle = self.pool.count(class, RunnerState::Idle).await;
                let waiting = self.pool.waiting(class).await;
                let budget = (idle + 1).saturating_sub(waiting);
                for _ in 0..budget {
                    let job = { self.queue.write().await.dequeue(class) };
                    match job {
                        Some(job) => {
                            // Register the token before handing off so a
                            // cancel landing right after dispatch can still
                            // reach the build.
                            let token = CancellationToken::new();
                            self.tokens.write().await.insert(job.id, token.clone());
                            let engine = Arc::clone(&self);
                            tokio::spawn(async move {
                                engine.run_job(job, token).await;
                            });
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Run one job end to end: lease, execute, publish, release. The token
    /// is registered by the scheduler loop before the job is handed off.
    async fn run_job(self: Arc<Self>, job: Job, token: CancellationToken) {
        let job_id = job.id;
        let class = job.required_class();

        let runner = match self
            .pool
            .lease(
                class,
                Some(job.project_id()),
                job.deadline,
                job_id,
                job.project_id(),
                job.tier,
                token.clone(),
            )
            .await
        {
            Ok(runner) => runner,
            Err(EngineError::LeaseTimeout(_)) => {
                let now = Utc::now();
                self.queue.write().await.finish(
                    &job_id,
                    JobState::Expired,
                    None,
                    Some(format!(
                        "deadline exceeded after {}ms waiting for a {} runner",
                        job.elapsed(now).num_milliseconds(),
                        class
                    )),
                );
                self.tokens.write().await.remove(&job_id);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Lease failed");
                self.queue.write().await.finish(
                    &job_id,
                    JobState::Failed,
                    None,
                    Some(e.to_string()),
                );
                self.tokens.write().await.remove(&job_id);
                return;
            }
        };

        self.queue.write().await.mark_running(&job_id, runner.id);

        let remaining = (job.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let result = tokio::select! {
            res = self.executor.execute(&job, &runner, &token) => res,
            _ = tokio::time::sleep(remaining) => Err(EngineError::Timeout {
                tier: job.tier.to_string(),
                elapsed_ms: job.elapsed(Utc::now()).num_milliseconds(),
            }),
            _ = self.shutdown.cancelled() => Err(EngineError::Cancelled),
        };

        match result {
            Ok(report) => {
                // An accepted cancel that raced the token registration wins
                // over the finished build.
                let user_cancelled = matches!(
                    self.cancel_reasons.write().await.remove(&job_id),
                    Some(CancelReason::User)
                );
                if user_cancelled {
                    self.queue.write().await.finish(
                        &job_id,
                        JobState::Cancelled,
                        None,
                        Some("cancelled by owner".to_string()),
                    );
                    let _ = self.pool.release(runner.id, ReleaseOutcome::Discarded).await;
                    self.tokens.write().await.remove(&job_id);
                    return;
                }
                // Publish before the runner goes back to the pool.
                match self
                    .artifacts
                    .publish(&report.bundle, job_id, job.change.platform)
                    .await
                {
                    Ok(artifact_ref) => {
                        let latency = job.elapsed(Utc::now());
                        self.queue.write().await.finish(
                            &job_id,
                            JobState::Succeeded,
                            Some(artifact_ref),
                            None,
                        );
                        if let Ok(latency) = latency.to_std() {
                            self.monitor
                                .write()
                                .await
                                .observe(job.tier, class, latency);
                        }
                        let _ = self.pool.release(runner.id, ReleaseOutcome::Success).await;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Artifact publish failed");
                        self.queue.write().await.finish(
                            &job_id,
                            JobState::Failed,
                            None,
                            Some(e.to_string()),
                        );
                        let _ = self.pool.release(runner.id, ReleaseOutcome::Failure).await;
                    }
                }
            }
            Err(EngineError::Cancelled) => {
                let reason = self
                    .cancel_reasons
                    .write()
                    .await
                    .remove(&job_id)
                    .unwrap_or(CancelReason::Shutdown);
                let _ = self.pool.release(runner.id, ReleaseOutcome::Discarded).await;
                match reason {
                    CancelReason::Preempted => {
                        let mut queue = self.queue.write().await;
                        if let Some(mut inflight) = queue.take_inflight(&job_id) {
                            inflight.state = JobState::Preempted;
                            if inflight.retries >= self.cfg.queue.max_preemption_retries {
                                queue.archive_job(
                                    inflight,
                                    JobState::Failed,
                                    Some("preemption retry bound exceeded".to_string()),
                                );
                            } else {
                                queue.requeue_preempted(inflight);
                            }
                        }
                    }
                    CancelReason::User => {
                        self.queue.write().await.finish(
                            &job_id,
                            JobState::Cancelled,
                            None,
                            Some("cancelled by owner".to_string()),
                        );
                    }
                    CancelReason::Shutdown => {
                        // Left in Running state; recovery re-queues it at Warm.
                    }
                }
            }
            Err(EngineError::Timeout { tier, elapsed_ms }) => {
                token.cancel();
                let _ = self.pool.release(runner.id, ReleaseOutcome::Discarded).await;
                self.queue.write().await.finish(
                    &job_id,
                    JobState::Expired,
                    None,
                    Some(format!("deadline exceeded after {elapsed_ms}ms (tier {tier})")),
                );
            }
            Err(EngineError::BuildFailed { unit, message }) => {
                // Deterministic source failure: surface, never auto-retry.
                let _ = self.pool.release(runner.id, ReleaseOutcome::Failure).await;
                self.queue.write().await.finish(
                    &job_id,
                    JobState::Failed,
                    None,
                    Some(format!("{unit}: {message}")),
                );
            }
            Err(e) => {
                // Transient infrastructure failure: bounded retry.
                let _ = self.pool.release(runner.id, ReleaseOutcome::Failure).await;
                let mut queue = self.queue.write().await;
                if let Some(mut inflight) = queue.take_inflight(&job_id) {
                    if inflight.retries < self.cfg.max_infra_retries {
                        inflight.retries += 1;
                        inflight.state = JobState::Queued;
                        inflight.assigned_runner = None;
                        tracing::warn!(job_id = %job_id, error = %e, retry = inflight.retries, "Infra failure, re-queueing");
                        queue.restore(inflight);
                    } else {
                        let attempts = inflight.retries;
                        queue.archive_job(
                            inflight,
                            JobState::Failed,
                            Some(
                                EngineError::InfraFailure {
                                    attempts,
                                    message: e.to_string(),
                                }
                                .to_string(),
                            ),
                        );
                    }
                }
            }
        }

        self.tokens.write().await.remove(&job_id);
        self.cancel_reasons.write().await.remove(&job_id);
    }

    /// Pool maintenance and SLA feedback on a slower cadence, plus state
    /// snapshots for crash recovery.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.cfg.tick * 4);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.snapshot().await;
                    tracing::info!("Maintenance loop stopping");
                    break;
                }
                _ = tick.tick() => {}
            }

            let depths: HashMap<RunnerClass, usize> = {
                let queue = self.queue.read().await;
                RunnerClass::ALL
                    .into_iter()
                    .map(|c| (c, queue.queued_depth(c)))
                    .collect()
            };
            self.pool
                .maintain(|class| depths.get(&class).copied().unwrap_or(0))
                .await;

            let mut utilization = HashMap::new();
            for class in RunnerClass::ALL {
                if let Some(util) = self.pool.utilization(class).await {
                    utilization.insert(class, util);
                }
            }
            let signals = {
                let mut monitor = self.monitor.write().await;
                monitor.scale_signals(&utilization, Utc::now())
            };
            for signal in signals {
                match signal {
                    ScaleSignal::Up(class) => {
                        let floor = self.pool.warm_floor(class).await;
                        self.pool.set_warm_floor(class, floor + 1).await;
                    }
                    ScaleSignal::Down(class) => {
                        let floor = self.pool.warm_floor(class).await;
                        let base = self.cfg.pool.warm_floor;
                        self.pool
                            .set_warm_floor(class, floor.saturating_sub(1).max(base))
                            .await;
                    }
                }
            }

            self.snapshot().await;
        }
    }

    async fn snapshot(&self) {
        let jobs: Vec<Job> = {
            let queue = self.queue.read().await;
            queue.all_jobs().into_iter().cloned().collect()
        };
        if let Err(e) = self.state.save_jobs(&jobs).await {
            tracing::warn!(error = %e, "Job snapshot failed");
        }
        let runners = self.pool.runners().await;
        if let Err(e) = self.state.save_runners(&runners).await {
            tracing::warn!(error = %e, "Runner snapshot failed");
        }
    }
}
