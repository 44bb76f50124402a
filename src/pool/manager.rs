use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{EngineError, Result};
use crate::pool::runner::{Runner, RunnerClass, RunnerState};
use crate::scheduler::job::Tier;

/// Outcome reported when a lease is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    /// Build was cancelled or preempted; does not count against the
    /// runner's failure streak.
    Discarded,
}

/// A chosen preemption victim: the engine fires `cancel` after recording
/// why, so the build task can tell preemption apart from a user cancel.
#[derive(Debug, Clone)]
pub struct Preemption {
    pub runner_id: Uuid,
    pub job_id: Uuid,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct LeaseInfo {
    job_id: Uuid,
    project_id: Uuid,
    tier: Tier,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PoolInner {
    runners: HashMap<Uuid, Runner>,
    leases: HashMap<Uuid, LeaseInfo>,
    /// Runners flagged for retirement on next release.
    pending_drain: Vec<Uuid>,
    /// Callers currently blocked in `lease`, per class. Bounds how many
    /// runners a lease attempt may spawn while waiting.
    waiters: HashMap<RunnerClass, usize>,
    /// Per-class warm floor, adjustable by SLA scale signals.
    warm_floor: HashMap<RunnerClass, usize>,
    /// When the idle count first exceeded the floor, per class.
    idle_excess_since: HashMap<RunnerClass, DateTime<Utc>>,
}

/// Owns every runner lifecycle transition. No other component may move a
/// runner between states; preemption, draining, and retirement are all
/// routed through `lease`/`release`/`drain`/`maintain`.
pub struct RunnerPool {
    cfg: PoolConfig,
    inner: Mutex<PoolInner>,
    freed: Notify,
}

impl RunnerPool {
    pub fn new(cfg: PoolConfig) -> Self {
        let mut warm_floor = HashMap::new();
        for class in RunnerClass::ALL {
            warm_floor.insert(class, cfg.warm_floor);
        }
        Self {
            cfg,
            inner: Mutex::new(PoolInner {
                warm_floor,
                ..PoolInner::default()
            }),
            freed: Notify::new(),
        }
    }

    /// Spawn `n` runners of `class` immediately, e.g. for warm-pool
    /// reconstruction at startup. They still pass through WARMING.
    pub async fn prewarm(&self, class: RunnerClass, n: usize) {
        let mut inner = self.inner.lock().await;
        for _ in 0..n {
            let runner = Runner::new(class);
            tracing::info!(runner_id = %runner.id, class = %class, "Runner spawned (prewarm)");
            inner.runners.insert(runner.id, runner);
        }
    }

    fn promote_warmed(&self, inner: &mut PoolInner, now: DateTime<Utc>) {
        for runner in inner.runners.values_mut() {
            if runner.state == RunnerState::Warming && runner.warmed_up(now, self.cfg.warmup) {
                runner.state = RunnerState::Idle;
                tracing::debug!(runner_id = %runner.id, class = %runner.class, "Runner warmed up");
                self.freed.notify_waiters();
            }
        }
    }

    fn live_count(inner: &PoolInner, class: RunnerClass) -> usize {
        inner
            .runners
            .values()
            .filter(|r| r.class == class && r.is_live())
            .count()
    }

    fn idle_count(inner: &PoolInner, class: RunnerClass) -> usize {
        inner
            .runners
            .values()
            .filter(|r| r.class == class && r.state == RunnerState::Idle)
            .count()
    }

    /// One attempt to grab an idle runner. Affinity first, then any idle of
    /// the class; spawns a warming runner when under the ceiling.
    fn try_lease(
        &self,
        inner: &mut PoolInner,
        class: RunnerClass,
        affinity_hint: Option<Uuid>,
        lease: &LeaseInfo,
        now: DateTime<Utc>,
    ) -> Option<Runner> {
        self.promote_warmed(inner, now);

        let pick = |inner: &PoolInner, want_affinity: bool| {
            inner
                .runners
                .values()
                .filter(|r| r.class == class && r.state == RunnerState::Idle)
                .find(|r| !want_affinity || (affinity_hint.is_some() && r.affinity == affinity_hint))
                .map(|r| r.id)
        };

        let picked = pick(inner, true).or_else(|| pick(inner, false));

        if let Some(id) = picked {
            let runner = inner.runners.get_mut(&id)?;
            runner.state = RunnerState::Leased;
            inner.leases.insert(id, lease.clone());
            tracing::debug!(
                runner_id = %id,
                job_id = %lease.job_id,
                affine = runner.affinity == affinity_hint && affinity_hint.is_some(),
                "Runner leased"
            );
            return inner.runners.get(&id).cloned();
        }

        // Nothing idle: spawn toward the ceiling so a later attempt can win,
        // at most one warming runner per blocked caller.
        let warming = inner
            .runners
            .values()
            .filter(|r| r.class == class && r.state == RunnerState::Warming)
            .count();
        let waiters = *inner.waiters.get(&class).unwrap_or(&0);
        if warming < waiters.max(1) && Self::live_count(inner, class) < self.cfg.ceiling {
            let runner = Runner::new(class);
            tracing::info!(runner_id = %runner.id, class = %class, "Runner spawned");
            inner.runners.insert(runner.id, runner);
        }
        None
    }

    /// Lease a runner of `class`, preferring project affinity. Blocks until
    /// a runner frees or `deadline` passes.
    pub async fn lease(
        &self,
        class: RunnerClass,
        affinity_hint: Option<Uuid>,
        deadline: DateTime<Utc>,
        job_id: Uuid,
        project_id: Uuid,
        tier: Tier,
        cancel: CancellationToken,
    ) -> Result<Runner> {
        let info = LeaseInfo {
            job_id,
            project_id,
            tier,
            cancel,
        };

        {
            let mut inner = self.inner.lock().await;
            *inner.waiters.entry(class).or_insert(0) += 1;
        }
        let result = self.lease_wait(class, affinity_hint, deadline, info).await;
        {
            let mut inner = self.inner.lock().await;
            if let Some(n) = inner.waiters.get_mut(&class) {
                *n = n.saturating_sub(1);
            }
        }
        result
    }

    async fn lease_wait(
        &self,
        class: RunnerClass,
        affinity_hint: Option<Uuid>,
        deadline: DateTime<Utc>,
        info: LeaseInfo,
    ) -> Result<Runner> {
        loop {
            let now = Utc::now();
            if now > deadline {
                return Err(EngineError::LeaseTimeout(class.to_string()));
            }

            {
                let mut inner = self.inner.lock().await;
                if let Some(runner) = self.try_lease(&mut inner, class, affinity_hint, &info, now) {
                    return Ok(runner);
                }
            }

            // Warming runners become idle on a clock, not a notify, so poll
            // with a short bound rather than waiting on `freed` alone.
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                self.freed.notified(),
            )
            .await;
        }
    }

    /// Return a leased runner, recording the build outcome. Retirement is
    /// decided here: lifetime exceeded, failure streak hit, or drain pending.
    pub async fn release(&self, runner_id: Uuid, outcome: ReleaseOutcome) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let lease = inner.leases.remove(&runner_id);
        let max_streak = self.cfg.max_failure_streak;
        let max_lifetime = self.cfg.max_runner_lifetime;
        let drain_pending = inner.pending_drain.contains(&runner_id);

        let runner = inner
            .runners
            .get_mut(&runner_id)
            .ok_or(EngineError::RunnerNotFound(runner_id))?;

        runner.builds_served += 1;
        match outcome {
            ReleaseOutcome::Success => runner.consecutive_failures = 0,
            ReleaseOutcome::Failure => runner.consecutive_failures += 1,
            ReleaseOutcome::Discarded => {}
        }
        if let Some(lease) = lease {
            runner.affinity = Some(lease.project_id);
        }

        let retire_reason = if drain_pending {
            Some("drain")
        } else if runner.past_lifetime(now, max_lifetime) {
            Some("max lifetime")
        } else if runner.consecutive_failures >= max_streak {
            Some("failure streak")
        } else {
            None
        };

        if let Some(reason) = retire_reason {
            runner.state = RunnerState::Retired;
            tracing::info!(runner_id = %runner_id, reason, "Runner retired");
        } else {
            runner.state = RunnerState::Idle;
        }
        inner.pending_drain.retain(|id| *id != runner_id);
        drop(inner);
        self.freed.notify_waiters();
        Ok(())
    }

    /// Drain a runner: idle runners retire through DRAINING immediately,
    /// leased runners finish their current build first.
    pub async fn drain(&self, runner_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let runner = inner
            .runners
            .get_mut(&runner_id)
            .ok_or(EngineError::RunnerNotFound(runner_id))?;
        match runner.state {
            RunnerState::Idle | RunnerState::Warming => {
                runner.state = RunnerState::Draining;
                tracing::info!(runner_id = %runner_id, "Idle runner draining");
            }
            RunnerState::Leased => {
                inner.pending_drain.push(runner_id);
                tracing::info!(runner_id = %runner_id, "Leased runner will drain on release");
            }
            RunnerState::Draining | RunnerState::Retired => {}
        }
        Ok(())
    }

    /// Pick a runner currently executing a COLD build as a preemption
    /// victim. The caller decides whether to fire the cancellation; the
    /// runner itself stays Leased until its build task releases it.
    pub async fn preempt_cold(&self, class: RunnerClass) -> Option<Preemption> {
        let inner = self.inner.lock().await;
        inner
            .leases
            .iter()
            .find(|(runner_id, lease)| {
                lease.tier == Tier::Cold
                    && inner
                        .runners
                        .get(runner_id)
                        .map(|r| r.class == class)
                        .unwrap_or(false)
            })
            .map(|(runner_id, lease)| Preemption {
                runner_id: *runner_id,
                job_id: lease.job_id,
                cancel: lease.cancel.clone(),
            })
    }

    /// Pool maintenance, driven from the engine loop on a fixed tick:
    /// promote warmed runners, top up the warm floor where demand exists,
    /// and drain sustained idle excess.
    pub async fn maintain(&self, queued_depth: impl Fn(RunnerClass) -> usize) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        self.promote_warmed(&mut inner, now);

        // Draining runners hold no lease and retire on the next tick.
        for runner in inner.runners.values_mut() {
            if runner.state == RunnerState::Draining {
                runner.state = RunnerState::Retired;
                tracing::info!(runner_id = %runner.id, "Drained runner retired");
            }
        }

        for class in RunnerClass::ALL {
            let floor = *inner.warm_floor.get(&class).unwrap_or(&self.cfg.warm_floor);
            let idle = Self::idle_count(&inner, class);
            let warming = inner
                .runners
                .values()
                .filter(|r| r.class == class && r.state == RunnerState::Warming)
                .count();

            // Spawn toward the floor only when work is actually queued.
            if idle + warming < floor && queued_depth(class) > 0 {
                let deficit = floor - (idle + warming);
                let headroom = self.cfg.ceiling.saturating_sub(Self::live_count(&inner, class));
                for _ in 0..deficit.min(headroom) {
                    let runner = Runner::new(class);
                    tracing::info!(runner_id = %runner.id, class = %class, "Runner spawned (warm floor)");
                    inner.runners.insert(runner.id, runner);
                }
            }

            // Sustained idle excess drains one runner per tick, oldest first.
            if idle > floor {
                let since = *inner.idle_excess_since.entry(class).or_insert(now);
                if now - since
                    >= chrono::Duration::from_std(self.cfg.drain_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60))
                {
                    let oldest = inner
                        .runners
                        .values()
                        .filter(|r| r.class == class && r.state == RunnerState::Idle)
                        .min_by_key(|r| r.created_at)
                        .map(|r| r.id);
                    if let Some(id) = oldest {
                        if let Some(runner) = inner.runners.get_mut(&id) {
                            runner.state = RunnerState::Draining;
                            tracing::info!(runner_id = %id, class = %class, "Idle excess draining");
                        }
                    }
                }
            } else {
                inner.idle_excess_since.remove(&class);
            }
        }
    }

    /// Adjust the warm floor for a class (SLA monitor scale signal),
    /// clamped to the ceiling.
    pub async fn set_warm_floor(&self, class: RunnerClass, floor: usize) {
        let mut inner = self.inner.lock().await;
        let clamped = floor.min(self.cfg.ceiling);
        tracing::info!(class = %class, floor = clamped, "Warm floor adjusted");
        inner.warm_floor.insert(class, clamped);
    }

    pub async fn warm_floor(&self, class: RunnerClass) -> usize {
        let inner = self.inner.lock().await;
        *inner.warm_floor.get(&class).unwrap_or(&self.cfg.warm_floor)
    }

    /// Fraction of live runners currently leased, or None when the class
    /// has no live runners at all.
    pub async fn utilization(&self, class: RunnerClass) -> Option<f64> {
        let inner = self.inner.lock().await;
        let live = Self::live_count(&inner, class);
        if live == 0 {
            return None;
        }
        let leased = inner
            .runners
            .values()
            .filter(|r| r.class == class && r.state == RunnerState::Leased)
            .count();
        Some(leased as f64 / live as f64)
    }

    pub async fn runner(&self, id: Uuid) -> Option<Runner> {
        self.inner.lock().await.runners.get(&id).cloned()
    }

    pub async fn runners(&self) -> Vec<Runner> {
        self.inner.lock().await.runners.values().cloned().collect()
    }

    /// Callers currently blocked in `lease` for a class.
    pub async fn waiting(&self, class: RunnerClass) -> usize {
        *self.inner.lock().await.waiters.get(&class).unwrap_or(&0)
    }

    pub async fn count(&self, class: RunnerClass, state: RunnerState) -> usize {
        self.inner
            .lock()
            .await
            .runners
            .values()
            .filter(|r| r.class == class && r.state == state)
            .count()
    }

    /// Drop retired runner records.
    pub async fn cleanup_retired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.runners.len();
        inner.runners.retain(|_, r| r.is_live());
        before - inner.runners.len()
    }
}
