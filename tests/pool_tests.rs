use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shadowbuild::config::PoolConfig;
use shadowbuild::error::EngineError;
use shadowbuild::pool::{ReleaseOutcome, Runner, RunnerClass, RunnerPool, RunnerState};
use shadowbuild::scheduler::Tier;

fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        warm_floor: 1,
        ceiling: 2,
        warmup: Duration::ZERO,
        max_runner_lifetime: Duration::from_secs(3600),
        max_failure_streak: 3,
        drain_after: Duration::from_millis(50),
    }
}

async fn lease_any(pool: &RunnerPool, class: RunnerClass, tier: Tier) -> Runner {
    pool.lease(
        class,
        None,
        Utc::now() + chrono::Duration::seconds(2),
        Uuid::new_v4(),
        Uuid::new_v4(),
        tier,
        CancellationToken::new(),
    )
    .await
    .expect("lease")
}

#[tokio::test]
async fn lease_takes_prewarmed_runner() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;

    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    assert_eq!(runner.class, RunnerClass::Linux);
    assert_eq!(runner.state, RunnerState::Leased);
    assert_eq!(pool.count(RunnerClass::Linux, RunnerState::Idle).await, 0);
}

#[tokio::test]
async fn lease_spawns_when_nothing_idle() {
    let pool = RunnerPool::new(fast_pool_config());
    // Empty pool: the lease attempt spawns a runner and waits for it to
    // warm up (zero warmup here).
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    assert_eq!(runner.state, RunnerState::Leased);
}

#[tokio::test]
async fn lease_times_out_at_the_ceiling() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 2).await;
    let _a = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    let _b = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;

    // Both runners leased and the ceiling reached: a third lease cannot
    // be satisfied before its deadline.
    let result = pool
        .lease(
            RunnerClass::Linux,
            None,
            Utc::now() + chrono::Duration::milliseconds(200),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Tier::Warm,
            CancellationToken::new(),
        )
        .await;
    match result {
        Err(EngineError::LeaseTimeout(class)) => assert_eq!(class, "linux"),
        other => panic!("expected LeaseTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn classes_are_isolated() {
    // Long warmup so a freshly spawned Linux runner cannot satisfy the
    // lease within the test deadline.
    let cfg = PoolConfig {
        warmup: Duration::from_secs(10),
        ..fast_pool_config()
    };
    let pool = RunnerPool::new(cfg);
    pool.prewarm(RunnerClass::MacOs, 1).await;

    // A Linux lease must not take the macOS runner.
    let result = pool
        .lease(
            RunnerClass::Linux,
            None,
            Utc::now() + chrono::Duration::milliseconds(100),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Tier::Warm,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::LeaseTimeout(_))));
    // The macOS runner is untouched (it may spawn Linux warming runners,
    // but never leases across classes).
    assert_eq!(pool.count(RunnerClass::MacOs, RunnerState::Leased).await, 0);
}

#[tokio::test]
async fn release_records_affinity_and_prefers_it() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 2).await;
    let project = Uuid::new_v4();

    let runner = pool
        .lease(
            RunnerClass::Linux,
            None,
            Utc::now() + chrono::Duration::seconds(2),
            Uuid::new_v4(),
            project,
            Tier::Warm,
            CancellationToken::new(),
        )
        .await
        .expect("lease");
    pool.release(runner.id, ReleaseOutcome::Success)
        .await
        .expect("release");

    // A later lease for the same project lands on the runner that just
    // served it, not an arbitrary idle one.
    let again = pool
        .lease(
            RunnerClass::Linux,
            Some(project),
            Utc::now() + chrono::Duration::seconds(2),
            Uuid::new_v4(),
            project,
            Tier::Warm,
            CancellationToken::new(),
        )
        .await
        .expect("lease with affinity");
    assert_eq!(again.id, runner.id);
    assert_eq!(again.affinity, Some(project));
}

#[tokio::test]
async fn three_consecutive_failures_retire_the_runner() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;

    let mut last_id = None;
    for _ in 0..3 {
        let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
        if let Some(prev) = last_id {
            assert_eq!(runner.id, prev, "same runner re-leased between failures");
        }
        last_id = Some(runner.id);
        pool.release(runner.id, ReleaseOutcome::Failure)
            .await
            .expect("release");
    }

    let runner = pool.runner(last_id.unwrap()).await.unwrap();
    assert_eq!(runner.state, RunnerState::Retired);
    assert_eq!(runner.consecutive_failures, 3);
}

#[tokio::test]
async fn success_resets_the_failure_streak() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;

    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Failure).await.expect("release");
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Failure).await.expect("release");
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Success).await.expect("release");

    let runner = pool.runner(runner.id).await.unwrap();
    assert_eq!(runner.state, RunnerState::Idle);
    assert_eq!(runner.consecutive_failures, 0);
}

#[tokio::test]
async fn discarded_release_does_not_count_as_failure() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;

    for _ in 0..4 {
        let runner = lease_any(&pool, RunnerClass::Linux, Tier::Cold).await;
        pool.release(runner.id, ReleaseOutcome::Discarded)
            .await
            .expect("release");
    }

    assert_eq!(pool.count(RunnerClass::Linux, RunnerState::Retired).await, 0);
}

#[tokio::test]
async fn runner_past_max_lifetime_retires_on_release() {
    let cfg = PoolConfig {
        max_runner_lifetime: Duration::ZERO,
        ..fast_pool_config()
    };
    let pool = RunnerPool::new(cfg);
    pool.prewarm(RunnerClass::Linux, 1).await;

    // Tiny sleep so age exceeds the zero lifetime.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Success)
        .await
        .expect("release");

    let runner = pool.runner(runner.id).await.unwrap();
    assert_eq!(runner.state, RunnerState::Retired);
}

#[tokio::test]
async fn drain_idle_runner_retires_via_maintenance() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;
    // Promote it to idle first.
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Success).await.expect("release");

    pool.drain(runner.id).await.expect("drain");
    assert_eq!(pool.runner(runner.id).await.unwrap().state, RunnerState::Draining);

    pool.maintain(|_| 0).await;
    assert_eq!(pool.runner(runner.id).await.unwrap().state, RunnerState::Retired);
}

#[tokio::test]
async fn drain_leased_runner_finishes_its_build_first() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 1).await;
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;

    pool.drain(runner.id).await.expect("drain");
    // Still leased: the in-flight build is not interrupted.
    assert_eq!(pool.runner(runner.id).await.unwrap().state, RunnerState::Leased);

    pool.release(runner.id, ReleaseOutcome::Success).await.expect("release");
    assert_eq!(pool.runner(runner.id).await.unwrap().state, RunnerState::Retired);
}

#[tokio::test]
async fn preempt_cold_picks_only_cold_leases_of_the_class() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.prewarm(RunnerClass::Linux, 2).await;

    let hot_job = Uuid::new_v4();
    let cold_job = Uuid::new_v4();
    let _hot_runner = pool
        .lease(
            RunnerClass::Linux,
            None,
            Utc::now() + chrono::Duration::seconds(2),
            hot_job,
            Uuid::new_v4(),
            Tier::Hot,
            CancellationToken::new(),
        )
        .await
        .expect("lease hot");
    let cold_cancel = CancellationToken::new();
    let cold_runner = pool
        .lease(
            RunnerClass::Linux,
            None,
            Utc::now() + chrono::Duration::seconds(2),
            cold_job,
            Uuid::new_v4(),
            Tier::Cold,
            cold_cancel.clone(),
        )
        .await
        .expect("lease cold");

    let victim = pool.preempt_cold(RunnerClass::Linux).await.expect("victim");
    assert_eq!(victim.job_id, cold_job);
    assert_eq!(victim.runner_id, cold_runner.id);
    // The ticket carries the victim's token but does not fire it.
    assert!(!cold_cancel.is_cancelled());

    // No cold lease on the other class.
    assert!(pool.preempt_cold(RunnerClass::MacOs).await.is_none());
}

#[tokio::test]
async fn maintain_tops_up_warm_floor_when_work_is_queued() {
    let cfg = PoolConfig {
        warm_floor: 2,
        ceiling: 4,
        ..fast_pool_config()
    };
    let pool = RunnerPool::new(cfg);

    // No queued work: nothing spawns.
    pool.maintain(|_| 0).await;
    assert_eq!(pool.count(RunnerClass::Linux, RunnerState::Warming).await, 0);

    // Queued work: spawn up to the floor.
    pool.maintain(|_| 5).await;
    let warming = pool.count(RunnerClass::Linux, RunnerState::Warming).await;
    let idle = pool.count(RunnerClass::Linux, RunnerState::Idle).await;
    assert_eq!(warming + idle, 2);
}

#[tokio::test]
async fn warm_floor_is_clamped_to_the_ceiling() {
    let pool = RunnerPool::new(fast_pool_config());
    pool.set_warm_floor(RunnerClass::Linux, 100).await;
    assert_eq!(pool.warm_floor(RunnerClass::Linux).await, 2);
}

#[tokio::test]
async fn utilization_is_leased_over_live() {
    let pool = RunnerPool::new(fast_pool_config());
    // No live runners: there is no utilization to report.
    assert_eq!(pool.utilization(RunnerClass::Linux).await, None);

    pool.prewarm(RunnerClass::Linux, 2).await;
    let _runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    assert_eq!(pool.utilization(RunnerClass::Linux).await, Some(0.5));
}

#[tokio::test]
async fn cleanup_drops_retired_records() {
    let cfg = PoolConfig {
        max_failure_streak: 1,
        ..fast_pool_config()
    };
    let pool = RunnerPool::new(cfg);
    pool.prewarm(RunnerClass::Linux, 1).await;
    let runner = lease_any(&pool, RunnerClass::Linux, Tier::Warm).await;
    pool.release(runner.id, ReleaseOutcome::Failure).await.expect("release");

    assert_eq!(pool.cleanup_retired().await, 1);
    assert!(pool.runner(runner.id).await.is_none());
}
