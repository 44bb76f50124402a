
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shadowbuild::config::SlaConfig;
use shadowbuild::engine::Engine;
use shadowbuild::persist::StateStore;
use shadowbuild::pool::{Runner, RunnerClass, RunnerState};
use shadowbuild::scheduler::{Job, JobState, Tier};
use test_harness::{logic_change, test_config, ui_change, FakeToolchain, TestEngine};

async fn engine_over(state_dir: &TempDir, cache_dir: &TempDir) -> Arc<Engine> {
    let cfg = test_config(state_dir, cache_dir);
    let engine = Engine::new(cfg, Arc::new(FakeToolchain::new()), CancellationToken::new())
        .await
        .expect("engine");
    engine.recover().await.expect("recover");
    engine
}

#[tokio::test]
async fn in_flight_jobs_are_requeued_at_warm() {
    let state_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    // Simulate a crash: a snapshot holding one running hot job and one
    // assigned cold job.
    let store = StateStore::open(state_dir.path()).await.unwrap();
    let mut running = Job::new(
        ui_change(Uuid::new_v4(), &[("View", "v1")]),
        Tier::Hot,
        SlaConfig::default().target(Tier::Hot),
    );
    running.state = JobState::Running;
    running.assigned_runner = Some(Uuid::new_v4());
    let mut assigned = Job::new(
        logic_change(Uuid::new_v4(), &[("Store", "s1")]),
        Tier::Cold,
        SlaConfig::default().target(Tier::Cold),
    );
    assigned.state = JobState::Assigned;
    store.save_jobs(&[running.clone(), assigned.clone()]).await.unwrap();

    let engine = engine_over(&state_dir, &cache_dir).await;

    for id in [running.id, assigned.id] {
        let status = engine.job_status(id).await.expect("recovered job");
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.tier, Tier::Warm, "in-flight work restarts at warm");
    }
}

#[tokio::test]
async fn terminal_jobs_stay_archived_after_recovery() {
    let state_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = StateStore::open(state_dir.path()).await.unwrap();
    let mut done = Job::new(
        ui_change(Uuid::new_v4(), &[("View", "v1")]),
        Tier::Hot,
        SlaConfig::default().target(Tier::Hot),
    );
    done.state = JobState::Succeeded;
    done.artifact_ref = Some("abc123".to_string());
    store.save_jobs(&[done.clone()]).await.unwrap();

    let engine = engine_over(&state_dir, &cache_dir).await;

    let status = engine.job_status(done.id).await.expect("archived job");
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.artifact_ref.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn warm_pool_is_rebuilt_from_runner_metadata() {
    let state_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = StateStore::open(state_dir.path()).await.unwrap();
    let mut leased = Runner::new(RunnerClass::Linux);
    leased.state = RunnerState::Leased;
    let idle = Runner::new(RunnerClass::MacOs);
    let mut retired = Runner::new(RunnerClass::MacOs);
    retired.state = RunnerState::Retired;
    store.save_runners(&[leased, idle, retired]).await.unwrap();

    let engine = engine_over(&state_dir, &cache_dir).await;

    // One live runner per class in the snapshot; retired ones are not
    // resurrected. Fresh runners start warming regardless of prior state.
    let pool = engine.pool();
    assert_eq!(pool.count(RunnerClass::Linux, RunnerState::Warming).await, 1);
    assert_eq!(pool.count(RunnerClass::MacOs, RunnerState::Warming).await, 1);
    assert_eq!(pool.count(RunnerClass::MacOs, RunnerState::Retired).await, 0);
}

#[tokio::test]
async fn recovered_job_runs_to_completion() {
    let state_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = StateStore::open(state_dir.path()).await.unwrap();
    let mut interrupted = Job::new(
        logic_change(Uuid::new_v4(), &[("Api", "a1")]),
        Tier::Warm,
        SlaConfig::default().target(Tier::Warm),
    );
    interrupted.state = JobState::Running;
    store.save_jobs(&[interrupted.clone()]).await.unwrap();

    // Full restart path: recover, then start the loops and let the job
    // finish on a fresh runner.
    let cfg = test_config(&state_dir, &cache_dir);
    let toolchain = Arc::new(FakeToolchain::new());
    let shutdown = CancellationToken::new();
    let engine = Engine::new(cfg, toolchain, shutdown.clone()).await.expect("engine");
    engine.recover().await.expect("recover");
    engine.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = engine.job_status(interrupted.id).await.expect("status");
        if status.state == JobState::Succeeded {
            assert!(status.artifact_ref.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovered job stuck in {:?}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
}

#[tokio::test]
async fn engine_snapshot_survives_restart() {
    let state_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let job_id;
    {
        let cfg = test_config(&state_dir, &cache_dir);
        let toolchain = Arc::new(FakeToolchain::new());
        let shutdown = CancellationToken::new();
        let engine = Engine::new(cfg, toolchain, shutdown.clone()).await.expect("engine");
        engine.recover().await.expect("recover");
        engine.start();

        job_id = engine
            .submit(ui_change(Uuid::new_v4(), &[("View", "v1")]))
            .await
            .expect("submit");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if engine.job_status(job_id).await.unwrap().state == JobState::Succeeded {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let the maintenance loop write a snapshot that includes the
        // finished job before the process "dies".
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let engine = engine_over(&state_dir, &cache_dir).await;
    let status = engine.job_status(job_id).await.expect("job from snapshot");
    assert_eq!(status.state, JobState::Succeeded);
}

#[tokio::test]
async fn recovery_with_no_prior_state_is_a_fresh_start() {
    let t = TestEngine::start().await;
    assert!(t.engine.all_jobs().await.is_empty());
}
