use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::Tier;

/// Queue sizing and scheduling-policy knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Hard capacity across all tiers. Enqueue is rejected beyond this.
    pub max_jobs: usize,
    /// A COLD job waiting longer than `starvation_multiplier * sla` is
    /// promoted one lane for pick order only.
    pub starvation_multiplier: f64,
    /// A job preempted more than this many times fails as infra failure.
    pub max_preemption_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            starvation_multiplier: 2.0,
            max_preemption_retries: 3,
        }
    }
}

/// Runner pool sizing, applied per capability class.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum IDLE runners kept warm per class.
    pub warm_floor: usize,
    /// Hard ceiling on total live runners per class.
    pub ceiling: usize,
    /// Time a spawned runner spends WARMING before it becomes IDLE.
    pub warmup: Duration,
    /// Runners older than this are retired on next release.
    pub max_runner_lifetime: Duration,
    /// Consecutive failed releases before a runner is retired.
    pub max_failure_streak: u32,
    /// IDLE count must exceed the floor for this long before excess drains.
    pub drain_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_floor: 2,
            ceiling: 8,
            warmup: Duration::from_secs(3),
            max_runner_lifetime: Duration::from_secs(30 * 60),
            max_failure_streak: 3,
            drain_after: Duration::from_secs(60),
        }
    }
}

/// Content-addressed module cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Blob directory. Entries survive restart.
    pub dir: PathBuf,
    /// Storage-pressure threshold for LRU eviction.
    pub max_bytes: u64,
    /// Lookups slower than this degrade to a miss.
    pub lookup_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/shadowbuild/cache"),
            max_bytes: 8 * 1024 * 1024 * 1024,
            lookup_timeout: Duration::from_millis(250),
        }
    }
}

/// SLA targets per tier and the monitor's scaling thresholds.
#[derive(Debug, Clone)]
pub struct SlaConfig {
    pub hot: Duration,
    pub warm: Duration,
    pub cold: Duration,
    /// Rolling latency window size per tier.
    pub window: usize,
    /// Scale-up fires when P95 exceeds `scale_up_factor * sla`.
    pub scale_up_factor: f64,
    /// Scale-down fires when pool utilization stays below this fraction.
    pub low_water_utilization: f64,
    /// How long a low-utilization condition must hold before scale-down.
    pub sustain: Duration,
}

impl SlaConfig {
    /// SLA target for a tier.
    pub fn target(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            hot: Duration::from_secs(5),
            warm: Duration::from_secs(30),
            cold: Duration::from_secs(120),
            window: 256,
            scale_up_factor: 1.5,
            low_water_utilization: 0.2,
            sustain: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub sla: SlaConfig,
    /// Directory for job/runner snapshots (crash recovery).
    pub state_dir: PathBuf,
    /// Transient infrastructure failures retried up to this bound.
    pub max_infra_retries: u32,
    /// Scheduler loop tick.
    pub tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            sla: SlaConfig::default(),
            state_dir: PathBuf::from("/var/lib/shadowbuild/state"),
            max_infra_retries: 3,
            tick: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into();
        self
    }

    pub fn with_pool_limits(mut self, warm_floor: usize, ceiling: usize) -> Self {
        self.pool.warm_floor = warm_floor;
        self.pool.ceiling = ceiling;
        self
    }
}
