//! Build execution: a resumable state machine over a content-addressed cache.
//!
//! RESOLVING -> COMPILING_UNITS -> LINKING -> DEPLOY_STAGING -> DONE, with
//! FAILED absorbing from any phase. Each unit is cache-checked before the
//! toolchain is invoked, so a build resumed on a different runner after a
//! preemption re-uses every blob the first attempt already stored.

pub mod toolchain;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheKey, ModuleCache};
use crate::error::{EngineError, Result};
use crate::pool::Runner;
use crate::scheduler::job::Job;

pub use toolchain::{ProcessToolchain, Toolchain, UnitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Resolving,
    CompilingUnits,
    Linking,
    DeployStaging,
    Done,
    Failed,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::Resolving => write!(f, "resolving"),
            BuildPhase::CompilingUnits => write!(f, "compiling_units"),
            BuildPhase::Linking => write!(f, "linking"),
            BuildPhase::DeployStaging => write!(f, "deploy_staging"),
            BuildPhase::Done => write!(f, "done"),
            BuildPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a completed build, with enough counts to verify that
/// incremental and resumed builds did less work than a cold one.
#[derive(Debug)]
pub struct BuildReport {
    pub job_id: Uuid,
    pub units_total: usize,
    pub cache_hits: usize,
    pub units_compiled: usize,
    pub bundle: Vec<u8>,
}

pub struct BuildExecutor {
    toolchain: Arc<dyn Toolchain>,
    cache: Arc<ModuleCache>,
}

impl BuildExecutor {
    pub fn new(toolchain: Arc<dyn Toolchain>, cache: Arc<ModuleCache>) -> Self {
        Self { toolchain, cache }
    }

    /// Run a job on a leased runner to completion, cancellation, or failure.
    ///
    /// Compile failures are terminal and carry the originating unit with the
    /// raw toolchain error; they must not be auto-retried. Cancellation
    /// (preemption or drain) is observed between units: blobs already stored
    /// stay in the cache, in-flight uncached work is discarded.
    pub async fn execute(
        &self,
        job: &Job,
        runner: &Runner,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let version = self.toolchain.version();
        tracing::info!(
            job_id = %job.id,
            runner_id = %runner.id,
            tier = %job.tier,
            phase = %BuildPhase::Resolving,
            "Build started"
        );

        let units = self.toolchain.resolve_dependencies(&job.change).await?;
        let units_total = units.len();

        tracing::debug!(job_id = %job.id, units = units_total, phase = %BuildPhase::CompilingUnits, "Resolved units");

        // Compile in parallel, one task per unit, each cache-checked.
        let mut set: JoinSet<std::result::Result<(usize, Vec<u8>, bool), UnitError>> =
            JoinSet::new();
        for (idx, unit) in units.iter().cloned().enumerate() {
            let toolchain = Arc::clone(&self.toolchain);
            let cache = Arc::clone(&self.cache);
            let version = version.clone();
            set.spawn(async move {
                let key = CacheKey::compute(&unit.content_hash, &unit.dep_hashes, &version);
                if let Some(hit) = cache.lookup(&key).await {
                    return Ok((idx, hit.blob, true));
                }
                let blob = toolchain.compile_unit(&unit).await?;
                match cache.put(&key, &blob).await {
                    Ok(_) => {}
                    Err(e) => {
                        // A failed cache write costs future reuse, not this build.
                        tracing::warn!(unit = %unit.name, error = %e, "Cache put failed");
                    }
                }
                Ok((idx, blob, false))
            });
        }

        let mut blobs: Vec<Option<Vec<u8>>> = vec![None; units_total];
        let mut cache_hits = 0usize;
        let mut units_compiled = 0usize;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    tracing::info!(job_id = %job.id, phase = %BuildPhase::CompilingUnits, "Build cancelled");
                    return Err(EngineError::Cancelled);
                }
                next = set.join_next() => {
                    match next {
                        None => break,
                        Some(Ok(Ok((idx, blob, was_hit)))) => {
                            if was_hit {
                                cache_hits += 1;
                            } else {
                                units_compiled += 1;
                            }
                            blobs[idx] = Some(blob);
                        }
                        Some(Ok(Err(unit_err))) => {
                            set.abort_all();
                            tracing::warn!(
                                job_id = %job.id,
                                unit = %unit_err.unit,
                                phase = %BuildPhase::Failed,
                                "Unit compilation failed"
                            );
                            return Err(EngineError::BuildFailed {
                                unit: unit_err.unit,
                                message: unit_err.message,
                            });
                        }
                        Some(Err(join_err)) => {
                            set.abort_all();
                            return Err(EngineError::Internal(format!(
                                "compile task panicked: {join_err}"
                            )));
                        }
                    }
                }
            }
        }

        let blobs: Vec<Vec<u8>> = blobs
            .into_iter()
            .map(|b| b.ok_or_else(|| EngineError::Internal("missing unit blob".to_string())))
            .collect::<Result<_>>()?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        tracing::debug!(job_id = %job.id, phase = %BuildPhase::Linking, cache_hits, units_compiled, "Linking");
        let bundle = self.toolchain.link(&blobs).await?;

        tracing::debug!(job_id = %job.id, phase = %BuildPhase::DeployStaging, "Staging");
        let bundle = self.toolchain.stage(bundle).await?;

        tracing::info!(
            job_id = %job.id,
            runner_id = %runner.id,
            phase = %BuildPhase::Done,
            units = units_total,
            cache_hits,
            units_compiled,
            "Build finished"
        );

        Ok(BuildReport {
            job_id: job.id,
            units_total,
            cache_hits,
            units_compiled,
            bundle,
        })
    }
}
