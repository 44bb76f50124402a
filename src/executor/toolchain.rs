use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::scheduler::changeset::{ChangeSet, SourceUnit};

/// Raw toolchain failure for one compilation unit.
#[derive(Debug, Clone)]
pub struct UnitError {
    pub unit: String,
    pub message: String,
}

/// Platform-specific compilation adapter.
///
/// The engine does not fix a compiler; anything that can resolve a change
/// into compilation units, compile them, and link the results can serve as a
/// toolchain. The version string participates in cache keys, so bumping the
/// toolchain invalidates every cached unit.
#[async_trait]
pub trait Toolchain: Send + Sync {
    fn version(&self) -> String;

    /// Decompose a change into the compilation units it requires.
    async fn resolve_dependencies(&self, change: &ChangeSet) -> Result<Vec<SourceUnit>>;

    /// Compile one unit to a module blob.
    async fn compile_unit(&self, unit: &SourceUnit) -> std::result::Result<Vec<u8>, UnitError>;

    /// Link compiled module blobs into a deployable bundle.
    async fn link(&self, blobs: &[Vec<u8>]) -> Result<Vec<u8>>;

    /// Final staging pass (packaging, signing). Defaults to a pass-through.
    async fn stage(&self, bundle: Vec<u8>) -> Result<Vec<u8>> {
        Ok(bundle)
    }
}

/// Toolchain that shells out to an external compiler binary per unit.
///
/// Compiles with `<compiler> compile --unit <name> --hash <content-hash>`,
/// taking stdout as the module blob; links with `<compiler> link <files..>`.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    pub compiler: String,
    pub version: String,
    pub work_dir: PathBuf,
}

impl ProcessToolchain {
    pub fn new(compiler: impl Into<String>, version: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            version: version.into(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn resolve_dependencies(&self, change: &ChangeSet) -> Result<Vec<SourceUnit>> {
        // The submitted change already carries its unit decomposition.
        Ok(change.units.clone())
    }

    async fn compile_unit(&self, unit: &SourceUnit) -> std::result::Result<Vec<u8>, UnitError> {
        tracing::debug!(unit = %unit.name, compiler = %self.compiler, "Compiling unit");

        let result = Command::new(&self.compiler)
            .arg("compile")
            .arg("--unit")
            .arg(&unit.name)
            .arg("--hash")
            .arg(&unit.content_hash)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => Ok(output.stdout),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                Err(UnitError {
                    unit: unit.name.clone(),
                    message: if stderr.is_empty() {
                        format!("exit code {:?}", output.status.code())
                    } else {
                        stderr
                    },
                })
            }
            Err(e) => Err(UnitError {
                unit: unit.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn link(&self, blobs: &[Vec<u8>]) -> Result<Vec<u8>> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut paths = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let path = self.work_dir.join(format!("link-{}.o", Uuid::new_v4()));
            tokio::fs::write(&path, blob).await?;
            paths.push(path);
        }

        let output = Command::new(&self.compiler)
            .arg("link")
            .args(&paths)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        for path in &paths {
            let _ = tokio::fs::remove_file(path).await;
        }

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(EngineError::BuildFailed {
                unit: "<link>".to_string(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}
