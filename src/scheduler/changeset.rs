use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::RunnerClass;

/// Declared kind of a submitted change, as reported by the generation side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Edits confined to view units.
    UiOnly,
    /// New or changed non-UI functions, screens, or state-contract fields.
    Logic,
    /// Dependency manifest or lockfile changes.
    Dependency,
    /// Anything the submitter could not classify.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::UiOnly => write!(f, "ui_only"),
            ChangeKind::Logic => write!(f, "logic"),
            ChangeKind::Dependency => write!(f, "dependency"),
            ChangeKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Role a compilation unit plays in the project's module graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    View,
    Logic,
}

/// One compilation unit touched by a change: its own content hash plus the
/// content hashes of its direct dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub name: String,
    pub content_hash: String,
    pub dep_hashes: Vec<String>,
    pub role: UnitRole,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, content_hash: impl Into<String>, role: UnitRole) -> Self {
        Self {
            name: name.into(),
            content_hash: content_hash.into(),
            dep_hashes: Vec::new(),
            role,
        }
    }
}

/// Platform the produced artifact targets. Fixes the runner capability class
/// a build of this change requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPlatform {
    MacOs,
    Linux,
}

impl TargetPlatform {
    pub fn required_class(self) -> RunnerClass {
        match self {
            TargetPlatform::MacOs => RunnerClass::MacOs,
            TargetPlatform::Linux => RunnerClass::Linux,
        }
    }
}

impl std::fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetPlatform::MacOs => write!(f, "macos"),
            TargetPlatform::Linux => write!(f, "linux"),
        }
    }
}

/// A classified source change. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: Uuid,
    pub project_id: Uuid,
    pub platform: TargetPlatform,
    pub kind: ChangeKind,
    pub units: Vec<SourceUnit>,
    pub touches_manifest: bool,
    pub touches_build_config: bool,
    pub touches_signing: bool,
    pub submitted_at: DateTime<Utc>,
}

impl ChangeSet {
    pub fn new(project_id: Uuid, platform: TargetPlatform, kind: ChangeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            platform,
            kind,
            units: Vec::new(),
            touches_manifest: false,
            touches_build_config: false,
            touches_signing: false,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_unit(mut self, unit: SourceUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn touching_manifest(mut self) -> Self {
        self.touches_manifest = true;
        self
    }

    pub fn touching_build_config(mut self) -> Self {
        self.touches_build_config = true;
        self
    }

    pub fn touching_signing(mut self) -> Self {
        self.touches_signing = true;
        self
    }

    /// True when the change alters structural files that invalidate cheap
    /// rebuild assumptions (manifests, build config, signing).
    pub fn touches_structure(&self) -> bool {
        self.touches_manifest || self.touches_build_config || self.touches_signing
    }

    /// True when every touched unit is a declared view unit.
    pub fn confined_to_views(&self) -> bool {
        !self.units.is_empty() && self.units.iter().all(|u| u.role == UnitRole::View)
    }
}
