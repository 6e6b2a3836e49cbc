//! Data models for the artifact registry

use chrono::{DateTime, Utc};
use fatbuildr_common::{BuildState, BuiltArtifact, PackageFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a build, as handed to the publisher
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub build_id: Uuid,
    pub state: BuildState,
    pub format: PackageFormat,
    pub distribution: String,
    pub artifact: String,
    /// Full version (`<version>-<release>`)
    pub version: String,
    pub artifacts: Vec<BuiltArtifact>,
}

/// File of a published entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    /// Name of the detached signature file next to it
    pub signature: String,
}

/// Signed list of the files of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub file: String,
    pub signature: String,
}

/// Immutable record of one publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: Uuid,
    pub format: PackageFormat,
    pub distribution: String,
    pub artifact: String,
    pub version: String,
    pub files: Vec<PublishedFile>,
    pub manifest: Manifest,
    pub key_fingerprint: String,
    pub published_at: DateTime<Utc>,
    pub build_id: Uuid,
}

/// Who may read the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAccess {
    /// Anyone, without a token
    #[default]
    Public,
    /// Holders of a `read` token
    Private,
}
