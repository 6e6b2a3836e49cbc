//! Data models for the build service

use chrono::{DateTime, Utc};
use fatbuildr_common::{
    ArtifactDefinition, BuildState, BuiltArtifact, EnvKey, Error, IsolationPolicy,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recorded failure of a build or of its publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    /// Error category, e.g. `patch_apply` or `build_tool`
    pub category: String,

    pub message: String,

    /// Tail of the build log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
}

impl From<&Error> for BuildError {
    fn from(err: &Error) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
            log_excerpt: err.log_excerpt().map(String::from),
        }
    }
}

/// A build request and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Unique build identifier
    pub id: Uuid,

    /// Definition snapshot taken at submission
    pub artifact: ArtifactDefinition,

    /// Target environment
    pub key: EnvKey,

    /// Refresh the environment before building
    pub force_refresh: bool,

    /// Label of the token that triggered the build
    pub submitted_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Current state
    pub state: BuildState,

    pub submitted_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Isolation policy of the environment the build ran in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationPolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<BuiltArtifact>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BuildError>,

    /// Registry entry created from this build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_error: Option<BuildError>,
}

impl BuildRequest {
    /// Create a new queued request
    pub fn new(
        artifact: ArtifactDefinition,
        key: EnvKey,
        force_refresh: bool,
        submitted_by: String,
        message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            artifact,
            key,
            force_refresh,
            submitted_by,
            message,
            state: BuildState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            isolation: None,
            artifacts: Vec::new(),
            error: None,
            published: None,
            publish_error: None,
        }
    }

    /// Mark request as running
    pub fn mark_running(&mut self) {
        self.state = BuildState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark request as succeeded
    pub fn mark_succeeded(&mut self, artifacts: Vec<BuiltArtifact>) {
        self.state = BuildState::Succeeded;
        self.finished_at = Some(Utc::now());
        self.artifacts = artifacts;
    }

    /// Mark request as failed
    pub fn mark_failed(&mut self, error: &Error) {
        self.state = BuildState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(BuildError::from(error));
    }

    /// Mark request as cancelled
    pub fn mark_cancelled(&mut self, reason: &str) {
        self.state = BuildState::Cancelled;
        self.finished_at = Some(Utc::now());
        self.artifacts.clear();
        self.error = Some(BuildError {
            category: "cancelled".to_string(),
            message: reason.to_string(),
            log_excerpt: None,
        });
    }

    pub fn mark_published(&mut self, entry: Uuid) {
        self.published = Some(entry);
        self.publish_error = None;
    }

    pub fn mark_publish_failed(&mut self, error: &Error) {
        self.publish_error = Some(BuildError::from(error));
    }

    /// Whether a publication may be (re)attempted
    pub fn can_publish(&self) -> bool {
        self.state == BuildState::Succeeded && self.published.is_none()
    }
}

/// Request to trigger a build
#[derive(Debug, Clone, Deserialize)]
pub struct BuildTrigger {
    /// Artifact definition name
    pub artifact: String,

    pub distribution: String,

    /// Defaults to the first architecture of the definition
    #[serde(default)]
    pub architecture: Option<String>,

    #[serde(default)]
    pub force_refresh: bool,

    #[serde(default)]
    pub message: Option<String>,
}

/// Response from triggering a build
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub build_id: Uuid,
    pub state: BuildState,
}

/// Request to issue an API token
#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub scope: fatbuildr_common::TokenScope,
    pub label: String,
    /// Lifetime in seconds; never expires when absent
    #[serde(default)]
    pub ttl: Option<i64>,
}

/// Request to create the signing key of a scope
#[derive(Debug, Default, Deserialize)]
pub struct CreateKeyRequest {
    /// Distribution served by the key; the instance key when absent
    #[serde(default)]
    pub distribution: Option<String>,
    pub userid: String,
    /// Replace an existing key
    #[serde(default)]
    pub force: bool,
}

/// Public part of a signing key
#[derive(Debug, Serialize)]
pub struct PublicKey {
    pub key: fatbuildr_keyring::KeyInfo,
    pub armored: String,
}

/// Part of a build log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Vec<u8>,
    /// Offset to ask for next
    pub next_offset: u64,
    /// The build is over and the log fully read
    pub complete: bool,
}

/// Build statistics
#[derive(Debug, Default, Serialize)]
pub struct BuildStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BuildStats {
    pub fn count(&mut self, state: BuildState) {
        match state {
            BuildState::Queued => self.queued += 1,
            BuildState::Running => self.running += 1,
            BuildState::Succeeded => self.succeeded += 1,
            BuildState::Failed => self.failed += 1,
            BuildState::Cancelled => self.cancelled += 1,
        }
    }
}
