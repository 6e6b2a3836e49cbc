//! Build lifecycle types shared by the scheduler and the registry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Build request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Waiting for a worker and a free environment slot
    Queued,
    /// Toolchain running in the environment
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Queued => "queued",
            BuildState::Running => "running",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
            BuildState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package file produced by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Hex encoded SHA-256 digest
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!BuildState::Queued.is_terminal());
        assert!(!BuildState::Running.is_terminal());
        assert!(BuildState::Succeeded.is_terminal());
        assert!(BuildState::Cancelled.is_terminal());
        assert_eq!(
            serde_json::to_string(&BuildState::Succeeded).unwrap(),
            "\"succeeded\""
        );
    }
}
