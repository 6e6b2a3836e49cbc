use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Patch #{index} {patch} failed to apply: {reason}")]
    PatchApply {
        index: usize,
        patch: String,
        reason: String,
    },

    #[error("Unable to provision build environment {key}: {reason}")]
    EnvironmentProvision { key: String, reason: String },

    #[error("Build tool exited with code {exit_code}")]
    BuildTool { exit_code: i32, log_excerpt: String },

    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Signing key already exists: {0}")]
    KeyExists(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Build cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact definition: {0}")]
    InvalidDefinition(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    Checksum {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short machine-readable category, recorded on failed build requests
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::PatchApply { .. } => "patch_apply",
            Error::EnvironmentProvision { .. } => "environment_provision",
            Error::BuildTool { .. } => "build_tool",
            Error::KeyUnavailable(_) => "key_unavailable",
            Error::KeyExists(_) => "key_exists",
            Error::Authorization(_) => "authorization",
            Error::Cancelled(_) => "cancelled",
            Error::InvalidState(_) => "invalid_state",
            Error::NotFound(_) => "not_found",
            Error::InvalidDefinition(_) => "invalid_definition",
            Error::Download(_) => "download",
            Error::Checksum { .. } => "checksum",
            Error::Json(_) => "json",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// Log excerpt attached to the error, if any
    pub fn log_excerpt(&self) -> Option<&str> {
        match self {
            Error::BuildTool { log_excerpt, .. } => Some(log_excerpt),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_apply_message_names_patch() {
        let err = Error::PatchApply {
            index: 2,
            patch: "0002-fix-build.patch".to_string(),
            reason: "hunk #1 does not match".to_string(),
        };
        assert_eq!(err.category(), "patch_apply");
        assert_eq!(
            err.to_string(),
            "Patch #2 0002-fix-build.patch failed to apply: hunk #1 does not match"
        );
    }

    #[test]
    fn test_build_tool_keeps_excerpt() {
        let err = Error::BuildTool {
            exit_code: 2,
            log_excerpt: "make: *** [all] Error 2".to_string(),
        };
        assert_eq!(err.log_excerpt(), Some("make: *** [all] Error 2"));
        assert!(Error::NotFound("x".into()).log_excerpt().is_none());
    }
}
