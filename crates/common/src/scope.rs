//! API token scopes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Scope bound to an API token. Scopes are ordered: a scope grants
/// everything granted by the scopes before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Read published registry entries and build status
    Read,
    /// Trigger, cancel and republish builds
    BuildTrigger,
    /// Manage tokens and build environments
    Admin,
}

impl TokenScope {
    /// Whether a token of this scope may perform an operation requiring `required`
    pub fn allows(self, required: TokenScope) -> bool {
        self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::Read => "read",
            TokenScope::BuildTrigger => "build_trigger",
            TokenScope::Admin => "admin",
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(TokenScope::Read),
            "build_trigger" | "build" => Ok(TokenScope::BuildTrigger),
            "admin" => Ok(TokenScope::Admin),
            other => Err(Error::Configuration(format!("unknown token scope '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_ordering() {
        assert!(TokenScope::Admin.allows(TokenScope::BuildTrigger));
        assert!(TokenScope::BuildTrigger.allows(TokenScope::Read));
        assert!(!TokenScope::Read.allows(TokenScope::BuildTrigger));
        assert_eq!("build".parse::<TokenScope>().unwrap(), TokenScope::BuildTrigger);
    }
}
