//! Build environment identity and isolation policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Key of a build environment: one environment exists per
/// (distribution, architecture) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvKey {
    /// Target distribution (e.g. `bookworm`, `el8`)
    pub distribution: String,

    /// Target architecture (e.g. `x86_64`)
    pub architecture: String,
}

impl EnvKey {
    /// Create a new key, rejecting components unusable as path segments
    pub fn new(distribution: impl Into<String>, architecture: impl Into<String>) -> Result<Self> {
        let key = Self {
            distribution: distribution.into(),
            architecture: architecture.into(),
        };
        validate_component("distribution", &key.distribution)?;
        validate_component("architecture", &key.architecture)?;
        Ok(key)
    }

    /// Directory of this environment, relative to the images directory.
    /// Neither component holds a `/`, so distinct keys never share it.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.distribution).join(&self.architecture)
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.distribution, self.architecture)
    }
}

impl FromStr for EnvKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (distribution, architecture) = s
            .split_once('/')
            .ok_or_else(|| Error::Configuration(format!("invalid environment key '{}'", s)))?;
        EnvKey::new(distribution, architecture)
    }
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.chars().any(char::is_whitespace)
    {
        return Err(Error::Configuration(format!("invalid {} '{}'", what, value)));
    }
    Ok(())
}

/// Isolation knobs of a build environment. Each knob is toggled
/// independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Filter the syscall surface with seccomp
    pub seccomp: bool,

    /// Register the container with the host service manager
    pub register: bool,

    /// Keep the container in the resource allocation (unit/cgroup) of the
    /// parent service instead of a host-wide default
    pub bind_resources: bool,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            seccomp: true,
            register: false,
            bind_resources: true,
        }
    }
}

impl fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seccomp={} register={} bind_resources={}",
            self.seccomp, self.register, self.bind_resources
        )
    }
}

/// Partial policy applied on top of the instance defaults for one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_resources: Option<bool>,
}

impl IsolationOverride {
    /// Resolve the effective policy from a base policy
    pub fn apply(&self, base: IsolationPolicy) -> IsolationPolicy {
        IsolationPolicy {
            seccomp: self.seccomp.unwrap_or(base.seccomp),
            register: self.register.unwrap_or(base.register),
            bind_resources: self.bind_resources.unwrap_or(base.bind_resources),
        }
    }
}

/// Architecture of the running host, used when a definition lists none
pub fn host_architecture() -> &'static str {
    std::env::consts::ARCH
}
