//! Artifact definitions
//!
//! An artifact definition lives in its own directory:
//!
//! ```text
//! <definitions>/<artifact>/
//!     artifact.toml
//!     deb/ or rpm/          packaging code
//!     patches/generic/      patches for every version
//!     patches/<version>/    patches for one version
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::environment::host_architecture;
use crate::error::{Error, Result};

/// Name of the definition file inside an artifact directory
pub const DEFINITION_FILE: &str = "artifact.toml";

/// Native packaging format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Deb,
    Rpm,
}

impl PackageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::Deb => "deb",
            PackageFormat::Rpm => "rpm",
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deb" => Ok(PackageFormat::Deb),
            "rpm" => Ok(PackageFormat::Rpm),
            other => Err(Error::InvalidDefinition(format!(
                "unsupported package format '{}'",
                other
            ))),
        }
    }
}

/// Checksum algorithms accepted for upstream tarballs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

/// Expected checksum of an upstream tarball, written `<algo>:<hex>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        let (algo, value) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidDefinition(format!("invalid checksum '{}'", raw)))?;
        let algorithm = match algo {
            "sha256" => ChecksumAlgorithm::Sha256,
            "sha512" => ChecksumAlgorithm::Sha512,
            other => {
                return Err(Error::InvalidDefinition(format!(
                    "unsupported checksum algorithm '{}'",
                    other
                )))
            }
        };
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDefinition(format!(
                "checksum value '{}' is not hexadecimal",
                value
            )));
        }
        Ok(Self {
            algorithm,
            value: value.to_ascii_lowercase(),
        })
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        let algo = match checksum.algorithm {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        };
        format!("{}:{}", algo, checksum.value)
    }
}

/// Where the pristine upstream source comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOrigin {
    /// URL template. `{name}`, `{version}` and `{tag}` are expanded; an
    /// optional `!filename` suffix names the cached file.
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

/// Rendered source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub url: String,
    pub filename: String,
}

impl SourceOrigin {
    /// Expand the template for the given artifact name and version
    pub fn render(&self, name: &str, version: &str) -> Result<SourceLocation> {
        let tag = format!("{}-{}", name, version.replace('.', "_"));
        let rendered = self
            .url
            .replace("{name}", name)
            .replace("{version}", version)
            .replace("{tag}", &tag);

        let (url, filename) = match rendered.split_once('!') {
            Some((url, filename)) => (url.to_string(), filename.to_string()),
            None => {
                let filename = rendered
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (rendered.clone(), filename)
            }
        };

        if filename.is_empty() || filename.contains('/') {
            return Err(Error::InvalidDefinition(format!(
                "unable to derive a tarball filename from '{}'",
                self.url
            )));
        }

        Ok(SourceLocation { url, filename })
    }
}

/// Definition of an artifact to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDefinition {
    /// Artifact (source package) name
    pub name: String,

    /// Upstream version
    pub version: String,

    /// Packaging release number
    #[serde(default = "default_release")]
    pub release: String,

    /// Packaging format
    pub format: PackageFormat,

    /// Distributions this artifact may be built for
    pub distributions: Vec<String>,

    /// Architectures this artifact may be built for; empty means the host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,

    /// Upstream source; `None` for native packages carrying their own tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceOrigin>,
}

fn default_release() -> String {
    "1".to_string()
}

impl ArtifactDefinition {
    /// Parse a definition from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let definition: ArtifactDefinition = toml::from_str(content)
            .map_err(|e| Error::InvalidDefinition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load `artifact.toml` from an artifact directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(DEFINITION_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("artifact definition {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') || self.name.starts_with('.') {
            return Err(Error::InvalidDefinition(format!(
                "invalid artifact name '{}'",
                self.name
            )));
        }
        if self.version.is_empty() || self.version.contains('/') {
            return Err(Error::InvalidDefinition(format!(
                "invalid version '{}' for {}",
                self.version, self.name
            )));
        }
        if self.distributions.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "artifact {} declares no distribution",
                self.name
            )));
        }
        if let Some(source) = &self.source {
            source.render(&self.name, &self.version)?;
        }
        Ok(())
    }

    /// `<version>-<release>`
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.version, self.release)
    }

    /// Whether the artifact may be built for this distribution
    pub fn supports_distribution(&self, distribution: &str) -> bool {
        self.distributions.iter().any(|d| d == distribution)
    }

    /// Whether the artifact may be built for this architecture
    pub fn supports_architecture(&self, architecture: &str) -> bool {
        if self.architectures.is_empty() {
            architecture == host_architecture()
        } else {
            self.architectures.iter().any(|a| a == architecture)
        }
    }

    /// Architecture used when the build trigger names none
    pub fn default_architecture(&self) -> String {
        self.architectures
            .first()
            .cloned()
            .unwrap_or_else(|| host_architecture().to_string())
    }
}
