//! Registry publisher
//!
//! Entries are laid out as
//! `<root>/<format>/<distribution>/<artifact>/<version>/<entry-id>/`. Each
//! entry is assembled in a hidden staging directory and renamed into place
//! once complete, so readers never see a partial entry.

use chrono::Utc;
use fatbuildr_common::{BuildState, Error, PackageFormat, Result};
use fatbuildr_keyring::Signer;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{BuildResult, Manifest, PublishedFile, RegistryEntry};

const STAGING_DIR: &str = ".staging";
const ENTRY_FILE: &str = "entry.json";
const MANIFEST_FILE: &str = "MANIFEST";

pub struct Publisher {
    root: PathBuf,
    signer: Arc<dyn Signer>,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn signature_name(file: &str) -> String {
    format!("{}.asc", file)
}

/// Whether `value` can be used as a single path segment
fn is_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && !value.contains('/')
        && !value.contains('\\')
}

fn check_segment(what: &str, value: &str) -> Result<()> {
    if is_segment(value) {
        Ok(())
    } else {
        Err(Error::InvalidState(format!("invalid {} '{}'", what, value)))
    }
}

async fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_segment(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

impl Publisher {
    /// Open the registry rooted at `root`, discarding leftover staging entries
    pub async fn open(root: impl Into<PathBuf>, signer: Arc<dyn Signer>) -> Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            warn!("Discarding unfinished publications in {}", staging.display());
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            Error::Configuration(format!(
                "registry root {} is not writable: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root, signer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, format: PackageFormat, distribution: &str, artifact: &str) -> PathBuf {
        self.root
            .join(format.as_str())
            .join(distribution)
            .join(artifact)
    }

    /// Sign and publish the artifacts of a succeeded build
    pub async fn publish(&self, result: &BuildResult) -> Result<RegistryEntry> {
        if result.state != BuildState::Succeeded {
            return Err(Error::InvalidState(format!(
                "build {} is {}, only succeeded builds are published",
                result.build_id, result.state
            )));
        }
        if result.artifacts.is_empty() {
            return Err(Error::InvalidState(format!(
                "build {} produced no artifact",
                result.build_id
            )));
        }
        check_segment("distribution", &result.distribution)?;
        check_segment("artifact", &result.artifact)?;
        check_segment("version", &result.version)?;

        let id = Uuid::new_v4();
        let staging = self.root.join(STAGING_DIR).join(id.to_string());
        tokio::fs::create_dir_all(&staging).await?;

        let entry = match self.stage(&staging, id, result).await {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                    warn!("Unable to remove staging {}: {}", staging.display(), cleanup);
                }
                return Err(e);
            }
        };

        let parent = self
            .artifact_dir(result.format, &result.distribution, &result.artifact)
            .join(&result.version);
        tokio::fs::create_dir_all(&parent).await?;
        tokio::fs::rename(&staging, parent.join(id.to_string())).await?;

        info!(
            "Published {} {} for {}/{} as entry {} ({} files)",
            result.artifact,
            result.version,
            result.format,
            result.distribution,
            id,
            entry.files.len()
        );
        Ok(entry)
    }

    async fn stage(&self, staging: &Path, id: Uuid, result: &BuildResult) -> Result<RegistryEntry> {
        let mut files = Vec::with_capacity(result.artifacts.len());
        let mut seen = HashSet::new();
        let mut key_fingerprint = None;

        for artifact in &result.artifacts {
            check_segment("file name", &artifact.file_name)?;
            if !seen.insert(artifact.file_name.as_str()) {
                return Err(Error::InvalidState(format!(
                    "duplicate artifact file {}",
                    artifact.file_name
                )));
            }

            let data = tokio::fs::read(&artifact.path).await?;
            let sha256 = sha256_hex(&data);
            if !artifact.sha256.is_empty() && artifact.sha256 != sha256 {
                return Err(Error::Checksum {
                    file: artifact.file_name.clone(),
                    expected: artifact.sha256.clone(),
                    actual: sha256,
                });
            }

            let signature = self.signer.sign(&result.distribution, &data).await?;
            let signature_file = signature_name(&artifact.file_name);
            tokio::fs::write(staging.join(&artifact.file_name), &data).await?;
            tokio::fs::write(staging.join(&signature_file), signature.armored.as_bytes()).await?;
            debug!("Staged {} signed by {}", artifact.file_name, signature.key_fingerprint);

            key_fingerprint.get_or_insert(signature.key_fingerprint);
            files.push(PublishedFile {
                name: artifact.file_name.clone(),
                size: data.len() as u64,
                sha256,
                signature: signature_file,
            });
        }

        let manifest: String = files
            .iter()
            .map(|file| format!("{}  {}\n", file.sha256, file.name))
            .collect();
        let manifest_signature = self
            .signer
            .sign(&result.distribution, manifest.as_bytes())
            .await?;
        tokio::fs::write(staging.join(MANIFEST_FILE), manifest.as_bytes()).await?;
        tokio::fs::write(
            staging.join(signature_name(MANIFEST_FILE)),
            manifest_signature.armored.as_bytes(),
        )
        .await?;

        let entry = RegistryEntry {
            id,
            format: result.format,
            distribution: result.distribution.clone(),
            artifact: result.artifact.clone(),
            version: result.version.clone(),
            files,
            manifest: Manifest {
                file: MANIFEST_FILE.to_string(),
                signature: signature_name(MANIFEST_FILE),
            },
            key_fingerprint: key_fingerprint.unwrap_or(manifest_signature.key_fingerprint),
            published_at: Utc::now(),
            build_id: result.build_id,
        };
        tokio::fs::write(staging.join(ENTRY_FILE), serde_json::to_vec_pretty(&entry)?).await?;
        Ok(entry)
    }

    /// Entries of an artifact, newest first
    pub async fn lookup(
        &self,
        format: PackageFormat,
        distribution: &str,
        artifact: &str,
        version: Option<&str>,
    ) -> Result<Vec<RegistryEntry>> {
        if !is_segment(distribution) || !is_segment(artifact) {
            return Ok(Vec::new());
        }
        let base = self.artifact_dir(format, distribution, artifact);
        let versions = match version {
            Some(v) if is_segment(v) => vec![v.to_string()],
            Some(_) => return Ok(Vec::new()),
            None => subdirectories(&base).await?,
        };

        let mut entries = Vec::new();
        for version in versions {
            let dir = base.join(&version);
            for id in subdirectories(&dir).await? {
                let raw = match tokio::fs::read(dir.join(&id).join(ENTRY_FILE)).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Skipping registry entry {}/{}: {}", dir.display(), id, e);
                        continue;
                    }
                };
                entries.push(serde_json::from_slice::<RegistryEntry>(&raw)?);
            }
        }

        entries.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(entries)
    }

    /// Newest entry of an artifact
    pub async fn latest(
        &self,
        format: PackageFormat,
        distribution: &str,
        artifact: &str,
        version: Option<&str>,
    ) -> Result<RegistryEntry> {
        self.lookup(format, distribution, artifact, version)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no published entry for {} in {}/{}",
                    artifact, format, distribution
                ))
            })
    }

    /// Path of a file of a published entry
    pub async fn open_file(
        &self,
        entry: &RegistryEntry,
        file: &str,
    ) -> Result<PathBuf> {
        let known = file == entry.manifest.file
            || file == entry.manifest.signature
            || entry
                .files
                .iter()
                .any(|f| f.name == file || f.signature == file);
        if !known {
            return Err(Error::NotFound(format!(
                "file {} is not part of entry {}",
                file, entry.id
            )));
        }

        let path = self
            .artifact_dir(entry.format, &entry.distribution, &entry.artifact)
            .join(&entry.version)
            .join(entry.id.to_string())
            .join(file);
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("file {} is missing", path.display())));
        }
        Ok(path)
    }

    /// One entry identified by its id
    pub async fn entry(
        &self,
        format: PackageFormat,
        distribution: &str,
        artifact: &str,
        version: &str,
        id: Uuid,
    ) -> Result<RegistryEntry> {
        self.lookup(format, distribution, artifact, Some(version))
            .await?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| Error::NotFound(format!("registry entry {}", id)))
    }

    /// Distributions with published artifacts in `format`
    pub async fn distributions(&self, format: PackageFormat) -> Result<Vec<String>> {
        subdirectories(&self.root.join(format.as_str())).await
    }

    /// Artifacts published for a distribution
    pub async fn artifacts(&self, format: PackageFormat, distribution: &str) -> Result<Vec<String>> {
        if !is_segment(distribution) {
            return Ok(Vec::new());
        }
        subdirectories(&self.root.join(format.as_str()).join(distribution)).await
    }
}
