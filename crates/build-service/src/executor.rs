//! Build execution inside a ready environment

use fatbuildr_common::{BuildState, BuiltArtifact, ChecksumAlgorithm, Error, Result};
use fatbuildr_registry::BuildResult;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelSignal;
use crate::config::{FormatSettings, FormatsSettings};
use crate::container::{Bind, ContainerRuntime, RunOutcome, RunSpec};
use crate::images::EnvironmentHandle;
use crate::logstream::BuildLog;
use crate::models::BuildRequest;
use crate::patches::PatchedSource;
use crate::source::file_digest;

pub struct BuildExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    formats: FormatsSettings,
    definitions_dir: PathBuf,
    cache_dir: PathBuf,
}

/// Directories of one build
#[derive(Debug, Clone)]
pub struct BuildPlace {
    /// Working directory, bound read-write in the environment
    pub place: PathBuf,
    pub source: PatchedSource,
}

impl BuildExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        formats: FormatsSettings,
        definitions_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            formats,
            definitions_dir,
            cache_dir,
        }
    }

    fn format(&self, request: &BuildRequest) -> &FormatSettings {
        match request.artifact.format {
            fatbuildr_common::PackageFormat::Deb => &self.formats.deb,
            fatbuildr_common::PackageFormat::Rpm => &self.formats.rpm,
        }
    }

    fn render(&self, template: &str, request: &BuildRequest, place: &BuildPlace) -> String {
        let artifact = &request.artifact;
        let packaging = self
            .definitions_dir
            .join(&artifact.name)
            .join(artifact.format.as_str());
        template
            .replace("{source}", &place.source.path.display().to_string())
            .replace("{place}", &place.place.display().to_string())
            .replace("{packaging}", &packaging.display().to_string())
            .replace("{name}", &artifact.name)
            .replace("{version}", &artifact.version)
            .replace("{release}", &artifact.release)
            .replace("{distribution}", &request.key.distribution)
            .replace("{architecture}", &request.key.architecture)
            .replace("{cache}", &self.cache_dir.join(&artifact.name).display().to_string())
    }

    /// Run the packaging toolchain of `request` in `environment`. A non-zero
    /// exit is a `BuildTool` error carrying the log tail; cancellation yields
    /// a `Cancelled` result without artifacts.
    pub async fn run(
        &self,
        request: &BuildRequest,
        environment: &EnvironmentHandle,
        place: &BuildPlace,
        log: &BuildLog,
        cancel: &CancelSignal,
    ) -> Result<BuildResult> {
        let format = self.format(request);
        let script = self.render(&format.build_cmd, request, place);
        let artifact = &request.artifact;
        let cache = self.cache_dir.join(&artifact.name);
        tokio::fs::create_dir_all(&cache).await?;

        let mut spec = RunSpec::shell(environment.rootfs.clone(), &script, environment.policy);
        spec.binds = vec![
            Bind {
                path: place.place.clone(),
                read_only: false,
            },
            Bind {
                path: cache,
                read_only: true,
            },
            Bind {
                path: self.definitions_dir.join(&artifact.name),
                read_only: true,
            },
        ];
        spec.chdir = Some(place.place.clone());
        spec.env = vec![
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("FATBUILDR_BUILD_ID".to_string(), request.id.to_string()),
        ];
        spec.privilege = format.privilege.clone();

        log.line(&format!(
            "building {} {} for {} with {} runtime",
            artifact.name,
            artifact.full_version(),
            request.key,
            self.runtime.name()
        ))
        .await?;
        log.line(&format!("command: {}", script)).await?;

        let extensions = format.artifact_extensions.clone();
        let mut result = BuildResult {
            build_id: request.id,
            state: BuildState::Running,
            format: artifact.format,
            distribution: request.key.distribution.clone(),
            artifact: artifact.name.clone(),
            version: artifact.full_version(),
            artifacts: Vec::new(),
        };

        match self.runtime.run(&spec, log, cancel).await? {
            RunOutcome::Exited(0) => {
                let root = place.place.clone();
                let source = place.source.path.clone();
                let artifacts = tokio::task::spawn_blocking(move || {
                    collect_artifacts(&root, &source, &extensions)
                })
                .await
                .map_err(|e| Error::Other(e.into()))??;
                log.line(&format!("build succeeded, {} artifact(s)", artifacts.len()))
                    .await?;
                info!("Build {} produced {} artifact(s)", request.id, artifacts.len());
                result.state = BuildState::Succeeded;
                result.artifacts = artifacts;
                Ok(result)
            }
            RunOutcome::Exited(code) => {
                log.line(&format!("build failed with exit code {}", code)).await?;
                Err(Error::BuildTool {
                    exit_code: code,
                    log_excerpt: log.excerpt().await?,
                })
            }
            RunOutcome::Cancelled(reason) => {
                log.line(&format!("build {}", reason)).await?;
                let root = place.place.clone();
                let source = place.source.path.clone();
                let removed = tokio::task::spawn_blocking(move || {
                    discard_artifacts(&root, &source, &extensions)
                })
                .await
                .map_err(|e| Error::Other(e.into()))??;
                if removed > 0 {
                    warn!("Discarded {} partial artifact(s) of build {}", removed, request.id);
                }
                result.state = BuildState::Cancelled;
                Ok(result)
            }
        }
    }
}

/// Files below `root`, outside of `source`, with one of `extensions`
fn artifact_paths(root: &Path, source: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let extensions: HashSet<&str> = extensions.iter().map(String::as_str).collect();
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.path() != source)
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(ext))
        })
        .map(|entry| entry.into_path())
        .collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    paths
}

fn collect_artifacts(root: &Path, source: &Path, extensions: &[String]) -> Result<Vec<BuiltArtifact>> {
    artifact_paths(root, source, extensions)
        .into_iter()
        .map(|path| {
            let size = std::fs::metadata(&path)?.len();
            let sha256 = file_digest(&path, ChecksumAlgorithm::Sha256)?;
            Ok(BuiltArtifact {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
                size,
                sha256,
            })
        })
        .collect()
}

fn discard_artifacts(root: &Path, source: &Path, extensions: &[String]) -> Result<usize> {
    let paths = artifact_paths(root, source, extensions);
    for path in &paths {
        std::fs::remove_file(path)?;
    }
    Ok(paths.len())
}
