//! Source patch queues
//!
//! Patches of an artifact live in `<definition>/patches/generic/` and
//! `<definition>/patches/<version>/`. Generic patches apply first, each
//! directory in file name order.

mod diff;

pub use diff::{ApplyError, Diff};

use fatbuildr_common::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const PATCHES_DIR: &str = "patches";
pub const GENERIC_DIR: &str = "generic";
pub const SERIES_FILE: &str = "series";

/// Whether a patch applies to every version or to one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchScope {
    Generic,
    Version,
}

#[derive(Debug, Clone, Serialize)]
pub struct Patch {
    /// File name in the definition
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    /// Name without numbering prefix and extension
    pub title: String,
    pub scope: PatchScope,
    /// deb822 header fields preceding the diff
    pub headers: Vec<(String, String)>,
    /// Raw patch, not necessarily UTF-8
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Patch {
    fn read(path: PathBuf, scope: PatchScope) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = fs::read(&path)?;
        Ok(Self {
            title: title_of(&name),
            headers: parse_headers(&String::from_utf8_lossy(&content)),
            name,
            path,
            scope,
            content,
        })
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, value)| value.as_str())
    }

    pub fn description(&self) -> Option<&str> {
        self.header("Description").or_else(|| self.header("Subject"))
    }
}

/// `0003-fix-build.patch` -> `fix-build`
fn title_of(name: &str) -> String {
    let stem = name.strip_suffix(".patch").unwrap_or(name);
    let title = match stem.split_once('-') {
        Some((number, rest)) if !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()) => {
            rest
        }
        _ => stem,
    };
    title.to_string()
}

fn is_diff_start(line: &str) -> bool {
    line.starts_with("--- ") || line.starts_with("diff ") || line.starts_with("Index: ")
}

/// Header fields before the diff, continuation lines folded in
fn parse_headers(content: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in content.lines().take_while(|line| !is_diff_start(line)) {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                let more = line.trim();
                if more != "." {
                    value.push('\n');
                    value.push_str(more);
                }
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if !name.is_empty() && !name.contains(' ') {
                headers.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    headers
}

/// Ordered patches of one artifact version
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchSet {
    pub version: String,
    pub patches: Vec<Patch>,
}

fn load_dir(dir: &Path, scope: PatchScope) -> Result<Vec<Patch>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    paths.into_iter().map(|path| Patch::read(path, scope)).collect()
}

impl PatchSet {
    /// Load the patches of `version` from an artifact definition directory
    pub fn load(definition_dir: &Path, version: &str) -> Result<Self> {
        let root = definition_dir.join(PATCHES_DIR);
        let mut patches = load_dir(&root.join(GENERIC_DIR), PatchScope::Generic)?;
        patches.extend(load_dir(&root.join(version), PatchScope::Version)?);
        debug!(
            "Loaded {} patch(es) for version {} from {}",
            patches.len(),
            version,
            root.display()
        );
        Ok(Self {
            version: version.to_string(),
            patches,
        })
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Relative paths of the exported patches, in application order
    pub fn series(&self) -> Vec<String> {
        let mut generic = 0;
        let mut versioned = 0;
        self.patches
            .iter()
            .map(|patch| {
                let (dir, counter) = match patch.scope {
                    PatchScope::Generic => (GENERIC_DIR, &mut generic),
                    PatchScope::Version => (self.version.as_str(), &mut versioned),
                };
                *counter += 1;
                format!("{}/{:04}-{}.patch", dir, counter, patch.title)
            })
            .collect()
    }
}

/// Patched copy of a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedSource {
    pub path: PathBuf,
    /// Names of the applied patches, in order
    pub applied: Vec<String>,
}

/// Copy the tree at `from` into `to`, which must not exist
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Other(e.into()))?;
        let target = to.join(relative);
        let kind = entry.file_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub struct PatchQueue;

impl PatchQueue {
    /// Apply `set` to a copy of `source` and promote the result to
    /// `destination`. `source` is never modified. On failure nothing is left
    /// at `destination`.
    pub fn apply(source: &Path, set: &PatchSet, destination: &Path) -> Result<PatchedSource> {
        let parent = destination.parent().ok_or_else(|| {
            Error::Configuration(format!("invalid patch destination {}", destination.display()))
        })?;
        fs::create_dir_all(parent)?;

        // removed on drop, whatever happens below
        let scratch = tempfile::Builder::new()
            .prefix(".patching-")
            .tempdir_in(parent)?;
        let tree = scratch.path().join("tree");
        copy_tree(source, &tree)?;

        let mut applied = Vec::with_capacity(set.len());
        for (index, patch) in set.patches.iter().enumerate() {
            let result = Diff::parse(&patch.content).and_then(|diff| diff.apply(&tree));
            if let Err(reason) = result {
                return Err(Error::PatchApply {
                    index: index + 1,
                    patch: patch.name.clone(),
                    reason: reason.to_string(),
                });
            }
            debug!("Applied patch {}", patch.name);
            applied.push(patch.name.clone());
        }

        if destination.exists() {
            fs::remove_dir_all(destination)?;
        }
        fs::rename(&tree, destination)?;
        info!(
            "Applied {} patch(es) on {}",
            applied.len(),
            destination.display()
        );

        Ok(PatchedSource {
            path: destination.to_path_buf(),
            applied,
        })
    }

    /// Write the patch queue as a directory tree with a `series` file
    pub fn export(set: &PatchSet, destination: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(set.len());
        for (patch, relative) in set.patches.iter().zip(set.series()) {
            let target = destination.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &patch.content)?;
            written.push(target);
        }

        let mut series = set.series().join("\n");
        if !series.is_empty() {
            series.push('\n');
        }
        fs::create_dir_all(destination)?;
        fs::write(destination.join(SERIES_FILE), series)?;
        Ok(written)
    }

    /// Same tree as [`PatchQueue::export`], as a gzipped tarball
    pub fn export_archive(set: &PatchSet) -> Result<Vec<u8>> {
        let staging = tempfile::tempdir()?;
        Self::export(set, staging.path())?;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.append_dir_all("patches", staging.path())?;
        let encoder = archive.into_inner()?;
        Ok(encoder.finish()?)
    }
}
