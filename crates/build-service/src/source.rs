//! Upstream source retrieval
//!
//! Tarballs are cached in `<cache>/<artifact>/<filename>` and verified
//! against the checksum of the artifact definition before every use.

use fatbuildr_common::{ArtifactDefinition, Checksum, ChecksumAlgorithm, Error, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory holding the tree of native artifacts without upstream source
pub const NATIVE_SOURCE_DIR: &str = "src";

pub struct SourceFetcher {
    cache_dir: PathBuf,
    client: reqwest::Client,
    /// One fetch at a time per cached file
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

/// Hex digest of a file with the given algorithm
pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    fn hash<D: Digest>(mut file: File) -> io::Result<String> {
        let mut hasher = D::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    let file = File::open(path)?;
    Ok(match algorithm {
        ChecksumAlgorithm::Sha256 => hash::<Sha256>(file)?,
        ChecksumAlgorithm::Sha512 => hash::<Sha512>(file)?,
    })
}

fn verify(path: &Path, expected: &Checksum) -> Result<()> {
    let actual = file_digest(path, expected.algorithm)?;
    if actual != expected.value {
        return Err(Error::Checksum {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            expected: expected.value.clone(),
            actual,
        });
    }
    Ok(())
}

/// Extract a tarball into `dest`. Returns the source root: the single
/// top-level directory of the archive when there is one, `dest` otherwise.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".tar") {
        Box::new(file)
    } else {
        return Err(Error::InvalidDefinition(format!(
            "unsupported source archive format: {}",
            name
        )));
    };

    fs::create_dir_all(dest)?;
    tar::Archive::new(reader).unpack(dest)?;

    let mut entries = fs::read_dir(dest)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(entry) = entries.pop() {
            return Ok(entry.path());
        }
    }
    Ok(dest.to_path_buf())
}

impl SourceFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            client: reqwest::Client::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Make sure the upstream tarball is in the cache and matches its
    /// checksum. Returns `None` for native artifacts.
    pub async fn fetch(&self, artifact: &ArtifactDefinition) -> Result<Option<PathBuf>> {
        let Some(origin) = &artifact.source else {
            return Ok(None);
        };
        let location = origin.render(&artifact.name, &artifact.version)?;
        let dir = self.cache_dir.join(&artifact.name);
        let cached = dir.join(&location.filename);

        let lock = self
            .locks
            .lock()
            .await
            .entry(cached.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if cached.is_file() {
            match &origin.checksum {
                Some(checksum) => {
                    let (path, expected) = (cached.clone(), checksum.clone());
                    let valid = tokio::task::spawn_blocking(move || verify(&path, &expected))
                        .await
                        .map_err(|e| Error::Other(e.into()))?;
                    match valid {
                        Ok(()) => {
                            debug!("Using cached tarball {}", cached.display());
                            return Ok(Some(cached));
                        }
                        Err(e) => warn!("Discarding cached tarball: {}", e),
                    }
                }
                None => {
                    debug!("Using cached tarball {} (no checksum)", cached.display());
                    return Ok(Some(cached));
                }
            }
        }

        tokio::fs::create_dir_all(&dir).await?;
        // removed on drop unless persisted
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{}.", location.filename))
            .suffix(".part")
            .tempfile_in(&dir)?;
        info!("Downloading {} to {}", location.url, cached.display());
        self.download(&location.url, partial.path()).await?;

        if let Some(checksum) = &origin.checksum {
            let (path, expected) = (partial.path().to_path_buf(), checksum.clone());
            tokio::task::spawn_blocking(move || verify(&path, &expected))
                .await
                .map_err(|e| Error::Other(e.into()))??;
        } else {
            warn!("No checksum declared for {}, tarball is not verified", artifact.name);
        }

        partial.persist(&cached).map_err(|e| Error::Io(e.error))?;
        Ok(Some(cached))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let local = url
            .strip_prefix("file://")
            .or_else(|| (!url.contains("://")).then_some(url));
        if let Some(path) = local {
            tokio::fs::copy(path, dest)
                .await
                .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;
            return Ok(());
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("failed to fetch {}: {}", url, e)))?
            .error_for_status()
            .map_err(|e| Error::Download(format!("unexpected response for {}: {}", url, e)))?;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Download(format!("failed to read {}: {}", url, e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Lay out the pristine source of `artifact` under `dest`. Upstream
    /// tarballs are fetched and extracted; native artifacts copy nothing and
    /// use `<definition>/src` when it exists.
    pub async fn prepare(
        &self,
        artifact: &ArtifactDefinition,
        definition_dir: &Path,
        dest: &Path,
    ) -> Result<PathBuf> {
        match self.fetch(artifact).await? {
            Some(tarball) => {
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || extract(&tarball, &dest))
                    .await
                    .map_err(|e| Error::Other(e.into()))?
            }
            None => {
                let native = definition_dir.join(NATIVE_SOURCE_DIR);
                if native.is_dir() {
                    Ok(native)
                } else {
                    tokio::fs::create_dir_all(dest).await?;
                    Ok(dest.to_path_buf())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatbuildr_common::SourceOrigin;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(dir: &Path) -> PathBuf {
        let tree = dir.join("hello-1.0");
        fs::create_dir_all(tree.join("src")).unwrap();
        fs::write(tree.join("VERSION"), "1.0\n").unwrap();
        fs::write(tree.join("src/main.c"), "int main;\n").unwrap();

        let path = dir.join("hello-1.0.tar.gz");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all("hello-1.0", &tree).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn artifact(url: String, checksum: Option<String>) -> ArtifactDefinition {
        ArtifactDefinition {
            name: "hello".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            format: fatbuildr_common::PackageFormat::Deb,
            distributions: vec!["bookworm".to_string()],
            architectures: Vec::new(),
            source: Some(SourceOrigin {
                url,
                checksum: checksum.map(|c| Checksum::try_from(c).unwrap()),
            }),
        }
    }

    #[tokio::test]
    async fn test_fetch_local_tarball_and_extract() {
        let upstream = tempfile::tempdir().unwrap();
        let path = tarball(upstream.path());
        let digest = file_digest(&path, ChecksumAlgorithm::Sha256).unwrap();
        let cache = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::new(cache.path());

        let def = artifact(
            format!("file://{}", path.display()),
            Some(format!("sha256:{}", digest)),
        );
        let cached = fetcher.fetch(&def).await.unwrap().unwrap();
        assert_eq!(cached, cache.path().join("hello/hello-1.0.tar.gz"));

        let work = tempfile::tempdir().unwrap();
        let root = fetcher
            .prepare(&def, upstream.path(), &work.path().join("pristine"))
            .await
            .unwrap();
        assert!(root.ends_with("pristine/hello-1.0"));
        assert_eq!(fs::read_to_string(root.join("VERSION")).unwrap(), "1.0\n");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_rejected() {
        let upstream = tempfile::tempdir().unwrap();
        let path = tarball(upstream.path());
        let cache = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::new(cache.path());

        let def = artifact(
            path.display().to_string(),
            Some(format!("sha256:{}", "0".repeat(64))),
        );
        let err = fetcher.fetch(&def).await.unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert!(!cache.path().join("hello/hello-1.0.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let upstream = tempfile::tempdir().unwrap();
        let path = tarball(upstream.path());
        let digest = file_digest(&path, ChecksumAlgorithm::Sha256).unwrap();
        let cache = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SourceFetcher::new(cache.path()));
        let def = artifact(
            format!("file://{}", path.display()),
            Some(format!("sha256:{}", digest)),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (fetcher, def) = (fetcher.clone(), def.clone());
                tokio::spawn(async move { fetcher.fetch(&def).await })
            })
            .collect();
        for handle in handles {
            let cached = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(cached, cache.path().join("hello/hello-1.0.tar.gz"));
        }

        // no partial download left behind
        let names: Vec<_> = fs::read_dir(cache.path().join("hello"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, ["hello-1.0.tar.gz"]);
        assert_eq!(
            file_digest(&cache.path().join("hello/hello-1.0.tar.gz"), ChecksumAlgorithm::Sha256)
                .unwrap(),
            digest
        );
    }

    #[tokio::test]
    async fn test_native_artifact_uses_definition_tree() {
        let def_dir = tempfile::tempdir().unwrap();
        fs::create_dir(def_dir.path().join(NATIVE_SOURCE_DIR)).unwrap();
        let mut def = artifact(String::new(), None);
        def.source = None;

        let fetcher = SourceFetcher::new(def_dir.path().join("cache"));
        assert!(fetcher.fetch(&def).await.unwrap().is_none());
        let root = fetcher
            .prepare(&def, def_dir.path(), &def_dir.path().join("unused"))
            .await
            .unwrap();
        assert_eq!(root, def_dir.path().join(NATIVE_SOURCE_DIR));
    }
}
