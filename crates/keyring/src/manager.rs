//! Keyring manager: owns the key homes of one Fatbuildr instance

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fatbuildr_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{KeyBackend, KeyInfo, KeySpec};
use crate::config::{KeyScopeMode, KeyringConfig};
use crate::passphrase::{Passphrase, PassphraseSeeder};

const PASSPHRASE_FILE: &str = "passphrase";

/// Which key a signing operation uses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyScope {
    Instance(String),
    Distribution {
        instance: String,
        distribution: String,
    },
}

impl KeyScope {
    fn home(&self, storage: &Path) -> PathBuf {
        match self {
            KeyScope::Instance(instance) => storage.join(instance).join("instance"),
            KeyScope::Distribution {
                instance,
                distribution,
            } => storage
                .join(instance)
                .join("distributions")
                .join(distribution),
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScope::Instance(instance) => write!(f, "{}", instance),
            KeyScope::Distribution {
                instance,
                distribution,
            } => write!(f, "{}/{}", instance, distribution),
        }
    }
}

/// Parameters of [`KeyringManager::create_key`]
#[derive(Debug, Clone)]
pub struct KeyParams {
    pub scope: KeyScope,
    pub userid: String,
    /// Replace an existing key
    pub force: bool,
}

/// Loaded key with the location of its home
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyHandle {
    pub scope: KeyScope,
    #[serde(skip)]
    pub home: PathBuf,
    pub info: KeyInfo,
}

/// Detached ASCII-armored signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub key_fingerprint: String,
    pub armored: String,
    pub created_at: DateTime<Utc>,
}

/// Sole owner of private key material
pub struct KeyringManager {
    config: KeyringConfig,
    instance: String,
    backend: Arc<dyn KeyBackend>,
    seeder: Arc<dyn PassphraseSeeder>,
    keys: RwLock<HashMap<KeyScope, KeyHandle>>,
    creation: Mutex<()>,
}

impl KeyringManager {
    /// Open the keyring storage, creating it with mode 0700 if missing
    pub async fn init(
        config: KeyringConfig,
        instance: impl Into<String>,
        backend: Arc<dyn KeyBackend>,
        seeder: Arc<dyn PassphraseSeeder>,
    ) -> Result<Self> {
        let storage = &config.storage;
        let unreachable = |e: std::io::Error| {
            Error::Configuration(format!(
                "keyring storage {} is not reachable: {}",
                storage.display(),
                e
            ))
        };

        tokio::fs::create_dir_all(storage).await.map_err(unreachable)?;
        tokio::fs::set_permissions(storage, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(unreachable)?;

        info!("Keyring storage ready at {}", storage.display());

        Ok(Self {
            config,
            instance: instance.into(),
            backend,
            seeder,
            keys: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &KeyringConfig {
        &self.config
    }

    /// Key scope used to sign artifacts of `distribution`
    pub fn scope_for(&self, distribution: &str) -> KeyScope {
        match self.config.scope {
            KeyScopeMode::Instance => KeyScope::Instance(self.instance.clone()),
            KeyScopeMode::Distribution => KeyScope::Distribution {
                instance: self.instance.clone(),
                distribution: distribution.to_string(),
            },
        }
    }

    /// Scope of the instance-wide key
    pub fn instance_scope(&self) -> KeyScope {
        KeyScope::Instance(self.instance.clone())
    }

    pub async fn create_key(&self, params: KeyParams) -> Result<KeyHandle> {
        let _creating = self.creation.lock().await;
        let home = params.scope.home(&self.config.storage);

        if self.backend.inspect(&home).await?.is_some() {
            if !params.force {
                return Err(Error::KeyExists(format!(
                    "a key already exists for {}",
                    params.scope
                )));
            }
            warn!("Replacing existing key of {}", params.scope);
            self.backend.release(&home).await?;
            tokio::fs::remove_dir_all(&home).await?;
            self.keys.write().await.remove(&params.scope);
        } else if home.exists() {
            // leftovers of an interrupted creation
            tokio::fs::remove_dir_all(&home).await?;
        }

        tokio::fs::create_dir_all(&home).await?;
        tokio::fs::set_permissions(&home, std::fs::Permissions::from_mode(0o700)).await?;

        let passphrase = Passphrase::generate();
        write_passphrase(&home, &passphrase).await?;

        let spec = KeySpec {
            userid: params.userid.clone(),
            algorithm: self.config.algorithm(),
            expires: self.config.expires,
        };
        let info = self.backend.generate(&home, &spec, &passphrase).await?;
        info!(
            "Created {} key {} for {}",
            info.algorithm, info.fingerprint, params.scope
        );

        let handle = KeyHandle {
            scope: params.scope.clone(),
            home,
            info,
        };
        self.keys
            .write()
            .await
            .insert(params.scope, handle.clone());
        Ok(handle)
    }

    /// Load the key of `scope`
    pub async fn key(&self, scope: &KeyScope) -> Result<KeyHandle> {
        if let Some(handle) = self.keys.read().await.get(scope) {
            return Ok(handle.clone());
        }

        let home = scope.home(&self.config.storage);
        let info = self
            .backend
            .inspect(&home)
            .await?
            .ok_or_else(|| Error::KeyUnavailable(format!("no key exists for {}", scope)))?;

        debug!("Loaded key {} for {}", info.fingerprint, scope);
        let handle = KeyHandle {
            scope: scope.clone(),
            home,
            info,
        };
        self.keys
            .write()
            .await
            .insert(scope.clone(), handle.clone());
        Ok(handle)
    }

    /// Detached signature of `blob` made with the signing subkey of `handle`
    pub async fn sign(&self, blob: &[u8], handle: &KeyHandle) -> Result<Signature> {
        let now = Utc::now();
        if handle.info.is_expired(now) {
            return Err(Error::KeyUnavailable(format!(
                "key {} of {} has expired",
                handle.info.fingerprint, handle.scope
            )));
        }
        let passphrase = self.seed_passphrase(handle).await?;
        let armored = self
            .backend
            .sign(&handle.home, &handle.info, &passphrase, blob)
            .await?;

        Ok(Signature {
            key_fingerprint: handle.info.fingerprint.clone(),
            armored,
            created_at: now,
        })
    }

    /// Hand the passphrase of `handle` over to the configured seeder
    pub async fn seed_passphrase(&self, handle: &KeyHandle) -> Result<Passphrase> {
        let passphrase = read_passphrase(&handle.home).await?;
        self.seeder
            .seed(&handle.home, &handle.info, &passphrase)
            .await?;
        debug!("Passphrase of key {} seeded", handle.info.fingerprint);
        Ok(passphrase)
    }

    pub async fn export_public(&self, handle: &KeyHandle) -> Result<String> {
        self.backend.export_public(&handle.home, &handle.info).await
    }

    /// Release backend resources of every loaded key
    pub async fn shutdown(&self) -> Result<()> {
        let keys = self.keys.read().await;
        for handle in keys.values() {
            if let Err(e) = self.backend.release(&handle.home).await {
                warn!("Unable to release key home of {}: {}", handle.scope, e);
            }
        }
        Ok(())
    }
}

async fn write_passphrase(home: &Path, passphrase: &Passphrase) -> Result<()> {
    let path = home.join(PASSPHRASE_FILE);
    tokio::fs::write(&path, passphrase.expose()).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400)).await?;
    Ok(())
}

async fn read_passphrase(home: &Path) -> Result<Passphrase> {
    let path = home.join(PASSPHRASE_FILE);
    let secret = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::KeyUnavailable(format!(
            "unable to read passphrase {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(Passphrase::new(secret.trim_end()))
}

/// Produces signatures for published artifacts
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `blob` with the key serving `distribution`
    async fn sign(&self, distribution: &str, blob: &[u8]) -> Result<Signature>;
}

/// [`Signer`] backed by the instance keyring
#[derive(Clone)]
pub struct KeyringSigner {
    keyring: Arc<KeyringManager>,
}

impl KeyringSigner {
    pub fn new(keyring: Arc<KeyringManager>) -> Self {
        Self { keyring }
    }
}

#[async_trait]
impl Signer for KeyringSigner {
    async fn sign(&self, distribution: &str, blob: &[u8]) -> Result<Signature> {
        let scope = self.keyring.scope_for(distribution);
        let handle = self.keyring.key(&scope).await?;
        self.keyring.sign(blob, &handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passphrase::NoopSeeder;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stores key info as JSON and "signs" with a digest of passphrase and blob
    #[derive(Default)]
    struct FakeBackend {
        generated: AtomicUsize,
    }

    #[async_trait]
    impl KeyBackend for FakeBackend {
        async fn generate(
            &self,
            home: &Path,
            spec: &KeySpec,
            _passphrase: &Passphrase,
        ) -> Result<KeyInfo> {
            let n = self.generated.fetch_add(1, Ordering::SeqCst);
            let info = KeyInfo {
                userid: spec.userid.clone(),
                fingerprint: format!("FPR{:04}", n),
                subkey_fingerprint: format!("SUB{:04}", n),
                keygrip: format!("GRIP{:04}", n),
                algorithm: spec.algorithm.clone(),
                created_at: Utc::now(),
                expires_at: None,
            };
            tokio::fs::write(home.join("key.json"), serde_json::to_vec(&info)?).await?;
            Ok(info)
        }

        async fn inspect(&self, home: &Path) -> Result<Option<KeyInfo>> {
            match tokio::fs::read(home.join("key.json")).await {
                Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }

        async fn sign(
            &self,
            _home: &Path,
            key: &KeyInfo,
            passphrase: &Passphrase,
            blob: &[u8],
        ) -> Result<String> {
            let mut hasher = Sha256::new();
            hasher.update(passphrase.expose().as_bytes());
            hasher.update(blob);
            Ok(format!(
                "-----BEGIN PGP SIGNATURE-----\n{}:{}\n-----END PGP SIGNATURE-----\n",
                key.subkey_fingerprint,
                hex::encode(hasher.finalize())
            ))
        }

        async fn export_public(&self, _home: &Path, key: &KeyInfo) -> Result<String> {
            Ok(format!("PUBLIC {}", key.fingerprint))
        }
    }

    async fn manager(dir: &Path, mode: KeyScopeMode) -> KeyringManager {
        seeded_manager(dir, mode, Arc::new(NoopSeeder)).await
    }

    async fn seeded_manager(
        dir: &Path,
        mode: KeyScopeMode,
        seeder: Arc<dyn PassphraseSeeder>,
    ) -> KeyringManager {
        let mut config = KeyringConfig::new(dir.join("keyring"));
        config.scope = mode;
        KeyringManager::init(config, "default", Arc::new(FakeBackend::default()), seeder)
            .await
            .unwrap()
    }

    /// Records the keys and passphrases it was handed
    #[derive(Default)]
    struct RecordingSeeder {
        seeded: std::sync::Mutex<Vec<(String, Passphrase)>>,
    }

    #[async_trait]
    impl PassphraseSeeder for RecordingSeeder {
        async fn seed(&self, _home: &Path, key: &KeyInfo, passphrase: &Passphrase) -> Result<()> {
            self.seeded
                .lock()
                .unwrap()
                .push((key.keygrip.clone(), passphrase.clone()));
            Ok(())
        }
    }

    /// Seeder whose agent is unreachable
    struct FailingSeeder;

    #[async_trait]
    impl PassphraseSeeder for FailingSeeder {
        async fn seed(&self, _home: &Path, _key: &KeyInfo, _passphrase: &Passphrase) -> Result<()> {
            Err(Error::KeyUnavailable("agent is not running".to_string()))
        }
    }

    fn params(scope: KeyScope, force: bool) -> KeyParams {
        KeyParams {
            scope,
            userid: "Fatbuildr <builder@example.org>".to_string(),
            force,
        }
    }

    #[tokio::test]
    async fn test_create_key_protects_storage_and_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = manager(dir.path(), KeyScopeMode::Instance).await;

        let storage_mode = std::fs::metadata(dir.path().join("keyring"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(storage_mode & 0o777, 0o700);

        let handle = keyring
            .create_key(params(keyring.instance_scope(), false))
            .await
            .unwrap();
        assert_eq!(handle.info.algorithm, "rsa4096");

        let passphrase_mode = std::fs::metadata(handle.home.join(PASSPHRASE_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(passphrase_mode & 0o777, 0o400);
        let home_mode = std::fs::metadata(&handle.home).unwrap().permissions().mode();
        assert_eq!(home_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_existing_key_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = manager(dir.path(), KeyScopeMode::Instance).await;
        let scope = keyring.instance_scope();

        let first = keyring.create_key(params(scope.clone(), false)).await.unwrap();
        let err = keyring
            .create_key(params(scope.clone(), false))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "key_exists");

        let second = keyring.create_key(params(scope.clone(), true)).await.unwrap();
        assert_ne!(first.info.fingerprint, second.info.fingerprint);
        assert_eq!(keyring.key(&scope).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = manager(dir.path(), KeyScopeMode::Instance).await;
        let err = keyring.key(&keyring.instance_scope()).await.unwrap_err();
        assert_eq!(err.category(), "key_unavailable");
    }

    #[tokio::test]
    async fn test_sign_seeds_the_stored_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let seeder = Arc::new(RecordingSeeder::default());
        let keyring = seeded_manager(dir.path(), KeyScopeMode::Instance, seeder.clone()).await;
        let handle = keyring
            .create_key(params(keyring.instance_scope(), false))
            .await
            .unwrap();
        let stored = read_passphrase(&handle.home).await.unwrap();

        keyring.sign(b"payload", &handle).await.unwrap();
        keyring.sign(b"other payload", &handle).await.unwrap();

        let seeded = seeder.seeded.lock().unwrap().clone();
        assert_eq!(seeded.len(), 2);
        assert!(seeded
            .iter()
            .all(|(keygrip, passphrase)| *keygrip == handle.info.keygrip && *passphrase == stored));
    }

    #[tokio::test]
    async fn test_sign_fails_when_seeding_fails() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = seeded_manager(dir.path(), KeyScopeMode::Instance, Arc::new(FailingSeeder)).await;
        let handle = keyring
            .create_key(params(keyring.instance_scope(), false))
            .await
            .unwrap();

        let err = keyring.sign(b"payload", &handle).await.unwrap_err();
        assert_eq!(err.category(), "key_unavailable");
    }

    #[tokio::test]
    async fn test_sign_with_lost_passphrase_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = manager(dir.path(), KeyScopeMode::Instance).await;
        let handle = keyring
            .create_key(params(keyring.instance_scope(), false))
            .await
            .unwrap();

        let signature = keyring.sign(b"payload", &handle).await.unwrap();
        assert_eq!(signature.key_fingerprint, handle.info.fingerprint);
        assert!(signature.armored.contains("BEGIN PGP SIGNATURE"));

        std::fs::remove_file(handle.home.join(PASSPHRASE_FILE)).unwrap();
        let err = keyring.sign(b"payload", &handle).await.unwrap_err();
        assert_eq!(err.category(), "key_unavailable");
    }

    #[tokio::test]
    async fn test_distribution_scoped_signer() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = Arc::new(manager(dir.path(), KeyScopeMode::Distribution).await);

        let bookworm = keyring
            .create_key(params(keyring.scope_for("bookworm"), false))
            .await
            .unwrap();
        let el8 = keyring
            .create_key(params(keyring.scope_for("el8"), false))
            .await
            .unwrap();
        assert_ne!(bookworm.home, el8.home);

        let signer = KeyringSigner::new(keyring.clone());
        let signature = signer.sign("el8", b"rpm").await.unwrap();
        assert_eq!(signature.key_fingerprint, el8.info.fingerprint);

        let err = signer.sign("trixie", b"deb").await.unwrap_err();
        assert_eq!(err.category(), "key_unavailable");
    }

    #[tokio::test]
    async fn test_unreachable_storage_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let result = KeyringManager::init(
            KeyringConfig::new(blocker.join("keyring")),
            "default",
            Arc::new(FakeBackend::default()),
            Arc::new(NoopSeeder),
        )
        .await;
        assert_eq!(result.err().unwrap().category(), "configuration");
    }
}
