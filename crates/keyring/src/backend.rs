//! Key material backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fatbuildr_common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::KeyExpiry;
use crate::passphrase::Passphrase;

/// Parameters of a key to generate
#[derive(Debug, Clone)]
pub struct KeySpec {
    pub userid: String,
    pub algorithm: String,
    pub expires: KeyExpiry,
}

/// Public information about a master key and its signing subkey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub userid: String,

    /// Master key fingerprint
    pub fingerprint: String,

    /// Signing subkey fingerprint
    pub subkey_fingerprint: String,

    /// Keygrip of the signing subkey, used to preset its passphrase
    pub keygrip: String,

    pub algorithm: String,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Storage and cryptographic operations on one key home directory.
///
/// Implementations own the on-disk format of the key material; callers only
/// ever see [`KeyInfo`] and armored outputs.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Generate a master key and a signing subkey in `home`
    async fn generate(&self, home: &Path, spec: &KeySpec, passphrase: &Passphrase)
        -> Result<KeyInfo>;

    /// Describe the key stored in `home`, if any
    async fn inspect(&self, home: &Path) -> Result<Option<KeyInfo>>;

    /// Produce an armored detached signature of `blob` with the signing subkey
    async fn sign(
        &self,
        home: &Path,
        key: &KeyInfo,
        passphrase: &Passphrase,
        blob: &[u8],
    ) -> Result<String>;

    /// Armored public key
    async fn export_public(&self, home: &Path, key: &KeyInfo) -> Result<String>;

    /// Release resources bound to `home` (agents, sockets)
    async fn release(&self, _home: &Path) -> Result<()> {
        Ok(())
    }
}
