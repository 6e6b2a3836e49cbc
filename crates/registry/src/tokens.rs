//! API token store
//!
//! Tokens are random 256-bit secrets handed out once at issue time. Only
//! their SHA-256 digest is kept in `tokens.json`.

use chrono::{DateTime, Duration, Utc};
use fatbuildr_common::{Error, Result, TokenScope};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::RegistryAccess;

/// Stored token metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    pub label: String,
    pub scope: TokenScope,
    /// Hex encoded SHA-256 of the secret
    #[serde(rename = "digest")]
    pub secret_digest: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Freshly issued token. The secret is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub secret: String,
    pub record: TokenRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: Vec<TokenRecord>,
}

fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub struct TokenStore {
    path: PathBuf,
    tokens: RwLock<Vec<TokenRecord>>,
}

impl TokenStore {
    /// Load the store at `path`, starting empty if the file does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let parent = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::Configuration(format!(
                "token store directory {} is not reachable: {}",
                parent.display(),
                e
            ))
        })?;

        let tokens = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<TokenFile>(&raw)?.tokens,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "unable to read token store {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        info!("Loaded {} tokens from {}", tokens.len(), path.display());

        Ok(Self {
            path,
            tokens: RwLock::new(tokens),
        })
    }

    /// Create a token. `ttl` of `None` never expires.
    pub async fn issue(
        &self,
        scope: TokenScope,
        label: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);

        let now = Utc::now();
        let record = TokenRecord {
            id: Uuid::new_v4(),
            label: label.into(),
            scope,
            secret_digest: digest(&secret),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        };

        let mut tokens = self.tokens.write().await;
        tokens.push(record.clone());
        self.persist(&tokens).await?;
        info!("Issued {} token {} ({})", scope, record.id, record.label);

        Ok(IssuedToken { secret, record })
    }

    /// Record of a valid, unexpired token
    pub async fn validate(&self, secret: &str) -> Option<TokenRecord> {
        let wanted = digest(secret);
        let now = Utc::now();
        self.tokens
            .read()
            .await
            .iter()
            .find(|record| record.secret_digest == wanted)
            .filter(|record| !record.is_expired(now))
            .cloned()
    }

    /// Check that `secret` grants `required`
    pub async fn authorize(&self, secret: &str, required: TokenScope) -> Result<TokenRecord> {
        let record = self
            .validate(secret)
            .await
            .ok_or_else(|| Error::Authorization("invalid or expired token".to_string()))?;
        if !record.scope.allows(required) {
            debug!(
                "Token {} with scope {} denied {} operation",
                record.id, record.scope, required
            );
            return Err(Error::Authorization(format!(
                "token scope {} does not grant {}",
                record.scope, required
            )));
        }
        Ok(record)
    }

    /// Check registry read access for an optional token
    pub async fn authorize_registry(
        &self,
        access: RegistryAccess,
        secret: Option<&str>,
    ) -> Result<()> {
        match (access, secret) {
            (RegistryAccess::Public, _) => Ok(()),
            (RegistryAccess::Private, Some(secret)) => {
                self.authorize(secret, TokenScope::Read).await.map(|_| ())
            }
            (RegistryAccess::Private, None) => Err(Error::Authorization(
                "registry is private, a token is required".to_string(),
            )),
        }
    }

    /// Remove a token. Returns whether it existed.
    pub async fn revoke(&self, id: Uuid) -> Result<bool> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|record| record.id != id);
        if tokens.len() == before {
            return Ok(false);
        }
        self.persist(&tokens).await?;
        info!("Revoked token {}", id);
        Ok(true)
    }

    pub async fn list(&self) -> Vec<TokenRecord> {
        self.tokens.read().await.clone()
    }

    /// Write the current state to disk
    pub async fn flush(&self) -> Result<()> {
        let tokens = self.tokens.read().await;
        self.persist(&tokens).await
    }

    async fn persist(&self, tokens: &[TokenRecord]) -> Result<()> {
        let file = TokenFile {
            tokens: tokens.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = TokenStore::open(&path).await.unwrap();
        let issued = store
            .issue(TokenScope::BuildTrigger, "ci", None)
            .await
            .unwrap();
        assert_eq!(issued.secret.len(), 64);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(&issued.secret));

        let reopened = TokenStore::open(&path).await.unwrap();
        let record = reopened.validate(&issued.secret).await.unwrap();
        assert_eq!(record.id, issued.record.id);
        assert!(reopened.validate("not-a-token").await.is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();
        let reader = store.issue(TokenScope::Read, "viewer", None).await.unwrap();
        let admin = store.issue(TokenScope::Admin, "root", None).await.unwrap();

        let err = store
            .authorize(&reader.secret, TokenScope::BuildTrigger)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "authorization");
        assert!(store
            .authorize(&admin.secret, TokenScope::BuildTrigger)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_and_revoked_tokens_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();

        let expired = store
            .issue(TokenScope::Admin, "old", Some(Duration::seconds(-1)))
            .await
            .unwrap();
        assert!(store.validate(&expired.secret).await.is_none());

        let token = store.issue(TokenScope::Read, "temp", None).await.unwrap();
        assert!(store.revoke(token.record.id).await.unwrap());
        assert!(!store.revoke(token.record.id).await.unwrap());
        assert!(store.validate(&token.secret).await.is_none());
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_private_registry_requires_read_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();
        let reader = store.issue(TokenScope::Read, "viewer", None).await.unwrap();

        assert!(store
            .authorize_registry(RegistryAccess::Public, None)
            .await
            .is_ok());
        assert!(store
            .authorize_registry(RegistryAccess::Private, None)
            .await
            .is_err());
        assert!(store
            .authorize_registry(RegistryAccess::Private, Some(&reader.secret))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let result = TokenStore::open(blocker.join("tokens.json")).await;
        assert_eq!(result.err().unwrap().category(), "configuration");
    }
}
