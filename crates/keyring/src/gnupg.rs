//! GnuPG backend driving the `gpg` program
//!
//! Every call runs `gpg` in batch mode against the key home directory. The
//! passphrase is always sent over stdin with loopback pinentry, never on
//! the command line.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fatbuildr_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{KeyBackend, KeyInfo, KeySpec};
use crate::config::KeyExpiry;
use crate::passphrase::Passphrase;

/// Backend storing keys in GnuPG home directories
#[derive(Debug, Clone)]
pub struct GnupgBackend {
    gpg: PathBuf,
    gpgconf: PathBuf,
}

impl Default for GnupgBackend {
    fn default() -> Self {
        Self::new("gpg", "gpgconf")
    }
}

impl GnupgBackend {
    pub fn new(gpg: impl Into<PathBuf>, gpgconf: impl Into<PathBuf>) -> Self {
        Self {
            gpg: gpg.into(),
            gpgconf: gpgconf.into(),
        }
    }

    async fn gpg(&self, home: &Path, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.gpg);
        command
            .arg("--homedir")
            .arg(home)
            .arg("--batch")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("run cmd: {} {}", self.gpg.display(), args.join(" "));

        let mut child = command
            .spawn()
            .map_err(|e| anyhow!("unable to run {}: {}", self.gpg.display(), e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Other(anyhow!(
                "gpg {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn list(&self, home: &Path) -> Result<Vec<ListedKey>> {
        let args = [
            "--with-colons".to_string(),
            "--with-keygrip".to_string(),
            "--list-secret-keys".to_string(),
        ];
        let output = self.gpg(home, &args, None).await?;
        parse_colons(&String::from_utf8_lossy(&output))
    }
}

fn expiry_arg(expires: KeyExpiry) -> String {
    match expires {
        KeyExpiry::Never => "never".to_string(),
        KeyExpiry::After(secs) => format!("seconds={}", secs),
    }
}

fn loopback_args() -> Vec<String> {
    vec![
        "--pinentry-mode".to_string(),
        "loopback".to_string(),
        "--passphrase-fd".to_string(),
        "0".to_string(),
    ]
}

#[async_trait]
impl KeyBackend for GnupgBackend {
    async fn generate(
        &self,
        home: &Path,
        spec: &KeySpec,
        passphrase: &Passphrase,
    ) -> Result<KeyInfo> {
        let expire = expiry_arg(spec.expires);

        let mut args = loopback_args();
        args.extend([
            "--quick-generate-key".to_string(),
            spec.userid.clone(),
            spec.algorithm.clone(),
            "cert".to_string(),
            expire.clone(),
        ]);
        self.gpg(home, &args, Some(passphrase.expose().as_bytes()))
            .await?;

        let master = self
            .list(home)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no key found in {} after generation", home.display()))?;
        info!("Key generated for user '{}' with fingerprint {}", spec.userid, master.fingerprint);

        let mut args = loopback_args();
        args.extend([
            "--quick-add-key".to_string(),
            master.fingerprint.clone(),
            spec.algorithm.clone(),
            "sign".to_string(),
            expire,
        ]);
        self.gpg(home, &args, Some(passphrase.expose().as_bytes()))
            .await?;

        let key = self
            .inspect(home)
            .await?
            .ok_or_else(|| anyhow!("no key found in {} after generation", home.display()))?;
        info!("Subkey generated for signature with fingerprint {}", key.subkey_fingerprint);
        Ok(key)
    }

    async fn inspect(&self, home: &Path) -> Result<Option<KeyInfo>> {
        if !home.exists() {
            return Ok(None);
        }
        let mut keys = self.list(home).await?;
        match keys.len() {
            0 => Ok(None),
            1 => keys.remove(0).into_key_info().map(Some),
            _ => Err(Error::KeyUnavailable(format!(
                "multiple keys found in keyring {}",
                home.display()
            ))),
        }
    }

    async fn sign(
        &self,
        home: &Path,
        key: &KeyInfo,
        passphrase: &Passphrase,
        blob: &[u8],
    ) -> Result<String> {
        let scratch = tempfile::tempdir()?;
        let input = scratch.path().join("blob");
        tokio::fs::write(&input, blob).await?;

        let mut args = loopback_args();
        args.extend([
            "--yes".to_string(),
            "--armor".to_string(),
            "--local-user".to_string(),
            format!("{}!", key.subkey_fingerprint),
            "--output".to_string(),
            "-".to_string(),
            "--detach-sign".to_string(),
            input.to_string_lossy().to_string(),
        ]);

        let output = self
            .gpg(home, &args, Some(passphrase.expose().as_bytes()))
            .await
            .map_err(|e| Error::KeyUnavailable(e.to_string()))?;
        String::from_utf8(output)
            .map_err(|e| Error::Other(anyhow!("gpg produced a non UTF-8 signature: {}", e)))
    }

    async fn export_public(&self, home: &Path, key: &KeyInfo) -> Result<String> {
        let args = [
            "--armor".to_string(),
            "--export".to_string(),
            key.fingerprint.clone(),
        ];
        let output = self.gpg(home, &args, None).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn release(&self, home: &Path) -> Result<()> {
        if !home.join("S.gpg-agent").exists() {
            return Ok(());
        }
        debug!("Stopping gpg-agent of {}", home.display());
        let status = Command::new(&self.gpgconf)
            .arg("--homedir")
            .arg(home)
            .args(["--kill", "gpg-agent"])
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Other(anyhow!(
                "unable to stop gpg-agent in {}: {}",
                home.display(),
                status
            )));
        }
        Ok(())
    }
}

/// Key as reported by `gpg --with-colons --list-secret-keys`
#[derive(Debug, Default, Clone)]
struct ListedKey {
    fingerprint: String,
    keygrip: String,
    algorithm: String,
    created: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    userids: Vec<String>,
    subkeys: Vec<ListedSubkey>,
}

#[derive(Debug, Default, Clone)]
struct ListedSubkey {
    fingerprint: String,
    keygrip: String,
    can_sign: bool,
}

impl ListedKey {
    fn into_key_info(self) -> Result<KeyInfo> {
        let unavailable = |reason: String| Error::KeyUnavailable(reason);

        if self.userids.len() != 1 {
            return Err(unavailable(format!(
                "expected exactly one uid on key {}, found {}",
                self.fingerprint,
                self.userids.len()
            )));
        }
        let signing: Vec<&ListedSubkey> = self.subkeys.iter().filter(|s| s.can_sign).collect();
        let [subkey] = signing.as_slice() else {
            return Err(unavailable(format!(
                "expected exactly one signing subkey on key {}, found {}",
                self.fingerprint,
                signing.len()
            )));
        };

        Ok(KeyInfo {
            userid: self.userids[0].clone(),
            subkey_fingerprint: subkey.fingerprint.clone(),
            keygrip: subkey.keygrip.clone(),
            fingerprint: self.fingerprint,
            algorithm: self.algorithm,
            created_at: self.created.unwrap_or_else(Utc::now),
            expires_at: self.expires,
        })
    }
}

fn parse_timestamp(field: Option<&str>) -> Option<DateTime<Utc>> {
    field
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn algorithm_name(algo: &str, length: &str) -> String {
    match algo {
        "1" => format!("rsa{}", length),
        "17" => format!("dsa{}", length),
        "22" => "ed25519".to_string(),
        other => format!("algo{}", other),
    }
}

enum Record {
    None,
    Master,
    Subkey,
}

fn parse_colons(output: &str) -> Result<Vec<ListedKey>> {
    let mut keys: Vec<ListedKey> = Vec::new();
    let mut current = Record::None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("sec") => {
                keys.push(ListedKey {
                    algorithm: algorithm_name(
                        fields.get(3).copied().unwrap_or_default(),
                        fields.get(2).copied().unwrap_or_default(),
                    ),
                    created: parse_timestamp(fields.get(5).copied()),
                    expires: parse_timestamp(fields.get(6).copied()),
                    ..Default::default()
                });
                current = Record::Master;
            }
            Some("ssb") => {
                let key = keys
                    .last_mut()
                    .ok_or_else(|| anyhow!("subkey listed before any master key"))?;
                key.subkeys.push(ListedSubkey {
                    can_sign: fields.get(11).is_some_and(|caps| caps.contains('s')),
                    ..Default::default()
                });
                current = Record::Subkey;
            }
            Some(kind @ ("fpr" | "grp")) => {
                let value = fields.get(9).copied().unwrap_or_default().to_string();
                let Some(key) = keys.last_mut() else { continue };
                match (&current, kind) {
                    (Record::Master, "fpr") => key.fingerprint = value,
                    (Record::Master, _) => key.keygrip = value,
                    (Record::Subkey, "fpr") => {
                        if let Some(sub) = key.subkeys.last_mut() {
                            sub.fingerprint = value;
                        }
                    }
                    (Record::Subkey, _) => {
                        if let Some(sub) = key.subkeys.last_mut() {
                            sub.keygrip = value;
                        }
                    }
                    (Record::None, _) => {}
                }
            }
            Some("uid") => {
                if let Some(key) = keys.last_mut() {
                    key.userids
                        .push(fields.get(9).copied().unwrap_or_default().to_string());
                }
            }
            _ => {}
        }
    }

    Ok(keys)
}
