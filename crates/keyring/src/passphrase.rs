//! Key passphrases and the pluggable mechanism seeding them into agents

use async_trait::async_trait;
use fatbuildr_common::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::KeyInfo;

const PASSPHRASE_LEN: usize = 32;

/// Secret passphrase protecting a signing key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Random alphanumeric passphrase
    pub fn generate() -> Self {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSPHRASE_LEN)
            .map(char::from)
            .collect();
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

impl fmt::Display for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Hands a key passphrase over to whatever needs it to sign
/// non-interactively (typically a running gpg-agent).
#[async_trait]
pub trait PassphraseSeeder: Send + Sync {
    async fn seed(&self, home: &Path, key: &KeyInfo, passphrase: &Passphrase) -> Result<()>;
}

/// Seeder running an external program with the passphrase on stdin.
///
/// Arguments may reference `{keygrip}`, `{fingerprint}` and `{homedir}`.
/// The program location differs between host distributions
/// (`/usr/lib/gnupg/gpg-preset-passphrase` on Debian,
/// `/usr/libexec/gpg-preset-passphrase` on RHEL), so it always comes from
/// configuration.
#[derive(Debug, Clone)]
pub struct CommandSeeder {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSeeder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `gpg-preset-passphrase --preset {keygrip}` at the given location
    pub fn gpg_preset(program: impl Into<PathBuf>) -> Self {
        Self::new(program, vec!["--preset".to_string(), "{keygrip}".to_string()])
    }

    fn render_args(&self, home: &Path, key: &KeyInfo) -> Vec<String> {
        let homedir = home.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{keygrip}", &key.keygrip)
                    .replace("{fingerprint}", &key.fingerprint)
                    .replace("{homedir}", &homedir)
            })
            .collect()
    }
}

#[async_trait]
impl PassphraseSeeder for CommandSeeder {
    async fn seed(&self, home: &Path, key: &KeyInfo, passphrase: &Passphrase) -> Result<()> {
        let args = self.render_args(home, key);
        debug!("Seeding passphrase with {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("GNUPGHOME", home)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::KeyUnavailable(format!(
                    "unable to run passphrase seeder {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(passphrase.expose().as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::KeyUnavailable(format!(
                "passphrase seeder failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Seeder doing nothing, for backends that take the passphrase directly
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSeeder;

#[async_trait]
impl PassphraseSeeder for NoopSeeder {
    async fn seed(&self, _home: &Path, _key: &KeyInfo, _passphrase: &Passphrase) -> Result<()> {
        Ok(())
    }
}
