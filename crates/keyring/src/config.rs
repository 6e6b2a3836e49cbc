//! Keyring settings

use fatbuildr_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

const DAY_SECS: u64 = 86_400;

/// Keyring settings for one Fatbuildr installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// Root directory holding one GnuPG home per key scope
    pub storage: PathBuf,

    /// Public key algorithm family (e.g. `rsa`)
    #[serde(default = "default_key_type")]
    pub key_type: String,

    /// Key size in bits
    #[serde(default = "default_key_size")]
    pub size: u32,

    /// Key expiry policy
    #[serde(default)]
    pub expires: KeyExpiry,

    /// Whether keys are shared by the instance or held per distribution
    #[serde(default)]
    pub scope: KeyScopeMode,
}

fn default_key_type() -> String {
    "rsa".to_string()
}

fn default_key_size() -> u32 {
    4096
}

impl KeyringConfig {
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self {
            storage: storage.into(),
            key_type: default_key_type(),
            size: default_key_size(),
            expires: KeyExpiry::Never,
            scope: KeyScopeMode::Instance,
        }
    }

    /// Algorithm name in GnuPG notation, e.g. `rsa4096`
    pub fn algorithm(&self) -> String {
        format!("{}{}", self.key_type, self.size)
    }
}

/// Granularity of signing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScopeMode {
    /// One key for the whole instance
    #[default]
    Instance,
    /// One key per distribution registry
    Distribution,
}

/// Key expiry policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyExpiry {
    #[default]
    Never,
    /// Expire this many seconds after creation
    After(u64),
}

impl FromStr for KeyExpiry {
    type Err = Error;

    /// Accepts `never`/`false`/`no` or `<n>d`, `<n>m` (30 days), `<n>y` (365 days)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if matches!(s, "never" | "false" | "no" | "0") {
            return Ok(KeyExpiry::Never);
        }
        let invalid = || Error::Configuration(format!("keyring expiry '{}' is not valid", s));
        let unit = s.chars().last().ok_or_else(invalid)?;
        let quantity: u64 = s[..s.len() - unit.len_utf8()].parse().map_err(|_| invalid())?;
        let days = match unit {
            'd' => quantity,
            'm' => quantity * 30,
            'y' => quantity * 365,
            _ => return Err(invalid()),
        };
        if days == 0 {
            return Err(invalid());
        }
        Ok(KeyExpiry::After(days * DAY_SECS))
    }
}

impl TryFrom<String> for KeyExpiry {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyExpiry> for String {
    fn from(expiry: KeyExpiry) -> Self {
        match expiry {
            KeyExpiry::Never => "never".to_string(),
            KeyExpiry::After(secs) => format!("{}d", secs / DAY_SECS),
        }
    }
}
