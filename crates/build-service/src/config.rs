//! Configuration management for the Fatbuildr daemon
//!
//! Service settings (listen address, job store) come from environment
//! variables. Instance settings come from a TOML file whose path is given by
//! `FATBUILDR_CONF`; built-in defaults apply when the file is missing.

use anyhow::{Context, Result};
use fatbuildr_common::{EnvKey, IsolationOverride, IsolationPolicy, PackageFormat};
use fatbuildr_keyring::{KeyExpiry, KeyScopeMode, KeyringConfig};
use fatbuildr_registry::RegistryAccess;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONF: &str = "/etc/fatbuildr/fatbuildr.toml";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Redis URL for the job store; in-memory store when unset
    pub redis_url: Option<String>,

    /// Instance settings file
    pub settings_path: PathBuf,

    pub settings: Settings,
}

impl Config {
    /// Load configuration from environment variables and the settings file
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let settings_path: PathBuf = env::var("FATBUILDR_CONF")
            .unwrap_or_else(|_| DEFAULT_CONF.to_string())
            .into();

        let config = Config {
            api_host: env::var("FATBUILDR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("FATBUILDR_PORT")
                .unwrap_or_else(|_| "8086".to_string())
                .parse()
                .context("Invalid FATBUILDR_PORT")?,

            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            settings: Settings::load(&settings_path)?,
            settings_path,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("FATBUILDR_PORT must be greater than 0");
        }
        self.settings.validate()
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

/// Instance settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub instance: InstanceSettings,
    pub dirs: DirSettings,
    pub containers: ContainerSettings,
    pub images: ImageSettings,
    pub formats: FormatsSettings,
    pub keyring: KeyringSettings,
    pub registry: RegistrySettings,
    pub tokens: TokenSettings,
    pub builds: BuildSettings,
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid settings file")
    }

    /// Load settings from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Settings file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read settings {}", path.display()))
            }
        }
    }

    /// Reject invalid combinations of settings
    pub fn validate(&self) -> Result<()> {
        if self.instance.name.is_empty() || self.instance.name.contains('/') {
            anyhow::bail!("instance name '{}' is not valid", self.instance.name);
        }
        if self.builds.workers == 0 {
            anyhow::bail!("builds.workers must be greater than 0");
        }
        if self.builds.timeout == Some(0) {
            anyhow::bail!("builds.timeout must be greater than 0 when set");
        }
        for (name, format) in [("deb", &self.formats.deb), ("rpm", &self.formats.rpm)] {
            if let Privilege::User(user) = &format.privilege {
                if user.trim().is_empty() {
                    anyhow::bail!("formats.{}.privilege names an empty user", name);
                }
            }
            if format.build_cmd.trim().is_empty() {
                anyhow::bail!("formats.{}.build_cmd is empty", name);
            }
        }
        for key in self.containers.overrides.keys() {
            key.parse::<EnvKey>()
                .map_err(|e| anyhow::anyhow!("containers.overrides: {}", e))?;
        }
        if self.containers.runtime == RuntimeKind::Nspawn && self.images.create_cmd.trim().is_empty() {
            anyhow::bail!("images.create_cmd is required with the nspawn runtime");
        }
        Ok(())
    }

    /// Effective isolation policy of an environment
    pub fn policy_for(&self, key: &EnvKey) -> IsolationPolicy {
        let base = self.containers.default_policy();
        match self.containers.overrides.get(&key.to_string()) {
            Some(over) => over.apply(base),
            None => base,
        }
    }

    pub fn format(&self, format: PackageFormat) -> &FormatSettings {
        match format {
            PackageFormat::Deb => &self.formats.deb,
            PackageFormat::Rpm => &self.formats.rpm,
        }
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.builds.timeout.map(Duration::from_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.images.refresh_interval.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    pub name: String,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirSettings {
    /// Artifact definitions, one directory per artifact
    pub definitions: PathBuf,
    /// Per-build working directories and logs
    pub build: PathBuf,
    /// Downloaded upstream tarballs
    pub cache: PathBuf,
    /// Build environments
    pub images: PathBuf,
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            definitions: PathBuf::from("/var/lib/fatbuildr/artifacts"),
            build: PathBuf::from("/var/lib/fatbuildr/builds"),
            cache: PathBuf::from("/var/cache/fatbuildr"),
            images: PathBuf::from("/var/lib/fatbuildr/images"),
        }
    }
}

/// Container runtime used for environments and builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Nspawn,
    /// Run commands directly on the host
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub runtime: RuntimeKind,
    /// systemd-nspawn program
    pub exec: PathBuf,
    /// Options placed first when an environment is created or updated
    pub init_opts: Vec<String>,
    /// Extra options
    pub opts: Vec<String>,
    pub seccomp: bool,
    pub register: bool,
    pub bind_resources: bool,
    /// Per environment key (`distribution/architecture`) overrides
    pub overrides: BTreeMap<String, IsolationOverride>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let policy = IsolationPolicy::default();
        Self {
            runtime: RuntimeKind::default(),
            exec: PathBuf::from("/usr/bin/systemd-nspawn"),
            init_opts: Vec::new(),
            opts: vec!["--quiet".to_string()],
            seccomp: policy.seccomp,
            register: policy.register,
            bind_resources: policy.bind_resources,
            overrides: BTreeMap::new(),
        }
    }
}

impl ContainerSettings {
    pub fn default_policy(&self) -> IsolationPolicy {
        IsolationPolicy {
            seccomp: self.seccomp,
            register: self.register,
            bind_resources: self.bind_resources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Host command creating an environment root. Expands `{rootfs}`,
    /// `{distribution}`, `{architecture}` and `{format}`.
    pub create_cmd: String,
    /// Seconds after which an environment is refreshed before use
    pub refresh_interval: Option<u64>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            create_cmd: "mkosi --force --distribution {distribution} --architecture {architecture} \
                         --format directory --output {rootfs}"
                .to_string(),
            refresh_interval: None,
        }
    }
}

/// Privilege of the packaging toolchain inside the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Privilege {
    #[default]
    Root,
    User(String),
}

impl TryFrom<String> for Privilege {
    type Error = std::convert::Infallible;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "root" => Privilege::Root,
            _ => Privilege::User(value),
        })
    }
}

impl From<Privilege> for String {
    fn from(privilege: Privilege) -> Self {
        match privilege {
            Privilege::Root => "root".to_string(),
            Privilege::User(user) => user,
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Privilege::Root => f.write_str("root"),
            Privilege::User(user) => f.write_str(user),
        }
    }
}

/// Toolchain settings of one package format. Commands are run through
/// `/bin/sh -c` after placeholder expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatSettings {
    /// Run once in a freshly created environment
    #[serde(default)]
    pub init_cmd: String,
    /// Refresh commands, split on `&&`
    #[serde(default)]
    pub update_cmds: String,
    /// Build command. Expands `{source}`, `{place}`, `{packaging}`,
    /// `{name}`, `{version}`, `{release}`, `{distribution}`,
    /// `{architecture}` and `{cache}`.
    pub build_cmd: String,
    #[serde(default)]
    pub privilege: Privilege,
    /// Extensions of produced files collected as artifacts
    pub artifact_extensions: Vec<String>,
}

impl FormatSettings {
    pub fn update_commands(&self) -> Vec<String> {
        self.update_cmds
            .split("&&")
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatsSettings {
    pub deb: FormatSettings,
    pub rpm: FormatSettings,
}

impl Default for FormatsSettings {
    fn default() -> Self {
        Self {
            deb: FormatSettings {
                init_cmd: "apt-get update && apt-get install -y build-essential devscripts equivs"
                    .to_string(),
                update_cmds: "apt-get update && apt-get -y upgrade".to_string(),
                build_cmd: "cp -r {packaging} {source}/debian && cd {source} && \
                            mk-build-deps --install --remove --tool 'apt-get -y' debian/control && \
                            dpkg-buildpackage -us -uc"
                    .to_string(),
                privilege: Privilege::Root,
                artifact_extensions: vec![
                    "deb".to_string(),
                    "ddeb".to_string(),
                    "dsc".to_string(),
                    "buildinfo".to_string(),
                    "changes".to_string(),
                ],
            },
            rpm: FormatSettings {
                init_cmd: "dnf -y install rpm-build dnf-plugins-core".to_string(),
                update_cmds: "dnf -y upgrade".to_string(),
                build_cmd: "rpmbuild -ba --define '_topdir {place}' --define '_sourcedir {cache}' \
                            {packaging}/{name}.spec"
                    .to_string(),
                privilege: Privilege::User("fatbuildr".to_string()),
                artifact_extensions: vec!["rpm".to_string()],
            },
        }
    }
}

/// Passphrase seeding program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeederSettings {
    pub program: PathBuf,
    #[serde(default = "default_seeder_args")]
    pub args: Vec<String>,
}

fn default_seeder_args() -> Vec<String> {
    vec!["--preset".to_string(), "{keygrip}".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringSettings {
    pub storage: PathBuf,
    pub key_type: String,
    pub size: u32,
    pub expires: KeyExpiry,
    pub scope: KeyScopeMode,
    /// User id of generated keys
    pub userid: String,
    pub gpg_program: PathBuf,
    pub gpgconf_program: PathBuf,
    /// `None` disables passphrase seeding
    pub seeder: Option<SeederSettings>,
}

impl Default for KeyringSettings {
    fn default() -> Self {
        let keyring = KeyringConfig::new("/var/lib/fatbuildr/keyring");
        Self {
            storage: keyring.storage,
            key_type: keyring.key_type,
            size: keyring.size,
            expires: keyring.expires,
            scope: keyring.scope,
            userid: "Fatbuildr <fatbuildr@localhost>".to_string(),
            gpg_program: PathBuf::from("gpg"),
            gpgconf_program: PathBuf::from("gpgconf"),
            seeder: None,
        }
    }
}

impl KeyringSettings {
    pub fn keyring_config(&self) -> KeyringConfig {
        KeyringConfig {
            storage: self.storage.clone(),
            key_type: self.key_type.clone(),
            size: self.size,
            expires: self.expires,
            scope: self.scope,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub root: PathBuf,
    pub access: RegistryAccess,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/fatbuildr/registry"),
            access: RegistryAccess::Public,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub path: PathBuf,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fatbuildr/tokens.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Concurrent build workers
    pub workers: usize,
    /// Seconds before a running build is cancelled
    pub timeout: Option<u64>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout: None,
        }
    }
}
