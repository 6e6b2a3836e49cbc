//! Build environment provisioning
//!
//! An environment lives in `<images>/<distribution>-<architecture>/`:
//!
//! ```text
//! environment.json   handle of the ready environment
//! provision.log      output of the last create/refresh
//! rootfs/            root filesystem used by the container runtime
//! ```
//!
//! At most one provisioning runs per key. It runs in a spawned task and
//! publishes a single outcome on a watch channel; every caller that asked
//! for the key meanwhile receives that same outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fatbuildr_common::{EnvKey, Error, IsolationPolicy, PackageFormat, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::config::FormatsSettings;
use crate::container::{run_in_group, ContainerRuntime, RunOutcome, RunSpec};
use crate::dispatcher::KeySlots;
use crate::logstream::BuildLog;

const HANDLE_FILE: &str = "environment.json";
const LOG_FILE: &str = "provision.log";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Absent,
    Provisioning,
    Ready,
    Stale,
}

/// Ready build environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub key: EnvKey,
    pub format: PackageFormat,
    /// Isolation policy the environment was provisioned with
    pub policy: IsolationPolicy,
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub key: EnvKey,
    pub state: EnvironmentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<EnvironmentHandle>,
}

/// What a builder is asked to work on
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub key: EnvKey,
    pub format: PackageFormat,
    pub policy: IsolationPolicy,
    pub path: PathBuf,
    pub rootfs: PathBuf,
}

/// Creates and refreshes environment root filesystems
#[async_trait]
pub trait EnvironmentBuilder: Send + Sync {
    /// Create the root filesystem from scratch
    async fn create(&self, spec: &EnvironmentSpec, log: &BuildLog) -> Result<()>;

    /// Bring an existing root filesystem up to date
    async fn refresh(&self, spec: &EnvironmentSpec, log: &BuildLog) -> Result<()>;
}

fn render(template: &str, spec: &EnvironmentSpec) -> String {
    template
        .replace("{rootfs}", &spec.rootfs.display().to_string())
        .replace("{distribution}", &spec.key.distribution)
        .replace("{architecture}", &spec.key.architecture)
        .replace("{format}", spec.format.as_str())
}

fn provision_error(spec: &EnvironmentSpec, reason: impl Into<String>) -> Error {
    Error::EnvironmentProvision {
        key: spec.key.to_string(),
        reason: reason.into(),
    }
}

/// Builder running the configured commands: `create_cmd` on the host,
/// `init_cmd` and `update_cmds` inside the environment
pub struct CommandEnvironmentBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    create_cmd: String,
    formats: FormatsSettings,
}

impl CommandEnvironmentBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, create_cmd: String, formats: FormatsSettings) -> Self {
        Self {
            runtime,
            create_cmd,
            formats,
        }
    }

    fn format(&self, format: PackageFormat) -> &crate::config::FormatSettings {
        match format {
            PackageFormat::Deb => &self.formats.deb,
            PackageFormat::Rpm => &self.formats.rpm,
        }
    }

    async fn in_environment(&self, spec: &EnvironmentSpec, script: &str, log: &BuildLog) -> Result<()> {
        let script = render(script, spec);
        log.line(&format!("running in environment: {}", script)).await?;
        let mut run = RunSpec::shell(spec.rootfs.clone(), &script, spec.policy);
        run.init = true;
        match self.runtime.run(&run, log, &CancelSignal::new()).await? {
            RunOutcome::Exited(0) => Ok(()),
            RunOutcome::Exited(code) => Err(provision_error(
                spec,
                format!("command '{}' exited with code {}", script, code),
            )),
            RunOutcome::Cancelled(reason) => Err(provision_error(spec, reason.to_string())),
        }
    }
}

#[async_trait]
impl EnvironmentBuilder for CommandEnvironmentBuilder {
    async fn create(&self, spec: &EnvironmentSpec, log: &BuildLog) -> Result<()> {
        let script = render(&self.create_cmd, spec);
        log.line(&format!("running on host: {}", script)).await?;
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&script);
        match run_in_group(command, log, &CancelSignal::new()).await? {
            RunOutcome::Exited(0) => {}
            RunOutcome::Exited(code) => {
                return Err(provision_error(
                    spec,
                    format!("create command exited with code {}", code),
                ))
            }
            RunOutcome::Cancelled(reason) => return Err(provision_error(spec, reason.to_string())),
        }

        let init = self.format(spec.format).init_cmd.trim().to_string();
        if !init.is_empty() {
            self.in_environment(spec, &init, log).await?;
        }
        self.refresh(spec, log).await
    }

    async fn refresh(&self, spec: &EnvironmentSpec, log: &BuildLog) -> Result<()> {
        for command in self.format(spec.format).update_commands() {
            self.in_environment(spec, &command, log).await?;
        }
        Ok(())
    }
}

type Outcome = std::result::Result<EnvironmentHandle, String>;

enum Slot {
    Idle {
        handle: EnvironmentHandle,
        stale: bool,
    },
    InFlight {
        outcome: watch::Receiver<Option<Outcome>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Refresh,
}

pub struct Provisioner {
    images_dir: PathBuf,
    builder: Arc<dyn EnvironmentBuilder>,
    refresh_interval: Option<Duration>,
    key_slots: Arc<KeySlots>,
    slots: Mutex<HashMap<EnvKey, Slot>>,
}

impl Provisioner {
    /// Open the environment directory and load the environments it holds
    pub async fn open(
        images_dir: impl Into<PathBuf>,
        builder: Arc<dyn EnvironmentBuilder>,
        refresh_interval: Option<Duration>,
        key_slots: Arc<KeySlots>,
    ) -> Result<Arc<Self>> {
        let images_dir = images_dir.into();
        tokio::fs::create_dir_all(&images_dir).await.map_err(|e| {
            Error::Configuration(format!(
                "images directory {} is not usable: {}",
                images_dir.display(),
                e
            ))
        })?;

        let mut slots = HashMap::new();
        let mut files = Vec::new();
        let mut distributions = tokio::fs::read_dir(&images_dir).await?;
        while let Some(distribution) = distributions.next_entry().await? {
            if !distribution.file_type().await?.is_dir() {
                continue;
            }
            let mut architectures = tokio::fs::read_dir(distribution.path()).await?;
            while let Some(architecture) = architectures.next_entry().await? {
                files.push(architecture.path().join(HANDLE_FILE));
            }
        }
        for file in files {
            let Ok(content) = tokio::fs::read(&file).await else {
                continue;
            };
            match serde_json::from_slice::<EnvironmentHandle>(&content) {
                Ok(handle) => {
                    debug!("Found environment {} in {}", handle.key, handle.path.display());
                    slots.insert(
                        handle.key.clone(),
                        Slot::Idle {
                            handle,
                            stale: false,
                        },
                    );
                }
                Err(e) => warn!("Ignoring unreadable environment {}: {}", file.display(), e),
            }
        }
        info!("Loaded {} build environment(s) from {}", slots.len(), images_dir.display());

        Ok(Arc::new(Self {
            images_dir,
            builder,
            refresh_interval,
            key_slots,
            slots: Mutex::new(slots),
        }))
    }

    pub fn environment_dir(&self, key: &EnvKey) -> PathBuf {
        self.images_dir.join(key.relative_dir())
    }

    fn expired(&self, handle: &EnvironmentHandle) -> bool {
        match self.refresh_interval {
            Some(interval) => {
                let age = Utc::now().signed_duration_since(handle.refreshed_at);
                age.to_std().map(|age| age > interval).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Return a ready environment for `key` matching `policy`, creating or
    /// refreshing it when needed
    pub async fn ensure(
        self: &Arc<Self>,
        key: &EnvKey,
        format: PackageFormat,
        policy: IsolationPolicy,
        force: bool,
    ) -> Result<EnvironmentHandle> {
        let mut outcome = {
            let mut slots = self.slots.lock().await;
            let previous = match slots.get(key) {
                Some(Slot::InFlight { outcome }) => Err(outcome.clone()),
                Some(Slot::Idle { handle, stale }) => {
                    let matching = handle.policy == policy && handle.format == format;
                    if matching && !force && !stale && !self.expired(handle) {
                        return Ok(handle.clone());
                    }
                    Ok(Some(handle.clone()))
                }
                None => Ok(None),
            };

            match previous {
                Err(outcome) => outcome,
                Ok(previous) => {
                    let action = match &previous {
                        Some(handle) if handle.policy == policy && handle.format == format => {
                            Action::Refresh
                        }
                        _ => Action::Create,
                    };
                    let (sender, receiver) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            outcome: receiver.clone(),
                        },
                    );

                    let provisioner = Arc::clone(self);
                    let spec = EnvironmentSpec {
                        key: key.clone(),
                        format,
                        policy,
                        path: self.environment_dir(key),
                        rootfs: self.environment_dir(key).join(ROOTFS_DIR),
                    };
                    tokio::spawn(async move {
                        provisioner.run(spec, action, previous, sender).await;
                    });
                    receiver
                }
            }
        };

        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result.map_err(|reason| Error::EnvironmentProvision {
                    key: key.to_string(),
                    reason,
                });
            }
            if outcome.changed().await.is_err() {
                return Err(Error::EnvironmentProvision {
                    key: key.to_string(),
                    reason: "provisioning task ended without result".to_string(),
                });
            }
        }
    }

    async fn run(
        &self,
        spec: EnvironmentSpec,
        action: Action,
        previous: Option<EnvironmentHandle>,
        sender: watch::Sender<Option<Outcome>>,
    ) {
        info!("Provisioning environment {} ({:?}, {})", spec.key, action, spec.policy);
        let result = self.provision(&spec, action, previous.as_ref()).await;

        let outcome = {
            let mut slots = self.slots.lock().await;
            match result {
                Ok(handle) => {
                    info!("Environment {} is ready", spec.key);
                    slots.insert(
                        spec.key.clone(),
                        Slot::Idle {
                            handle: handle.clone(),
                            stale: false,
                        },
                    );
                    Ok(handle)
                }
                Err(e) => {
                    error!("Provisioning of environment {} failed: {}", spec.key, e);
                    match previous {
                        Some(handle) if action == Action::Refresh => {
                            slots.insert(spec.key.clone(), Slot::Idle { handle, stale: true });
                        }
                        _ => {
                            slots.remove(&spec.key);
                        }
                    }
                    Err(match e {
                        Error::EnvironmentProvision { reason, .. } => reason,
                        other => other.to_string(),
                    })
                }
            }
        };
        sender.send_replace(Some(outcome));
    }

    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        action: Action,
        previous: Option<&EnvironmentHandle>,
    ) -> Result<EnvironmentHandle> {
        tokio::fs::create_dir_all(&spec.path).await?;
        let log = BuildLog::create(spec.path.join(LOG_FILE)).await?;
        let now = Utc::now();

        let result = match action {
            Action::Create => {
                // stale handle first, so a failed create never looks ready
                remove_if_exists(&spec.path.join(HANDLE_FILE)).await?;
                if tokio::fs::try_exists(&spec.rootfs).await? {
                    tokio::fs::remove_dir_all(&spec.rootfs).await?;
                }
                self.builder.create(spec, &log).await
            }
            Action::Refresh => self.builder.refresh(spec, &log).await,
        };
        log.close();
        result?;

        let handle = EnvironmentHandle {
            key: spec.key.clone(),
            format: spec.format,
            policy: spec.policy,
            path: spec.path.clone(),
            rootfs: spec.rootfs.clone(),
            created_at: match (action, previous) {
                (Action::Refresh, Some(previous)) => previous.created_at,
                _ => now,
            },
            refreshed_at: now,
        };

        let tmp = spec.path.join(format!(".{}.tmp", HANDLE_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&handle)?).await?;
        tokio::fs::rename(&tmp, spec.path.join(HANDLE_FILE)).await?;
        Ok(handle)
    }

    /// Force a refresh on next use
    pub async fn mark_stale(&self, key: &EnvKey) -> Result<()> {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(key) {
            Some(Slot::Idle { stale, .. }) => {
                *stale = true;
                Ok(())
            }
            Some(Slot::InFlight { .. }) => Err(Error::InvalidState(format!(
                "environment {} is being provisioned",
                key
            ))),
            None => Err(Error::NotFound(format!("environment {}", key))),
        }
    }

    /// Delete an environment. Waits for the build running on it, if any.
    pub async fn remove(&self, key: &EnvKey) -> Result<()> {
        let slot = self.key_slots.get(key).await;
        let _busy = slot.lock().await;

        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(Slot::InFlight { .. }) => {
                return Err(Error::InvalidState(format!(
                    "environment {} is being provisioned",
                    key
                )))
            }
            Some(Slot::Idle { .. }) => {}
            None => return Err(Error::NotFound(format!("environment {}", key))),
        }

        let path = self.environment_dir(key);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
        }
        // fails while other architectures of the distribution remain
        let _ = tokio::fs::remove_dir(self.images_dir.join(&key.distribution)).await;
        slots.remove(key);
        info!("Removed environment {}", key);
        Ok(())
    }

    pub async fn state(&self, key: &EnvKey) -> EnvironmentState {
        match self.slots.lock().await.get(key) {
            Some(slot) => self.slot_state(slot),
            None => EnvironmentState::Absent,
        }
    }

    fn slot_state(&self, slot: &Slot) -> EnvironmentState {
        match slot {
            Slot::InFlight { .. } => EnvironmentState::Provisioning,
            Slot::Idle { handle, stale } if *stale || self.expired(handle) => EnvironmentState::Stale,
            Slot::Idle { .. } => EnvironmentState::Ready,
        }
    }

    /// State of every known environment, sorted by key
    pub async fn list(&self) -> Vec<EnvironmentStatus> {
        let slots = self.slots.lock().await;
        let mut statuses: Vec<_> = slots
            .iter()
            .map(|(key, slot)| EnvironmentStatus {
                key: key.clone(),
                state: self.slot_state(slot),
                handle: match slot {
                    Slot::Idle { handle, .. } => Some(handle.clone()),
                    Slot::InFlight { .. } => None,
                },
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
