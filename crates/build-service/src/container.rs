//! Container runtimes running commands inside build environments
//!
//! Every command runs in its own process group. Cancellation sends SIGTERM
//! to the whole group, then SIGKILL once the grace period expires.

use async_trait::async_trait;
use fatbuildr_common::{Error, IsolationPolicy, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::{CancelReason, CancelSignal};
use crate::config::{ContainerSettings, Privilege};
use crate::logstream::BuildLog;

const KILL_GRACE: Duration = Duration::from_secs(10);

/// Host directory made visible in the environment at the same path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub path: PathBuf,
    pub read_only: bool,
}

/// Command to run in an environment
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Root filesystem of the environment
    pub rootfs: PathBuf,
    /// Program and arguments
    pub command: Vec<String>,
    pub binds: Vec<Bind>,
    pub chdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub privilege: Privilege,
    pub policy: IsolationPolicy,
    /// Environment initialization or update, run with `init_opts`
    pub init: bool,
}

impl RunSpec {
    /// Run `script` with `/bin/sh -c`
    pub fn shell(rootfs: PathBuf, script: &str, policy: IsolationPolicy) -> Self {
        Self {
            rootfs,
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            binds: Vec::new(),
            chdir: None,
            env: Vec::new(),
            privilege: Privilege::Root,
            policy,
            init: false,
        }
    }
}

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Cancelled(CancelReason),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Command launching `spec` in the environment
    fn command(&self, spec: &RunSpec) -> Command;

    /// Run `spec`, streaming its output into `log`
    async fn run(&self, spec: &RunSpec, log: &BuildLog, cancel: &CancelSignal) -> Result<RunOutcome> {
        let command = self.command(spec);
        run_in_group(command, log, cancel).await
    }
}

/// systemd-nspawn runtime
#[derive(Debug, Clone)]
pub struct NspawnRuntime {
    settings: ContainerSettings,
}

impl NspawnRuntime {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }

    /// Arguments given to systemd-nspawn for `spec`
    pub fn arguments(&self, spec: &RunSpec) -> Vec<String> {
        let mut args = if spec.init {
            self.settings.init_opts.clone()
        } else {
            Vec::new()
        };
        args.push(format!("--directory={}", spec.rootfs.display()));
        args.extend(self.settings.opts.iter().cloned());

        args.push(format!(
            "--register={}",
            if spec.policy.register { "yes" } else { "no" }
        ));
        if spec.policy.bind_resources {
            args.push("--keep-unit".to_string());
        }
        for bind in &spec.binds {
            let option = if bind.read_only { "--bind-ro" } else { "--bind" };
            args.push(format!("{}={}", option, bind.path.display()));
        }
        if let Some(dir) = &spec.chdir {
            args.push(format!("--chdir={}", dir.display()));
        }
        for (name, value) in &spec.env {
            args.push(format!("--setenv={}={}", name, value));
        }
        if let Privilege::User(user) = &spec.privilege {
            args.push(format!("--user={}", user));
        }
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for NspawnRuntime {
    fn name(&self) -> &'static str {
        "nspawn"
    }

    fn command(&self, spec: &RunSpec) -> Command {
        let mut command = Command::new(&self.settings.exec);
        command.args(self.arguments(spec));
        if !spec.policy.seccomp {
            command.env("SYSTEMD_SECCOMP", "0");
        }
        command
    }
}

/// Runs commands directly on the host. Binds, privilege and isolation
/// knobs are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRuntime;

#[async_trait]
impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn command(&self, spec: &RunSpec) -> Command {
        let (program, args) = match spec.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("/bin/true", &[][..]),
        };
        let mut command = Command::new(program);
        command.args(args).envs(spec.env.iter().cloned());
        if let Some(dir) = &spec.chdir {
            command.current_dir(dir);
        }
        command
    }
}

async fn pump(mut stream: impl AsyncRead + Unpin, log: &BuildLog) -> Result<()> {
    let mut buffer = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        log.append(&buffer[..n]).await?;
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("Unable to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Spawn `command` in a new process group and wait for it, copying its
/// output into `log`
pub async fn run_in_group(mut command: Command, log: &BuildLog, cancel: &CancelSignal) -> Result<RunOutcome> {
    command
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("run cmd: {:?}", command.as_std());

    let mut child = command
        .spawn()
        .map_err(|e| Error::Other(anyhow::anyhow!("unable to run {:?}: {}", command.as_std(), e)))?;
    let pid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let output = async {
        let out = async {
            match stdout {
                Some(stream) => pump(stream, log).await,
                None => Ok(()),
            }
        };
        let err = async {
            match stderr {
                Some(stream) => pump(stream, log).await,
                None => Ok(()),
            }
        };
        let (out, err) = tokio::join!(out, err);
        out.and(err)
    };

    let waited = async {
        let (output, status) = tokio::join!(output, child.wait());
        output?;
        Ok::<_, Error>(status?)
    };
    tokio::pin!(waited);

    tokio::select! {
        status = &mut waited => {
            let status = status?;
            Ok(RunOutcome::Exited(status.code().unwrap_or(-1)))
        }
        reason = cancel.cancelled() => {
            warn!("Terminating process group {:?}: {}", pid, reason);
            signal_group(pid, Signal::SIGTERM);
            if tokio::time::timeout(KILL_GRACE, &mut waited).await.is_err() {
                warn!("Process group {:?} still running, killing it", pid);
                signal_group(pid, Signal::SIGKILL);
                let _ = waited.await;
            }
            Ok(RunOutcome::Cancelled(reason))
        }
    }
}
