//! Starts and supervises the single server process of a container.
//!
//! # Launch sequence
//!
//! ```text
//! NotStarted
//!   1. Plan        ── LaunchCommand::plan()         → entry point, host, port
//!   2. Resolve     ── module file defines object     (EntryPointError, no bind)
//!   3. Environment ── image env, deps path, .env
//! Binding
//!   4. Bind probe  ── exclusive listener on host:port (BindError, no retry)
//!   5. Spawn       ── probe released, server started (SpawnError)
//! Serving
//!   6. Wait        ── server exit, or shutdown → SIGTERM → grace → SIGKILL
//! Terminated
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use kiln_core::{LaunchCommand, LaunchConfig, exit};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::bind::{BindError, probe_bind};
use crate::container::{Container, ContainerError};
use crate::resolve::{EntryPointError, resolve_entry_point};
use crate::state::{InvalidTransition, LauncherState, StateCell};

const SIGKILL: u8 = 9;

/// Search path used when neither the image nor the host sets `PATH`.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Extension of application module files
    pub module_suffix: String,
    /// Variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    /// Dotenv file; its values never override variables already set
    pub env_file: Option<PathBuf>,
    /// Variable and directory of installed dependencies; the directory is
    /// prepended to any existing value
    pub dependency_path: Option<(String, PathBuf)>,
    /// Directories searched for the server program ahead of `PATH`
    pub program_path: Vec<PathBuf>,
    /// Time between forwarding SIGTERM and killing the server
    pub grace_period: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            module_suffix: "py".to_owned(),
            env: BTreeMap::new(),
            env_file: None,
            dependency_path: None,
            program_path: Vec::new(),
            grace_period: Duration::from_secs(10),
        }
    }
}

/// How the server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The server exited on its own.
    Exited { code: i32 },
    /// The server was killed by a signal the launcher did not send.
    Signalled { signal: i32 },
    /// The launcher stopped the server after a shutdown request.
    Stopped { code: Option<i32>, forced: bool },
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited { code },
            None => Self::Signalled {
                signal: terminating_signal(&status),
            },
        }
    }

    /// Exit code for the launcher process.
    ///
    /// A server stopped cleanly on request exits 0; one killed after the
    /// grace period exits `128 + SIGKILL`.
    pub fn exit_code(&self) -> u8 {
        match *self {
            Self::Exited { code } | Self::Stopped {
                code: Some(code),
                forced: false,
            } => (code & 0xff) as u8,
            Self::Signalled { signal } => 128u8.saturating_add((signal & 0x7f) as u8),
            Self::Stopped { forced: true, .. } => 128 + SIGKILL,
            Self::Stopped {
                code: None,
                forced: false,
            } => exit::SUCCESS,
        }
    }
}

/// Runs one launch command in a working directory.
///
/// Consumed by [`launch`](Self::launch), so the state machine runs once.
#[derive(Debug)]
pub struct Launcher {
    command: LaunchCommand,
    workdir: PathBuf,
    options: LaunchOptions,
    state: StateCell,
}

impl Launcher {
    pub fn new(command: LaunchCommand, workdir: impl Into<PathBuf>, options: LaunchOptions) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            options,
            state: StateCell::new(),
        }
    }

    /// Launcher for the entrypoint recorded in a container's image.
    pub fn for_container(container: &Container, config: &LaunchConfig) -> Self {
        let record = container.record();
        let workdir = container.workdir_path();
        let deps = container.host_path(&record.dependencies.path);
        let options = LaunchOptions {
            module_suffix: config.module_suffix.clone(),
            env: record.env.clone(),
            env_file: config.env_file.as_ref().map(|file| workdir.join(file)),
            dependency_path: record
                .dependencies
                .path_env
                .clone()
                .map(|var| (var, deps.clone())),
            program_path: vec![deps.join("bin")],
            grace_period: Duration::from_secs(config.grace_period_secs),
        };
        Self::new(record.entrypoint.clone(), workdir, options)
    }

    pub fn subscribe(&self) -> watch::Receiver<LauncherState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LauncherState {
        self.state.current()
    }

    /// Launch and block until the server exits or SIGINT/SIGTERM arrives.
    pub async fn launch(self) -> Result<Termination, LaunchError> {
        self.launch_until(shutdown_signal()).await
    }

    /// Launch and block until the server exits or `shutdown` completes.
    pub async fn launch_until<F>(self, shutdown: F) -> Result<Termination, LaunchError>
    where
        F: Future<Output = ()>,
    {
        let plan = match self.command.plan() {
            Ok(plan) => plan,
            Err(e) => return self.fail(EntryPointError::Invalid(e)),
        };

        if let Err(e) =
            resolve_entry_point(&self.workdir, &plan.entry_point, &self.options.module_suffix)
        {
            return self.fail(e);
        }

        let env = match self.environment() {
            Ok(env) => env,
            Err(e) => return self.fail(e),
        };

        self.state.transition(LauncherState::Binding)?;
        let target = match plan.bind_target() {
            Ok(target) => target,
            Err(e) => return self.fail(BindError::InvalidTarget(e)),
        };
        let probe = match probe_bind(&target).await {
            Ok(probe) => probe,
            Err(e) => return self.fail(e),
        };

        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .current_dir(&self.workdir)
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        probe.release();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.fail(LaunchError::Spawn {
                    program: plan.program.clone(),
                    source: e,
                });
            }
        };

        self.state.transition(LauncherState::Serving)?;
        tracing::info!(
            pid = child.id(),
            addr = %target,
            entry_point = %plan.entry_point,
            "serving"
        );

        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            () = shutdown => Event::Shutdown,
        };

        let termination = match event {
            Event::Exited(Ok(status)) => Termination::from_status(status),
            Event::Exited(Err(e)) => return self.fail(LaunchError::Wait(e)),
            Event::Shutdown => match self.stop(&mut child).await {
                Ok(termination) => termination,
                Err(e) => return self.fail(e),
            },
        };

        self.state.transition(LauncherState::Terminated)?;
        tracing::info!(?termination, exit_code = termination.exit_code(), "server terminated");
        Ok(termination)
    }

    fn fail<T>(&self, error: impl Into<LaunchError>) -> Result<T, LaunchError> {
        let error = error.into();
        self.state.transition(LauncherState::Terminated)?;
        tracing::error!(error = %error, state = %self.state.current(), "launch failed");
        Err(error)
    }

    fn environment(&self) -> Result<BTreeMap<String, String>, LaunchError> {
        let mut env = self.options.env.clone();

        if let Some((var, dir)) = &self.options.dependency_path {
            prepend_path(&mut env, var, std::slice::from_ref(dir), None);
        }
        if !self.options.program_path.is_empty() {
            prepend_path(&mut env, "PATH", &self.options.program_path, Some(DEFAULT_PATH));
        }

        if let Some(path) = self.options.env_file.as_ref().filter(|p| p.is_file()) {
            let env_file_err = |e| LaunchError::EnvFile {
                path: path.clone(),
                source: e,
            };
            let mut loaded = 0usize;
            for item in dotenvy::from_path_iter(path).map_err(env_file_err)? {
                let (key, value) = item.map_err(env_file_err)?;
                if std::env::var_os(&key).is_none() && !env.contains_key(&key) {
                    env.insert(key, value);
                    loaded += 1;
                }
            }
            tracing::debug!(path = %path.display(), loaded, "env file loaded");
        }

        Ok(env)
    }

    async fn stop(&self, child: &mut Child) -> Result<Termination, LaunchError> {
        tracing::info!(grace_period = ?self.options.grace_period, "shutdown requested, stopping server");
        forward_terminate(child);

        match tokio::time::timeout(self.options.grace_period, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(LaunchError::Wait)?;
                Ok(Termination::Stopped {
                    code: status.code(),
                    forced: false,
                })
            }
            Err(elapsed) => {
                tracing::warn!(%elapsed, "server did not stop within the grace period, killing");
                child.kill().await.map_err(LaunchError::Wait)?;
                Ok(Termination::Stopped {
                    code: None,
                    forced: true,
                })
            }
        }
    }
}

/// Prepends `dirs` to `var`, keeping the value already in `env` or else the
/// inherited one.
fn prepend_path(
    env: &mut BTreeMap<String, String>,
    var: &str,
    dirs: &[PathBuf],
    fallback: Option<&str>,
) {
    let existing = match env.get(var) {
        Some(value) => Some(value.clone()),
        None => std::env::var_os(var).map(|v| v.to_string_lossy().into_owned()),
    };
    let existing = existing
        .filter(|v| !v.is_empty())
        .or_else(|| fallback.map(str::to_owned));

    let mut parts: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    parts.extend(existing);
    env.insert(var.to_owned(), parts.join(":"));
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Shutdown,
}

#[cfg(unix)]
fn forward_terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "failed to forward SIGTERM");
    }
}

#[cfg(not(unix))]
fn forward_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "failed to stop server");
    }
}

#[cfg(unix)]
fn terminating_signal(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn terminating_signal(_status: &ExitStatus) -> i32 {
    0
}

/// Completes on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received interrupt"),
            Err(e) => {
                tracing::warn!("unable to listen for interrupt: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::info!("received SIGTERM");
            }
            Err(e) => {
                tracing::warn!("unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("entry point resolution failed")]
    EntryPoint(#[from] EntryPointError),

    #[error("bind failed")]
    Bind(#[from] BindError),

    #[error("failed to start server {program}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to read env file {path}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },

    #[error("failed to wait for server")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    State(#[from] InvalidTransition),

    #[error("failed to prepare container")]
    Container(#[from] ContainerError),
}

impl LaunchError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::EntryPoint(_) => exit::ENTRY_POINT_RESOLUTION,
            Self::Bind(_) => exit::BIND,
            Self::Spawn { .. } => exit::SPAWN,
            Self::EnvFile { .. } | Self::Wait(_) | Self::State(_) | Self::Container(_) => {
                exit::FAILURE
            }
        }
    }
}
