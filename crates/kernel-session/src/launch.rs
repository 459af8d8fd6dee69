//! Kernel launch.
//!
//! A launch starts a kernel through a [`KernelLauncher`], runs the
//! `kernel_info` handshake against it and, on success, hands the live
//! [`KernelConnection`] out in a `NEW_KERNEL` action. Failures of any step
//! end in a single `ERROR_KERNEL_LAUNCH_FAILED` and release whatever was
//! already started.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{error, info};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::action::{Action, KernelSpec};
use crate::channels::KernelChannels;
use crate::config::SessionConfig;
use crate::error::{LaunchError, MalformedAction};
use crate::handshake::acquire_kernel_info;

/// Starts kernel processes.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel for `spec` in `cwd` and connect to it. The handshake
    /// is not part of this; the caller runs it on the returned channels.
    async fn start(&self, spec: &KernelSpec, cwd: &Path) -> anyhow::Result<KernelRuntime>;
}

/// Everything a running kernel holds on to. Dropping it kills the process
/// group, removes the connection file and stops the pump tasks.
#[derive(Default)]
pub struct KernelRuntime {
    pub channels: KernelChannels,
    process: Option<tokio::process::Child>,
    connection_file: Option<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
}

impl KernelRuntime {
    /// A kernel with no process behind it, driven by `tasks`.
    pub fn in_memory(channels: KernelChannels, tasks: Vec<JoinHandle<()>>) -> Self {
        let mut runtime = Self::default();
        runtime.channels = channels;
        runtime.tasks = tasks;
        runtime
    }

    pub(crate) fn with_process(
        channels: KernelChannels,
        process: tokio::process::Child,
        connection_file: PathBuf,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            channels,
            #[cfg(unix)]
            process_group_id: process.id().map(|pid| pid as i32),
            process: Some(process),
            connection_file: Some(connection_file),
            tasks,
        }
    }

    pub(crate) fn attach(&mut self, channels: KernelChannels, tasks: Vec<JoinHandle<()>>) {
        self.channels = channels;
        self.tasks.extend(tasks);
    }

    /// Release the kernel's resources. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[launch] Failed to kill process group {}: {}", pgid, e);
                }
            }
        }

        // kill_on_drop takes care of the process itself
        self.process = None;

        if let Some(path) = self.connection_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for KernelRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A launched kernel that completed its handshake.
pub struct KernelConnection {
    kernel_spec: KernelSpec,
    cwd: PathBuf,
    language_info: Value,
    channels: KernelChannels,
    status: Mutex<String>,
    runtime: Mutex<KernelRuntime>,
}

impl KernelConnection {
    pub fn new(
        kernel_spec: KernelSpec,
        cwd: PathBuf,
        language_info: Value,
        runtime: KernelRuntime,
    ) -> Self {
        Self {
            kernel_spec,
            cwd,
            language_info,
            channels: runtime.channels.clone(),
            status: Mutex::new("idle".to_string()),
            runtime: Mutex::new(runtime),
        }
    }

    pub fn kernel_spec(&self) -> &KernelSpec {
        &self.kernel_spec
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn language_info(&self) -> &Value {
        &self.language_info
    }

    pub fn channels(&self) -> &KernelChannels {
        &self.channels
    }

    /// Last execution state reported by the kernel.
    pub fn status(&self) -> String {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn set_status(&self, status: &str) {
        if let Ok(mut current) = self.status.lock() {
            *current = status.to_string();
        }
    }

    /// Stop the kernel now instead of waiting for the last reference to go.
    pub fn shutdown(&self) {
        info!("[launch] Shutting down kernel {}", self.kernel_spec.name);
        if let Ok(mut runtime) = self.runtime.lock() {
            runtime.shutdown();
        }
    }
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("kernel_spec", &self.kernel_spec.name)
            .field("cwd", &self.cwd)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Launching,
    Ready,
    Failed,
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchState::Idle => write!(f, "idle"),
            LaunchState::Launching => write!(f, "launching"),
            LaunchState::Ready => write!(f, "ready"),
            LaunchState::Failed => write!(f, "failed"),
        }
    }
}

async fn start_and_handshake(
    launcher: Arc<dyn KernelLauncher>,
    kernel_spec: Option<KernelSpec>,
    cwd: Option<PathBuf>,
    config: SessionConfig,
) -> Result<KernelConnection, LaunchError> {
    let kernel_spec = kernel_spec.ok_or(MalformedAction::MissingKernelSpec)?;
    let cwd = cwd.ok_or(MalformedAction::MissingCwd)?;

    info!(
        "[launch] {} -> {}: kernel {} in {}",
        LaunchState::Idle,
        LaunchState::Launching,
        kernel_spec.name,
        cwd.display()
    );
    let runtime = launcher
        .start(&kernel_spec, &cwd)
        .await
        .map_err(LaunchError::Start)?;

    // On failure `runtime` is dropped here, taking the process with it
    let language_info = acquire_kernel_info(&runtime.channels, config.handshake_timeout).await?;

    Ok(KernelConnection::new(kernel_spec, cwd, language_info, runtime))
}

/// Launch a kernel. Yields exactly `SET_KERNEL_INFO` then `NEW_KERNEL`, or a
/// single `ERROR_KERNEL_LAUNCH_FAILED`.
pub fn launch(
    launcher: Arc<dyn KernelLauncher>,
    kernel_spec: Option<KernelSpec>,
    cwd: Option<PathBuf>,
    config: &SessionConfig,
) -> BoxStream<'static, Action> {
    let config = config.clone();
    stream::once(async move {
        match start_and_handshake(launcher, kernel_spec, cwd, config).await {
            Ok(kernel) => {
                info!(
                    "[launch] {} -> {}: kernel {}",
                    LaunchState::Launching,
                    LaunchState::Ready,
                    kernel.kernel_spec().name
                );
                vec![
                    Action::SetKernelInfo {
                        kernel_spec: kernel.kernel_spec().clone(),
                        lang_info: kernel.language_info().clone(),
                    },
                    Action::NewKernel {
                        kernel: Arc::new(kernel),
                    },
                ]
            }
            Err(e) => {
                error!("[launch] -> {}: {}", LaunchState::Failed, e);
                vec![Action::ErrorKernelLaunchFailed {
                    payload: e.to_string(),
                }]
            }
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

/// Turn a kernelspec name into a full launch request.
pub fn launch_by_name(kernel_spec_name: &str, cwd: PathBuf) -> Action {
    Action::LaunchKernel {
        kernel_spec: Some(KernelSpec::named(kernel_spec_name)),
        cwd: Some(cwd),
    }
}
