//! Launching real kernel processes through `runtimelib`.
//!
//! The process gets a fresh connection file in the Jupyter runtime dir and
//! its own process group. Its shell and iopub sockets are pumped into a
//! [`KernelChannels`] pair so the rest of the crate never touches ZeroMQ.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jupyter_protocol::{ConnectionInfo, JupyterMessage};
use log::{debug, error, info};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::action::KernelSpec;
use crate::channels::KernelChannels;
use crate::config::SessionConfig;
use crate::launch::{KernelLauncher, KernelRuntime};

const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

pub struct RuntimeLauncher {
    config: SessionConfig,
    runtime_dir: PathBuf,
}

impl RuntimeLauncher {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            runtime_dir: runtimelib::dirs::runtime_dir(),
        }
    }

    /// Write connection files somewhere other than the Jupyter runtime dir.
    pub fn with_runtime_dir(mut self, runtime_dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = runtime_dir.into();
        self
    }

    async fn command(
        &self,
        spec: &KernelSpec,
        connection_file: &Path,
    ) -> Result<tokio::process::Command> {
        if spec.argv.is_empty() {
            info!("[runtime] Starting {} kernel via kernelspec", spec.name);
            let kernelspec = runtimelib::find_kernelspec(&spec.name).await?;
            return Ok(kernelspec.command(
                connection_file,
                Some(Stdio::null()),
                Some(Stdio::null()),
            )?);
        }

        let argv = substitute_connection_file(&spec.argv, connection_file);
        info!("[runtime] Starting {} kernel: {:?}", spec.name, argv);
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        Ok(cmd)
    }
}

#[async_trait]
impl KernelLauncher for RuntimeLauncher {
    async fn start(&self, spec: &KernelSpec, cwd: &Path) -> Result<KernelRuntime> {
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(spec.name.clone()),
        };

        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = self
            .runtime_dir
            .join(format!("kernel-session-{}.json", kernel_id));

        let mut cmd = self.command(spec, &connection_file).await?;
        cmd.current_dir(expand_cwd(cwd));

        #[cfg(unix)]
        cmd.process_group(0);

        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let process = match cmd.kill_on_drop(true).spawn() {
            Ok(process) => process,
            Err(e) => {
                let _ = std::fs::remove_file(&connection_file);
                return Err(e).with_context(|| format!("failed to spawn {} kernel", spec.name));
            }
        };

        // From here on, dropping `runtime` tears the process down
        let mut runtime = KernelRuntime::with_process(
            KernelChannels::disconnected(),
            process,
            connection_file,
            Vec::new(),
        );

        tokio::time::sleep(self.config.startup_delay).await;

        let session_id = Uuid::new_v4().to_string();
        let (channels, tasks) = connect(&connection_info, &session_id, &self.config).await?;
        runtime.attach(channels, tasks);

        info!("[runtime] Kernel started: {}", kernel_id);
        Ok(runtime)
    }
}

/// Open shell and iopub and spawn the tasks pumping them.
async fn connect(
    connection_info: &ConnectionInfo,
    session_id: &str,
    config: &SessionConfig,
) -> Result<(KernelChannels, Vec<JoinHandle<()>>)> {
    let (broadcast_tx, broadcast_rx) = broadcast::channel(config.broadcast_capacity.max(1));
    let (shell_tx, mut shell_rx) = mpsc::unbounded_channel::<JupyterMessage>();

    let mut iopub =
        runtimelib::create_client_iopub_connection(connection_info, "", session_id).await?;

    let identity = runtimelib::peer_identity_for_session(session_id)?;
    let shell = runtimelib::create_client_shell_connection_with_identity(
        connection_info,
        session_id,
        identity,
    )
    .await?;
    let (mut shell_writer, mut shell_reader) = shell.split();

    let iopub_tx = broadcast_tx.clone();
    let iopub_task = tokio::spawn(async move {
        loop {
            match iopub.read().await {
                Ok(message) => {
                    debug!(
                        "[runtime] iopub: type={} parent_msg_id={:?}",
                        message.header.msg_type,
                        message.parent_header.as_ref().map(|h| &h.msg_id)
                    );
                    let _ = iopub_tx.send(message);
                }
                Err(e) => {
                    error!("[runtime] iopub read error: {}", e);
                    break;
                }
            }
        }
    });

    let shell_reader_task = tokio::spawn(async move {
        loop {
            match shell_reader.read().await {
                Ok(message) => {
                    debug!("[runtime] shell reply: type={}", message.header.msg_type);
                    let _ = broadcast_tx.send(message);
                }
                Err(e) => {
                    error!("[runtime] shell read error: {}", e);
                    break;
                }
            }
        }
    });

    let shell_writer_task = tokio::spawn(async move {
        while let Some(message) = shell_rx.recv().await {
            if let Err(e) = shell_writer.send(message).await {
                error!("[runtime] shell write error: {}", e);
                break;
            }
        }
    });

    let channels = KernelChannels::from_parts(Some(shell_tx), Some(broadcast_rx));
    Ok((
        channels,
        vec![iopub_task, shell_reader_task, shell_writer_task],
    ))
}

fn substitute_connection_file(argv: &[String], connection_file: &Path) -> Vec<String> {
    let path = connection_file.to_string_lossy();
    argv.iter()
        .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &path))
        .collect()
}

/// Resolve a leading `~` against the home directory.
pub fn expand_cwd(cwd: &Path) -> PathBuf {
    match (cwd.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => cwd.to_path_buf(),
    }
}
