//! kernel-session CLI entry point.
//!
//! Launches a kernel by kernelspec name and runs code cells against it
//! through a session, printing what a notebook would show.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kernel_session::outputs::NotebookOutputs;
use kernel_session::session::{self, SessionHandle};
use kernel_session::{Action, ActionKind, CellStatus, RuntimeLauncher, SessionConfig};
use log::info;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "kernel-session")]
#[command(about = "Run notebook cells against a Jupyter kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Seconds to wait for the kernel_info handshake
    #[arg(long, global = true, default_value = "30")]
    handshake_timeout: u64,

    /// Milliseconds between spawning the kernel and connecting to it
    #[arg(long, global = true, default_value = "500")]
    startup_delay_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run code cells in order
    Run {
        /// Kernelspec name
        #[arg(long, default_value = "python3")]
        kernel: String,

        /// Working directory of the kernel
        #[arg(long, default_value = ".")]
        cwd: PathBuf,

        /// Print every session event as a JSON line instead of rendered output
        #[arg(long)]
        json: bool,

        /// Source of each cell
        #[arg(required = true)]
        code: Vec<String>,
    },

    /// Launch a kernel and print its language info
    Info {
        /// Kernelspec name
        #[arg(long, default_value = "python3")]
        kernel: String,

        /// Working directory of the kernel
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = SessionConfig {
        handshake_timeout: Duration::from_secs(cli.handshake_timeout),
        startup_delay: Duration::from_millis(cli.startup_delay_ms),
        ..Default::default()
    };

    match cli.command {
        Commands::Run {
            kernel,
            cwd,
            json,
            code,
        } => run_cells(config, &kernel, cwd, json, &code).await,
        Commands::Info { kernel, cwd } => print_info(config, &kernel, cwd).await,
    }
}

type Events = mpsc::UnboundedReceiver<Action>;

async fn start_session(
    config: SessionConfig,
    kernel: &str,
    cwd: PathBuf,
) -> Result<(SessionHandle, Events)> {
    let launcher = Arc::new(RuntimeLauncher::new(config.clone()));
    let (handle, events) = session::spawn(config, launcher);
    handle
        .dispatch(Action::launch_kernel_by_name(kernel, cwd))
        .await?;
    Ok((handle, events))
}

/// Wait for the launch to settle, returning the kernel's language info.
async fn wait_for_kernel(events: &mut Events, json: bool) -> Result<Value> {
    let mut lang_info = Value::Null;
    while let Some(event) = events.recv().await {
        if json {
            print_json(&event)?;
        }
        match event {
            Action::SetKernelInfo { lang_info: info, .. } => lang_info = info,
            Action::NewKernel { kernel } => {
                info!("[kernel-session] Kernel {} ready", kernel.kernel_spec().name);
                return Ok(lang_info);
            }
            Action::ErrorKernelLaunchFailed { payload } => bail!(payload),
            _ => {}
        }
    }
    bail!("session ended before the kernel started")
}

async fn print_info(config: SessionConfig, kernel: &str, cwd: PathBuf) -> Result<()> {
    let (_handle, mut events) = start_session(config, kernel, cwd).await?;
    let lang_info = wait_for_kernel(&mut events, false).await?;
    println!("{}", serde_json::to_string_pretty(&lang_info)?);
    Ok(())
}

async fn run_cells(
    config: SessionConfig,
    kernel: &str,
    cwd: PathBuf,
    json: bool,
    cells: &[String],
) -> Result<()> {
    let (handle, mut events) = start_session(config, kernel, cwd).await?;
    wait_for_kernel(&mut events, json).await?;

    let mut notebook = NotebookOutputs::new();
    let mut errored = 0;

    for (index, source) in cells.iter().enumerate() {
        let cell_id = format!("cell-{}", index);
        handle
            .dispatch(Action::execute_cell(cell_id.as_str(), source.as_str()))
            .await?;

        let status = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    handle.dispatch(Action::abort_execution(cell_id.as_str())).await?;
                    bail!("execution of {} aborted", cell_id);
                }
                event = events.recv() => {
                    let event = event.context("session ended during execution")?;
                    if json {
                        print_json(&event)?;
                    }
                    notebook.apply(&event);
                    match event {
                        Action::UpdateCellStatus { id, status }
                            if id == cell_id && status != CellStatus::Busy => break status,
                        Action::ErrorExecuting { payload } => bail!(payload),
                        _ => {}
                    }
                }
            }
        };

        if status == CellStatus::Errored {
            errored += 1;
        }
        if !json {
            render_cell(&notebook, &cell_id)?;
        }
    }

    if errored > 0 {
        bail!("{} of {} cells raised an error", errored, cells.len());
    }
    Ok(())
}

fn print_json(event: &Action) -> Result<()> {
    // NEW_KERNEL carries the live connection and has no JSON form
    if event.kind() == ActionKind::NewKernel {
        return Ok(());
    }
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn plain_text(output: &Value) -> Option<&str> {
    output
        .get("data")
        .and_then(|d| d.get("text/plain"))
        .and_then(|t| t.as_str())
}

fn render_cell(notebook: &NotebookOutputs, cell_id: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();

    for output in notebook.outputs(cell_id) {
        match output["output_type"].as_str() {
            Some("stream") => {
                let text = output["text"].as_str().unwrap_or_default();
                if output["name"] == "stderr" {
                    write!(stderr, "{}", text)?;
                } else {
                    write!(stdout, "{}", text)?;
                }
            }
            Some("execute_result") => {
                if let Some(text) = plain_text(output) {
                    writeln!(stdout, "Out[{}]: {}", output["execution_count"], text)?;
                }
            }
            Some("display_data") => {
                if let Some(text) = plain_text(output) {
                    writeln!(stdout, "{}", text)?;
                }
            }
            Some("error") => {
                writeln!(
                    stderr,
                    "{}: {}",
                    output["ename"].as_str().unwrap_or_default(),
                    output["evalue"].as_str().unwrap_or_default()
                )?;
                for line in output["traceback"].as_array().into_iter().flatten() {
                    writeln!(stderr, "{}", line.as_str().unwrap_or_default())?;
                }
            }
            _ => {}
        }
    }
    stdout.flush()?;
    Ok(())
}
