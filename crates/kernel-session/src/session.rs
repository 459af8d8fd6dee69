//! The per-session actor.
//!
//! A [`Session`] owns the current kernel, the in-flight executions and every
//! live action stream (launches, executions, kernel-wide watchers). Driving
//! actions arrive through a [`SessionHandle`]; everything produced comes out
//! of one unbounded event channel, in the order the session saw it.
//!
//! Driving actions are always handled before stream output, so an
//! `ABORT_EXECUTION` takes effect before any further event of that cell.

use std::sync::Arc;

use futures::stream::{AbortHandle, Abortable, BoxStream, SelectAll, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::action::{Action, CellStatus};
use crate::channels::KernelChannels;
use crate::config::SessionConfig;
use crate::display::watch_display_updates;
use crate::error::{KernelError, SessionError};
use crate::execute::{execute, ExecutionRegistry};
use crate::execution_state::watch_execution_state;
use crate::handshake::set_language_info;
use crate::launch::{launch, launch_by_name, KernelConnection, KernelLauncher, LaunchState};

pub struct Session {
    config: SessionConfig,
    launcher: Arc<dyn KernelLauncher>,
    kernel: Option<Arc<KernelConnection>>,
    launch_state: LaunchState,
    executions: ExecutionRegistry,
    /// Abort handles of the current kernel's state watcher and display router.
    watchers: Vec<AbortHandle>,
    streams: SelectAll<BoxStream<'static, Action>>,
    events: mpsc::UnboundedSender<Action>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        launcher: Arc<dyn KernelLauncher>,
        events: mpsc::UnboundedSender<Action>,
    ) -> Self {
        Self {
            config,
            launcher,
            kernel: None,
            launch_state: LaunchState::Idle,
            executions: ExecutionRegistry::new(),
            watchers: Vec::new(),
            streams: SelectAll::new(),
            events,
        }
    }

    pub fn launch_state(&self) -> LaunchState {
        self.launch_state
    }

    fn set_launch_state(&mut self, state: LaunchState) {
        if self.launch_state != state {
            debug!("[session] Launch {} -> {}", self.launch_state, state);
            self.launch_state = state;
        }
    }

    /// Process actions until every [`SessionHandle`] is dropped, then shut
    /// the kernel down.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Action>) {
        info!("[session] Started");
        loop {
            tokio::select! {
                biased;

                action = inbox.recv() => match action {
                    Some(action) => self.dispatch(action),
                    None => break,
                },

                Some(action) = self.streams.next(), if !self.streams.is_empty() => {
                    self.observe(action);
                }
            }
        }
        self.shutdown();
        info!("[session] Stopped");
    }

    /// Handle one driving action.
    pub fn dispatch(&mut self, action: Action) {
        debug!("[session] Dispatch {}", action.kind());
        match action {
            Action::ExecuteCell { .. } => self.execute_cell(&action),
            Action::AbortExecution { id } => {
                self.executions.abort(&id);
            }
            Action::LaunchKernel { kernel_spec, cwd } => {
                self.set_launch_state(LaunchState::Launching);
                let stream = launch(self.launcher.clone(), kernel_spec, cwd, &self.config);
                self.streams.push(stream);
            }
            Action::LaunchKernelByName {
                kernel_spec_name,
                cwd,
            } => {
                let next = launch_by_name(&kernel_spec_name, cwd);
                self.emit(next.clone());
                self.dispatch(next);
            }
            Action::NewKernel { .. } => self.observe(action),
            other => self.emit(other),
        }
    }

    fn execute_cell(&mut self, action: &Action) {
        let (id, source) = match action.validate_execute() {
            Ok(fields) => fields,
            Err(e) => {
                warn!("[session] Rejected EXECUTE_CELL: {}", e);
                self.emit(Action::ErrorExecuting {
                    payload: e.to_string(),
                });
                return;
            }
        };

        let disconnected = KernelChannels::disconnected();
        let channels = self
            .kernel
            .as_ref()
            .map(|k| k.channels())
            .unwrap_or(&disconnected);

        match execute(channels, &self.executions, id, source) {
            Ok(stream) => self.streams.push(stream),
            Err(e) => {
                warn!("[session] Cannot execute cell {}: {}", id, e);
                self.emit(Action::ErrorExecuting {
                    payload: e.to_string(),
                });
            }
        }
    }

    /// Handle one action produced by a stream.
    fn observe(&mut self, action: Action) {
        match action {
            Action::NewKernel { ref kernel } => {
                let kernel = kernel.clone();
                self.set_launch_state(LaunchState::Ready);
                self.emit(action);
                self.install(kernel);
            }
            Action::ErrorKernelLaunchFailed { .. } => {
                self.set_launch_state(LaunchState::Failed);
                self.emit(action);
            }
            Action::SetExecutionState {
                ref execution_state,
            } => {
                if let Some(kernel) = &self.kernel {
                    kernel.set_status(execution_state);
                }
                self.emit(action);
            }
            other => self.emit(other),
        }
    }

    /// Make `kernel` the session's kernel, replacing any previous one.
    fn install(&mut self, kernel: Arc<KernelConnection>) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        // Cells still running on the old kernel will never hear back from it
        for id in self.executions.abort_all() {
            warn!("[session] Cell {} lost its kernel", id);
            self.emit(Action::UpdateCellStatus {
                id,
                status: CellStatus::Errored,
            });
        }
        if let Some(previous) = self.kernel.replace(kernel.clone()) {
            previous.shutdown();
        }
        info!("[session] Kernel {} ready", kernel.kernel_spec().name);

        self.emit(set_language_info(kernel.language_info().clone()));

        let watchers: [Result<BoxStream<'static, Action>, KernelError>; 2] = [
            watch_execution_state(&kernel),
            watch_display_updates(kernel.channels()),
        ];
        for watcher in watchers {
            match watcher {
                Ok(stream) => {
                    let (handle, registration) = AbortHandle::new_pair();
                    self.watchers.push(handle);
                    self.streams.push(Abortable::new(stream, registration).boxed());
                }
                Err(e) => warn!("[session] Cannot watch kernel: {}", e),
            }
        }
    }

    fn emit(&self, action: Action) {
        debug!("[session] Emit {}", action.kind());
        if self.events.send(action).is_err() {
            debug!("[session] Event receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        self.executions.abort_all();
        if let Some(kernel) = self.kernel.take() {
            kernel.shutdown();
        }
    }
}

/// Sends driving actions to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Action>,
}

impl SessionHandle {
    pub async fn dispatch(&self, action: Action) -> Result<(), SessionError> {
        self.tx.send(action).await.map_err(|_| SessionError::Closed)
    }
}

/// Spawn a session task. Returns the handle for driving it and the receiver
/// of everything it produces.
pub fn spawn(
    config: SessionConfig,
    launcher: Arc<dyn KernelLauncher>,
) -> (SessionHandle, mpsc::UnboundedReceiver<Action>) {
    let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session = Session::new(config, launcher, events_tx);
    tokio::spawn(session.run(inbox));

    (SessionHandle { tx }, events_rx)
}
