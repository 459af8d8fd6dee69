//! Cell execution.
//!
//! [`execute`] sends one `execute_request` and returns the stream of actions
//! describing that cell's run. Kernel messages are correlated to the request
//! through `parent_header.msg_id`. The stream ends once both the correlated
//! `status: idle` and the `execute_reply` have arrived. They travel on
//! different sockets, so either may come first.
//!
//! Every live execution is tracked in an [`ExecutionRegistry`] keyed by cell
//! id, which is how `ABORT_EXECUTION` reaches the right stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::stream::{self, AbortHandle, Abortable, BoxStream, StreamExt};
use jupyter_protocol::{ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::action::{Action, CellStatus};
use crate::channels::KernelChannels;
use crate::error::KernelError;
use crate::outputs::{output_from_content, pager_from_payload};

#[derive(Debug)]
struct Entry {
    generation: u64,
    msg_id: String,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct Entries {
    next_generation: u64,
    by_cell: HashMap<String, Entry>,
}

/// In-flight executions by cell id.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    inner: Arc<Mutex<Entries>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new execution of `cell_id`. An execution of the same cell
    /// still in flight is aborted and replaced.
    fn register(&self, cell_id: &str, msg_id: &str, abort: AbortHandle) -> Ticket {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        entries.next_generation += 1;
        let generation = entries.next_generation;

        let previous = entries.by_cell.insert(
            cell_id.to_string(),
            Entry {
                generation,
                msg_id: msg_id.to_string(),
                abort,
            },
        );
        if let Some(previous) = previous {
            info!(
                "[execute] Cell {} re-executed, replacing request {}",
                cell_id, previous.msg_id
            );
            previous.abort.abort();
        }

        Ticket {
            registry: self.clone(),
            cell_id: cell_id.to_string(),
            generation,
        }
    }

    /// Stop the cell's execution stream. Returns false if the cell had
    /// nothing in flight.
    pub fn abort(&self, cell_id: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_cell
            .remove(cell_id);
        match removed {
            Some(entry) => {
                info!(
                    "[execute] Aborting cell {} (request {})",
                    cell_id, entry.msg_id
                );
                entry.abort.abort();
                true
            }
            None => {
                debug!("[execute] Abort for idle cell {}", cell_id);
                false
            }
        }
    }

    /// `msg_id` of the request currently running for `cell_id`.
    pub fn in_flight(&self, cell_id: &str) -> Option<String> {
        self.inner
            .lock()
            .ok()?
            .by_cell
            .get(cell_id)
            .map(|e| e.msg_id.clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|e| e.by_cell.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort everything, e.g. when the kernel goes away. Returns the ids
    /// of the cells that were still running.
    pub fn abort_all(&self) -> Vec<String> {
        let drained: Vec<(String, Entry)> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_cell
            .drain()
            .collect();
        let mut cell_ids = Vec::with_capacity(drained.len());
        for (cell_id, entry) in drained {
            debug!("[execute] Aborting cell {}", cell_id);
            entry.abort.abort();
            cell_ids.push(cell_id);
        }
        cell_ids.sort();
        cell_ids
    }
}

/// Removes its registry entry when the execution ends, unless a newer
/// execution of the same cell has taken the slot.
struct Ticket {
    registry: ExecutionRegistry,
    cell_id: String,
    generation: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.registry.inner.lock() {
            let ours = entries
                .by_cell
                .get(&self.cell_id)
                .is_some_and(|e| e.generation == self.generation);
            if ours {
                entries.by_cell.remove(&self.cell_id);
            }
        }
    }
}

struct CellExecution {
    cell_id: String,
    msg_id: String,
    rx: broadcast::Receiver<JupyterMessage>,
    pending: VecDeque<Action>,
    pagers: Vec<Value>,
    execution_count: Option<usize>,
    errored: bool,
    replied: bool,
    idle: bool,
    finished: bool,
    ticket: Option<Ticket>,
}

impl CellExecution {
    fn is_ours(&self, message: &JupyterMessage) -> bool {
        message
            .parent_header
            .as_ref()
            .is_some_and(|h| h.msg_id == self.msg_id)
    }

    fn handle(&mut self, message: JupyterMessage) {
        if !self.is_ours(&message) {
            return;
        }

        match &message.content {
            JupyterMessageContent::StreamContent(_)
            | JupyterMessageContent::DisplayData(_)
            | JupyterMessageContent::ExecuteResult(_)
            | JupyterMessageContent::ErrorOutput(_) => {
                if matches!(message.content, JupyterMessageContent::ErrorOutput(_)) {
                    self.errored = true;
                }
                if let Some(output) = output_from_content(&message.content) {
                    self.pending.push_back(Action::UpdateCellOutput {
                        id: self.cell_id.clone(),
                        output,
                    });
                }
            }
            JupyterMessageContent::ExecuteReply(reply) => {
                self.execution_count = Some(reply.execution_count.0);
                self.pagers
                    .extend(reply.payload.iter().filter_map(pager_from_payload));
                self.replied = true;
                if self.idle {
                    self.complete();
                }
            }
            JupyterMessageContent::Status(status)
                if status.execution_state == ExecutionState::Idle =>
            {
                self.idle = true;
                if self.replied {
                    self.complete();
                } else {
                    debug!(
                        "[execute] Cell {} idle before execute_reply, waiting",
                        self.cell_id
                    );
                }
            }
            _ => {
                debug!(
                    "[execute] Ignoring {} for cell {}",
                    message.header.msg_type, self.cell_id
                );
            }
        }
    }

    fn complete(&mut self) {
        if !self.pagers.is_empty() {
            self.pending.push_back(Action::UpdateCellPagers {
                id: self.cell_id.clone(),
                pagers: std::mem::take(&mut self.pagers),
            });
        }
        if let Some(execution_count) = self.execution_count {
            self.pending.push_back(Action::UpdateCellExecutionCount {
                id: self.cell_id.clone(),
                execution_count,
            });
        }
        let status = if self.errored {
            CellStatus::Errored
        } else {
            CellStatus::Idle
        };
        debug!("[execute] Cell {} finished: {}", self.cell_id, status);
        self.pending.push_back(Action::UpdateCellStatus {
            id: self.cell_id.clone(),
            status,
        });
        self.finish();
    }

    /// No more kernel messages are read. The registry slot is released now
    /// so the queued events are not reported as stranded.
    fn finish(&mut self) {
        self.finished = true;
        self.ticket = None;
    }

    fn close(&mut self) {
        warn!("[execute] Kernel channels closed during cell {}", self.cell_id);
        self.pending.push_back(Action::ErrorExecuting {
            payload: KernelError::ChannelClosed.to_string(),
        });
        self.pending.push_back(Action::UpdateCellStatus {
            id: self.cell_id.clone(),
            status: CellStatus::Errored,
        });
        self.finish();
    }
}

async fn next_action(mut exec: CellExecution) -> Option<(Action, CellExecution)> {
    loop {
        if let Some(action) = exec.pending.pop_front() {
            return Some((action, exec));
        }
        if exec.finished {
            return None;
        }
        match exec.rx.recv().await {
            Ok(message) => exec.handle(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "[execute] Cell {} lagged, skipped {} messages",
                    exec.cell_id, skipped
                );
            }
            Err(broadcast::error::RecvError::Closed) => exec.close(),
        }
    }
}

/// Send `source` to the kernel as an `execute_request` for `cell_id`.
///
/// The request is on the shell queue by the time this returns, so calls
/// reach the kernel in call order. Nothing is sent when the channels are
/// not connected.
pub fn execute(
    channels: &KernelChannels,
    registry: &ExecutionRegistry,
    cell_id: &str,
    source: &str,
) -> Result<BoxStream<'static, Action>, KernelError> {
    if !channels.is_connected() {
        return Err(KernelError::NotConnected);
    }
    let rx = channels.subscribe()?;

    let request: JupyterMessage = ExecuteRequest::new(source.to_string()).into();
    let msg_id = request.header.msg_id.clone();
    channels.send(request)?;
    info!("[execute] Sent execute_request: msg_id={} cell_id={}", msg_id, cell_id);

    let (abort, registration) = AbortHandle::new_pair();
    let ticket = registry.register(cell_id, &msg_id, abort);

    let exec = CellExecution {
        cell_id: cell_id.to_string(),
        msg_id,
        rx,
        pending: VecDeque::from([
            Action::UpdateCellPagers {
                id: cell_id.to_string(),
                pagers: Vec::new(),
            },
            Action::UpdateCellStatus {
                id: cell_id.to_string(),
                status: CellStatus::Busy,
            },
            Action::ClearOutputs {
                id: cell_id.to_string(),
            },
        ]),
        pagers: Vec::new(),
        execution_count: None,
        errored: false,
        replied: false,
        idle: false,
        finished: false,
        ticket: Some(ticket),
    };

    Ok(Abortable::new(stream::unfold(exec, next_action), registration).boxed())
}
