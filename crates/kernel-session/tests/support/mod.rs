//! Shared fixtures for session integration tests: a scripted in-process
//! kernel and a launcher that hands it out.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use kernel_session::launch::{KernelLauncher, KernelRuntime};
use kernel_session::{Action, CellStatus, KernelChannels, KernelSide, KernelSpec};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn reply(msg_type: &str, content: Value, parent: &JupyterMessage) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content)
        .expect("fixture content should parse");
    JupyterMessage::new(content, Some(parent))
}

fn status(state: &str, parent: &JupyterMessage) -> JupyterMessage {
    reply("status", json!({ "execution_state": state }), parent)
}

/// Messages the kernel publishes for one `execute_request`, between its busy
/// and idle statuses. `None` means the kernel never finishes it.
fn script(code: &str, parent: &JupyterMessage, count: usize) -> Option<Vec<JupyterMessage>> {
    let outputs = match code {
        "hang" => return None,
        "print" => vec![reply(
            "stream",
            json!({ "name": "stdout", "text": "hello\n" }),
            parent,
        )],
        "display" => vec![reply(
            "display_data",
            json!({
                "data": { "text/plain": "0%" },
                "metadata": {},
                "transient": { "display_id": "progress" }
            }),
            parent,
        )],
        "update" => vec![reply(
            "update_display_data",
            json!({
                "data": { "text/plain": "100%" },
                "metadata": {},
                "transient": { "display_id": "progress" }
            }),
            parent,
        )],
        "raise" => vec![reply(
            "error",
            json!({ "ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": [] }),
            parent,
        )],
        _ => Vec::new(),
    };

    let mut messages = outputs;
    messages.push(reply(
        "execute_reply",
        json!({ "status": "ok", "execution_count": count, "payload": [], "user_expressions": {} }),
        parent,
    ));
    Some(messages)
}

fn serve(mut side: KernelSide) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut count = 0;
        while let Some(request) = side.requests.recv().await {
            let _ = side.broadcast.send(status("busy", &request));
            let body = match &request.content {
                JupyterMessageContent::KernelInfoRequest(_) => Some(vec![reply(
                    "kernel_info_reply",
                    json!({
                        "status": "ok",
                        "protocol_version": "5.3",
                        "implementation": "fake",
                        "implementation_version": "0.1.0",
                        "language_info": {
                            "name": "python",
                            "version": "3.12.0",
                            "mimetype": "text/x-python",
                            "file_extension": ".py",
                            "pygments_lexer": "ipython3",
                            "codemirror_mode": { "name": "ipython", "version": 3 },
                            "nbconvert_exporter": "python"
                        },
                        "banner": "",
                        "help_links": [],
                        "debugger": false
                    }),
                    &request,
                )]),
                JupyterMessageContent::ExecuteRequest(execute) => {
                    count += 1;
                    script(&execute.code, &request, count)
                }
                _ => Some(Vec::new()),
            };
            let Some(body) = body else { continue };
            for message in body {
                let _ = side.broadcast.send(message);
            }
            let _ = side.broadcast.send(status("idle", &request));
        }
    })
}

/// Launches the scripted kernel for the `python3` kernelspec only.
#[derive(Default)]
pub struct FakeLauncher {
    pub starts: AtomicUsize,
}

#[async_trait]
impl KernelLauncher for FakeLauncher {
    async fn start(&self, spec: &KernelSpec, _cwd: &Path) -> anyhow::Result<KernelRuntime> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if spec.name != "python3" {
            anyhow::bail!("No such kernelspec: {}", spec.name);
        }
        let (channels, side) = KernelChannels::pair(256);
        Ok(KernelRuntime::in_memory(channels, vec![serve(side)]))
    }
}

pub fn launcher() -> Arc<FakeLauncher> {
    Arc::new(FakeLauncher::default())
}

/// Collect events until `done` has seen what it needs. Panics after five
/// seconds.
pub async fn collect_until<F>(events: &mut mpsc::UnboundedReceiver<Action>, mut done: F) -> Vec<Action>
where
    F: FnMut(&[Action]) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&seen) {
            match events.recv().await {
                Some(action) => seen.push(action),
                None => break,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out; events so far: {:?}", seen);
    seen
}

/// Whether `actions` contain the terminal status of `cell_id`.
pub fn finished(actions: &[Action], cell_id: &str) -> bool {
    actions.iter().any(|a| {
        matches!(
            a,
            Action::UpdateCellStatus { id, status } if id == cell_id && *status != CellStatus::Busy
        )
    })
}
