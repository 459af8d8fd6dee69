//! Message builders and an in-process fake kernel for unit tests.

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::channels::KernelSide;

/// Build a message from its wire `msg_type` and JSON content.
pub(crate) fn message(msg_type: &str, content: Value, parent: Option<&JupyterMessage>) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content)
        .expect("test message content should parse");
    JupyterMessage::new(content, parent)
}

pub(crate) fn status(execution_state: &str, parent: Option<&JupyterMessage>) -> JupyterMessage {
    message(
        "status",
        json!({ "execution_state": execution_state }),
        parent,
    )
}

pub(crate) fn kernel_info_reply(parent: &JupyterMessage) -> JupyterMessage {
    message(
        "kernel_info_reply",
        json!({
            "status": "ok",
            "protocol_version": "5.3",
            "implementation": "ipython",
            "implementation_version": "8.21.0",
            "language_info": {
                "name": "python",
                "version": "3.12.1",
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
        Some(parent),
    )
}

pub(crate) fn execute_reply(parent: &JupyterMessage, execution_count: usize, payload: Value) -> JupyterMessage {
    message(
        "execute_reply",
        json!({
            "status": "ok",
            "execution_count": execution_count,
            "payload": payload,
            "user_expressions": {}
        }),
        Some(parent),
    )
}

/// Answer requests the way an IPython kernel roughly does.
///
/// `kernel_info_request` gets busy / reply / idle. `execute_request` gets
/// busy, outputs chosen by the code, `execute_reply`, idle. Recognised code:
/// `print`, `1 + 1`, `raise`, `help?`, `display` (display id `progress`),
/// `update` (patches display id `progress`), `hang` (never goes idle).
pub(crate) fn spawn_fake_kernel(mut side: KernelSide) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut execution_count = 0;
        while let Some(request) = side.requests.recv().await {
            let mut replies = vec![status("busy", Some(&request))];
            match &request.content {
                JupyterMessageContent::KernelInfoRequest(_) => {
                    replies.push(kernel_info_reply(&request));
                }
                JupyterMessageContent::ExecuteRequest(execute) => {
                    execution_count += 1;
                    replies.extend(outputs_for(&execute.code, &request, execution_count));
                    if execute.code == "hang" {
                        for reply in replies {
                            let _ = side.broadcast.send(reply);
                        }
                        continue;
                    }
                    let payload = if execute.code == "help?" {
                        json!([{ "source": "page", "data": { "text/plain": "Docstring: help" }, "start": 0 }])
                    } else {
                        json!([])
                    };
                    replies.push(execute_reply(&request, execution_count, payload));
                }
                _ => {}
            }
            replies.push(status("idle", Some(&request)));

            for reply in replies {
                let _ = side.broadcast.send(reply);
            }
        }
    })
}

fn outputs_for(code: &str, request: &JupyterMessage, execution_count: usize) -> Vec<JupyterMessage> {
    match code {
        "print" => vec![message(
            "stream",
            json!({ "name": "stdout", "text": "hello\n" }),
            Some(request),
        )],
        "1 + 1" => vec![message(
            "execute_result",
            json!({
                "execution_count": execution_count,
                "data": { "text/plain": "2" },
                "metadata": {}
            }),
            Some(request),
        )],
        "raise" => vec![message(
            "error",
            json!({
                "ename": "ValueError",
                "evalue": "boom",
                "traceback": ["Traceback (most recent call last)", "ValueError: boom"]
            }),
            Some(request),
        )],
        "display" => vec![message(
            "display_data",
            json!({
                "data": { "text/plain": "0%" },
                "metadata": {},
                "transient": { "display_id": "progress" }
            }),
            Some(request),
        )],
        "update" => vec![message(
            "update_display_data",
            json!({
                "data": { "text/plain": "100%" },
                "metadata": {},
                "transient": { "display_id": "progress" }
            }),
            Some(request),
        )],
        _ => Vec::new(),
    }
}
