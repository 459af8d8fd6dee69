//! Kernel-wide execution state.
//!
//! Every `status` message on the broadcast side becomes a
//! `SET_EXECUTION_STATE`, whatever request it belongs to.

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use jupyter_protocol::{ExecutionState, JupyterMessageContent};

use crate::action::Action;
use crate::channels::KernelChannels;
use crate::error::KernelError;
use crate::launch::KernelConnection;

pub fn execution_state_name(state: &ExecutionState) -> &'static str {
    match state {
        ExecutionState::Starting => "starting",
        ExecutionState::Busy => "busy",
        ExecutionState::Idle => "idle",
        ExecutionState::Restarting => "restarting",
        ExecutionState::Terminating => "terminating",
        ExecutionState::Dead => "dead",
        _ => "unknown",
    }
}

/// State changes of the kernel behind `channels`, optionally starting with
/// `initial`. Ends when the broadcast side closes.
pub fn watch_channel_state(
    channels: &KernelChannels,
    initial: Option<String>,
) -> Result<BoxStream<'static, Action>, KernelError> {
    let messages = channels.messages()?;

    let updates = messages.filter_map(|message| {
        let action = match &message.content {
            JupyterMessageContent::Status(status) => Some(Action::SetExecutionState {
                execution_state: execution_state_name(&status.execution_state).to_string(),
            }),
            _ => None,
        };
        future::ready(action)
    });

    let seed = stream::iter(initial.map(|execution_state| Action::SetExecutionState {
        execution_state,
    }));
    Ok(seed.chain(updates).boxed())
}

/// State changes of a launched kernel, seeded with its current status.
pub fn watch_execution_state(
    kernel: &KernelConnection,
) -> Result<BoxStream<'static, Action>, KernelError> {
    watch_channel_state(kernel.channels(), Some(kernel.status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, status};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn states(actions: Vec<Action>) -> Vec<String> {
        actions
            .into_iter()
            .map(|a| match a {
                Action::SetExecutionState { execution_state } => execution_state,
                other => panic!("unexpected action: {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_every_status_is_relayed() {
        let (channels, side) = KernelChannels::pair(16);
        let watcher = watch_channel_state(&channels, None).unwrap();

        side.broadcast.send(status("busy", None)).unwrap();
        side.broadcast
            .send(message("stream", json!({"name": "stdout", "text": "x"}), None))
            .unwrap();
        side.broadcast.send(status("idle", None)).unwrap();
        side.broadcast.send(status("starting", None)).unwrap();
        drop(side);

        let actions = timeout(Duration::from_secs(1), watcher.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(states(actions), vec!["busy", "idle", "starting"]);
    }

    #[tokio::test]
    async fn test_seeded_with_initial_state() {
        let (channels, side) = KernelChannels::pair(16);
        let watcher = watch_channel_state(&channels, Some("idle".to_string())).unwrap();

        side.broadcast.send(status("busy", None)).unwrap();
        drop(side);

        let actions = timeout(Duration::from_secs(1), watcher.collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(states(actions), vec!["idle", "busy"]);
    }

    #[test]
    fn test_disconnected() {
        let result = watch_channel_state(&KernelChannels::disconnected(), None);
        assert_eq!(result.err(), Some(KernelError::NotConnected));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(execution_state_name(&ExecutionState::Dead), "dead");
        assert_eq!(execution_state_name(&ExecutionState::Terminating), "terminating");
        assert_eq!(execution_state_name(&ExecutionState::Restarting), "restarting");
    }
}
