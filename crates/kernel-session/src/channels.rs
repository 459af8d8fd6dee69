//! In-process view of a kernel's channels.
//!
//! A kernel is reached through two logical directions:
//!
//! - **shell**: requests from us to the kernel. One ordered queue per kernel;
//!   whatever sits on the other end (the `runtimelib` writer task, or a fake
//!   kernel in tests) drains it in send order.
//! - **broadcast**: everything the kernel says. Both iopub traffic and shell
//!   replies are fanned out here, so any number of subscribers (cell
//!   executions, the display router, the execution-state tracker) each see
//!   every message. Correlation happens in the subscriber via
//!   `parent_header.msg_id`.
//!
//! The broadcast side closes once every producer on the kernel side has been
//! dropped; subscribers then see the end of their stream.

use futures::stream::{self, BoxStream, StreamExt};
use jupyter_protocol::JupyterMessage;
use log::warn;
use tokio::sync::{broadcast, mpsc};

use crate::error::KernelError;

/// Frontend half of a kernel's channels.
///
/// Cloning is cheap and yields an independent subscription point: a clone
/// only sees broadcast messages sent after it was made.
#[derive(Default)]
pub struct KernelChannels {
    shell: Option<mpsc::UnboundedSender<JupyterMessage>>,
    broadcast: Option<broadcast::Receiver<JupyterMessage>>,
}

/// Kernel half of an in-process channel pair.
pub struct KernelSide {
    /// Requests sent by the frontend, in send order.
    pub requests: mpsc::UnboundedReceiver<JupyterMessage>,
    /// Publishes to every frontend subscriber.
    pub broadcast: broadcast::Sender<JupyterMessage>,
}

impl KernelChannels {
    /// Create a connected pair: the frontend half and the kernel half.
    pub fn pair(broadcast_capacity: usize) -> (KernelChannels, KernelSide) {
        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = broadcast::channel(broadcast_capacity.max(1));

        let channels = KernelChannels {
            shell: Some(shell_tx),
            broadcast: Some(broadcast_rx),
        };
        let side = KernelSide {
            requests: shell_rx,
            broadcast: broadcast_tx,
        };
        (channels, side)
    }

    /// Assemble channels from individual halves, either of which may be absent.
    pub fn from_parts(
        shell: Option<mpsc::UnboundedSender<JupyterMessage>>,
        broadcast: Option<broadcast::Receiver<JupyterMessage>>,
    ) -> Self {
        Self { shell, broadcast }
    }

    /// Channels with neither direction, as seen before any kernel is launched.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Both directions present and the shell queue still has a reader.
    pub fn is_connected(&self) -> bool {
        self.broadcast.is_some() && self.shell.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Queue a message on the shell channel.
    pub fn send(&self, message: JupyterMessage) -> Result<(), KernelError> {
        let shell = self.shell.as_ref().ok_or(KernelError::NotConnected)?;
        shell
            .send(message)
            .map_err(|_| KernelError::NotConnected)
    }

    /// A new receiver that sees every broadcast message from now on.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<JupyterMessage>, KernelError> {
        self.broadcast
            .as_ref()
            .map(|rx| rx.resubscribe())
            .ok_or(KernelError::NotConnected)
    }

    /// Every broadcast message from now on, as a stream that ends when the
    /// channel closes.
    pub fn messages(&self) -> Result<BoxStream<'static, JupyterMessage>, KernelError> {
        let rx = self.subscribe()?;
        Ok(broadcast_stream(rx, "channels"))
    }
}

impl Clone for KernelChannels {
    fn clone(&self) -> Self {
        Self {
            shell: self.shell.clone(),
            broadcast: self.broadcast.as_ref().map(|rx| rx.resubscribe()),
        }
    }
}

impl std::fmt::Debug for KernelChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelChannels")
            .field("shell", &self.shell.is_some())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}

/// Adapt a broadcast receiver into a stream. Lagging is logged and skipped
/// over; the stream ends when the sender side is gone.
pub(crate) fn broadcast_stream(
    rx: broadcast::Receiver<JupyterMessage>,
    component: &'static str,
) -> BoxStream<'static, JupyterMessage> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => return Some((message, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[{}] broadcast lagged, skipped {} messages", component, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, status};
    use jupyter_protocol::{ExecuteRequest, JupyterMessageContent};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_disconnected_channels() {
        let channels = KernelChannels::disconnected();
        assert!(!channels.is_connected());
        assert_eq!(channels.subscribe().err(), Some(KernelError::NotConnected));

        let request: JupyterMessage = ExecuteRequest::new("1".to_string()).into();
        assert_eq!(channels.send(request), Err(KernelError::NotConnected));
    }

    #[test]
    fn test_half_connected_channels_are_not_connected() {
        let (shell_tx, _shell_rx) = mpsc::unbounded_channel();
        let shell_only = KernelChannels::from_parts(Some(shell_tx), None);
        assert!(!shell_only.is_connected());

        let (_tx, rx) = broadcast::channel(4);
        let broadcast_only = KernelChannels::from_parts(None, Some(rx));
        assert!(!broadcast_only.is_connected());
    }

    #[test]
    fn test_closed_shell_is_not_connected() {
        let (channels, side) = KernelChannels::pair(4);
        assert!(channels.is_connected());
        drop(side);
        assert!(!channels.is_connected());
    }

    #[tokio::test]
    async fn test_requests_arrive_in_send_order() {
        let (channels, mut side) = KernelChannels::pair(4);
        for code in ["a = 1", "b = 2", "c = 3"] {
            let request: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
            channels.send(request).unwrap();
        }

        for expected in ["a = 1", "b = 2", "c = 3"] {
            let request = side.requests.recv().await.unwrap();
            match request.content {
                JupyterMessageContent::ExecuteRequest(req) => assert_eq!(req.code, expected),
                other => panic!("unexpected content: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_every_subscriber() {
        let (channels, side) = KernelChannels::pair(16);
        let mut first = channels.messages().unwrap();
        let mut second = channels.clone().messages().unwrap();

        side.broadcast.send(status("busy", None)).unwrap();
        side.broadcast
            .send(message("stream", json!({"name": "stdout", "text": "hi"}), None))
            .unwrap();
        drop(side);

        for subscriber in [&mut first, &mut second] {
            let a = timeout(Duration::from_secs(1), subscriber.next()).await.unwrap();
            let b = timeout(Duration::from_secs(1), subscriber.next()).await.unwrap();
            assert_eq!(a.unwrap().header.msg_type, "status");
            assert_eq!(b.unwrap().header.msg_type, "stream");
            // Kernel side dropped: the stream completes.
            assert!(subscriber.next().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_going() {
        let (channels, side) = KernelChannels::pair(2);
        let mut messages = channels.messages().unwrap();

        for _ in 0..5 {
            side.broadcast.send(status("busy", None)).unwrap();
        }
        side.broadcast.send(status("idle", None)).unwrap();
        drop(side);

        let mut seen = Vec::new();
        while let Some(msg) = timeout(Duration::from_secs(1), messages.next()).await.unwrap() {
            seen.push(msg);
        }
        assert!(!seen.is_empty());
        assert!(seen.len() <= 2);
    }
}
