//! `kernel_info` handshake.
//!
//! Sends one `kernel_info_request` and waits for the `kernel_info_reply`
//! whose parent is that request, to learn the kernel's language. Status
//! messages for the same request share the parent and are skipped.

use std::time::Duration;

use jupyter_protocol::{JupyterMessage, JupyterMessageContent, KernelInfoRequest, LanguageInfo};
use log::{debug, info};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::action::Action;
use crate::channels::KernelChannels;
use crate::error::KernelError;

/// Run the handshake and return `content.language_info` of the reply.
pub async fn acquire_kernel_info(
    channels: &KernelChannels,
    timeout: Duration,
) -> Result<Value, KernelError> {
    // Subscribe before sending so the reply cannot slip past us
    let mut rx = channels.subscribe()?;

    let request: JupyterMessage = KernelInfoRequest::default().into();
    let msg_id = request.header.msg_id.clone();
    channels.send(request)?;
    debug!("[handshake] Sent kernel_info_request: msg_id={}", msg_id);

    let language_info = tokio::time::timeout(timeout, wait_for_reply(&mut rx, &msg_id))
        .await
        .map_err(|_| KernelError::Timeout(timeout))??;

    info!(
        "[handshake] Kernel language: {}",
        language_info
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
    );
    Ok(language_info)
}

async fn wait_for_reply(
    rx: &mut broadcast::Receiver<JupyterMessage>,
    msg_id: &str,
) -> Result<Value, KernelError> {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(KernelError::ChannelClosed),
        };

        let is_ours = message
            .parent_header
            .as_ref()
            .map(|h| h.msg_id.as_str())
            == Some(msg_id);
        if !is_ours {
            continue;
        }

        if let JupyterMessageContent::KernelInfoReply(reply) = message.content {
            return language_info_value(&reply.language_info);
        }
    }
}

fn language_info_value(language_info: &LanguageInfo) -> Result<Value, KernelError> {
    serde_json::to_value(language_info).map_err(|e| KernelError::InvalidReply {
        msg_type: "kernel_info_reply".to_string(),
        reason: e.to_string(),
    })
}

pub fn set_language_info(lang_info: Value) -> Action {
    Action::SetLanguageInfo { lang_info }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::testing::{kernel_info_reply, spawn_fake_kernel, status};

    #[tokio::test]
    async fn test_kernel_info_round_trip() {
        let (channels, side) = KernelChannels::pair(16);
        spawn_fake_kernel(side);

        let lang_info = acquire_kernel_info(&channels, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lang_info["name"], "python");

        let action = set_language_info(lang_info);
        assert_eq!(action.kind(), ActionKind::SetLanguageInfo);
    }

    #[tokio::test]
    async fn test_sends_exactly_one_request() {
        let (channels, mut side) = KernelChannels::pair(16);

        let responder = tokio::spawn(async move {
            let request = side.requests.recv().await.unwrap();
            assert_eq!(request.header.msg_type, "kernel_info_request");
            side.broadcast.send(status("busy", Some(&request))).unwrap();
            side.broadcast.send(kernel_info_reply(&request)).unwrap();
            side.broadcast.send(status("idle", Some(&request))).unwrap();
            // Nothing else should ever be sent
            assert!(side.requests.recv().await.is_none());
        });

        let lang_info = acquire_kernel_info(&channels, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lang_info["name"], "python");

        drop(channels);
        tokio::time::timeout(Duration::from_secs(1), responder)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ignores_replies_to_other_requests() {
        let (channels, mut side) = KernelChannels::pair(16);

        tokio::spawn(async move {
            let request = side.requests.recv().await.unwrap();
            let stranger: JupyterMessage = KernelInfoRequest::default().into();
            side.broadcast.send(kernel_info_reply(&stranger)).unwrap();
            // Keep the channel open without ever answering our request
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(request);
        });

        let result = acquire_kernel_info(&channels, Duration::from_millis(100)).await;
        assert_eq!(result, Err(KernelError::Timeout(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn test_channel_close_fails_handshake() {
        let (channels, mut side) = KernelChannels::pair(16);

        tokio::spawn(async move {
            let _request = side.requests.recv().await;
            drop(side.broadcast);
        });

        let result = acquire_kernel_info(&channels, Duration::from_secs(5)).await;
        assert_eq!(result, Err(KernelError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_disconnected_kernel() {
        let result =
            acquire_kernel_info(&KernelChannels::disconnected(), Duration::from_secs(1)).await;
        assert_eq!(result, Err(KernelError::NotConnected));
    }
}
