//! Error types shared by the orchestrators.
//!
//! None of these ever escape as a panic or a terminated action stream: the
//! session turns each one into an `ERROR_EXECUTING` or
//! `ERROR_KERNEL_LAUNCH_FAILED` event whose payload is the `Display` text.

use std::time::Duration;

/// Failures talking to a kernel over its channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// The shell sender or the broadcast receiver is missing (or already closed).
    #[error("kernel not connected")]
    NotConnected,

    /// The broadcast side closed while we were waiting on it.
    #[error("kernel channels closed")]
    ChannelClosed,

    #[error("kernel did not respond within {0:?}")]
    Timeout(Duration),

    /// The kernel answered with content we could not read.
    #[error("invalid {msg_type} from kernel: {reason}")]
    InvalidReply { msg_type: String, reason: String },
}

/// A driving action that is missing required fields or carries the wrong types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedAction {
    #[error("execute cell needs an id")]
    MissingId,

    #[error("execute cell needs source string")]
    SourceNotText,

    #[error("launch kernel needs a kernel spec")]
    MissingKernelSpec,

    #[error("launch kernel needs a cwd")]
    MissingCwd,
}

/// Why a kernel launch ended in `ERROR_KERNEL_LAUNCH_FAILED`.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Malformed(#[from] MalformedAction),

    #[error("failed to start kernel: {0:#}")]
    Start(#[source] anyhow::Error),

    #[error("kernel handshake failed: {0}")]
    Handshake(#[from] KernelError),
}

/// Talking to a session task that is no longer running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
}
