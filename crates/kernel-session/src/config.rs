//! Session configuration.

use std::time::Duration;

/// Tunables for a [`crate::session::Session`] and the launches it performs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on the `kernel_info` handshake after a kernel starts.
    pub handshake_timeout: Duration,
    /// Pause between spawning a kernel process and connecting to its sockets.
    pub startup_delay: Duration,
    /// Ring size of each kernel's broadcast channel. Subscribers further
    /// behind than this lose messages (and log a warning).
    pub broadcast_capacity: usize,
    /// Pending driving actions before `SessionHandle::dispatch` waits.
    pub inbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            startup_delay: Duration::from_millis(500),
            broadcast_capacity: 1024,
            inbox_capacity: 100,
        }
    }
}
