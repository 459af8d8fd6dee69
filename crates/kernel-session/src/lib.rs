//! kernel-session - Run notebook cells against a Jupyter kernel.
//!
//! This crate keeps a frontend's view of one kernel consistent with the
//! asynchronous Jupyter messaging protocol. It covers three lifecycles:
//!
//! - launching a kernel and learning its language through `kernel_info`
//! - executing a cell, from `execute_request` to the correlated idle status,
//!   with outputs, pagers and aborts along the way
//! - routing `update_display_data` to output rendered by any cell
//!
//! Hosts talk to it through [`action::Action`] values: driving actions go
//! into a [`session::Session`], produced actions come back out as a stream
//! of events shaped like a redux store's.

pub mod action;
pub mod channels;
pub mod config;
pub mod display;
pub mod error;
pub mod execute;
pub mod execution_state;
pub mod handshake;
pub mod launch;
pub mod outputs;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod testing;

pub use action::{Action, ActionKind, CellStatus, KernelSpec};
pub use channels::{KernelChannels, KernelSide};
pub use config::SessionConfig;
pub use error::{KernelError, LaunchError, MalformedAction, SessionError};
pub use launch::{KernelConnection, KernelLauncher, KernelRuntime};
pub use runtime::RuntimeLauncher;
pub use session::{Session, SessionHandle};
