//! Kernel-wide display updates.
//!
//! `update_display_data` can target output rendered by any cell, so it is
//! routed independently of cell executions. Plain `display_data` stays with
//! the cell that produced it.

use futures::future;
use futures::stream::{BoxStream, StreamExt};
use jupyter_protocol::JupyterMessageContent;

use crate::action::Action;
use crate::channels::KernelChannels;
use crate::error::KernelError;
use crate::outputs::display_update_output;

pub fn watch_display_updates(
    channels: &KernelChannels,
) -> Result<BoxStream<'static, Action>, KernelError> {
    let messages = channels.messages()?;
    Ok(messages
        .filter_map(|message| {
            let action = match &message.content {
                JupyterMessageContent::UpdateDisplayData(update) => Some(Action::UpdateDisplay {
                    output: display_update_output(update),
                }),
                _ => None,
            };
            future::ready(action)
        })
        .boxed())
}
