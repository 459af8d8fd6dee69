//! Normalized output records.
//!
//! Kernel messages are turned into nbformat-style JSON records
//! (`{"output_type": "stream", ...}`) before they leave the crate.
//! `jupyter_protocol` would serialize them as `{"StreamContent": {...}}`,
//! which is not what notebook consumers expect.
//!
//! [`NotebookOutputs`] is the consumer side: it folds the produced actions
//! into per-cell output lists, including retroactive display updates.

use std::collections::HashMap;

use jupyter_protocol::{JupyterMessageContent, Payload, UpdateDisplayData};
use serde_json::{json, Value};

use crate::action::Action;

/// Convert iopub output content to an nbformat output record.
///
/// Returns `None` for content that is not an output.
pub fn output_from_content(content: &JupyterMessageContent) -> Option<Value> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => {
            let mut output = json!({
                "output_type": "display_data",
                "data": data.data,
                "metadata": data.metadata
            });
            // Keep the display_id so later update_display_data can find this output
            if let Some(display_id) = data.transient.as_ref().and_then(|t| t.display_id.as_ref()) {
                output["transient"] = json!({ "display_id": display_id });
            }
            Some(output)
        }
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

/// The replacement record carried by `UPDATE_DISPLAY`.
pub fn display_update_output(update: &UpdateDisplayData) -> Value {
    let mut output = json!({
        "output_type": "display_data",
        "data": update.data,
    });
    if !update.metadata.is_empty() {
        output["metadata"] = json!(update.metadata);
    }
    output["transient"] = match &update.transient.display_id {
        Some(display_id) => json!({ "display_id": display_id }),
        None => json!({}),
    };
    output
}

/// `page` payloads from an `execute_reply` become pager entries; the other
/// payload kinds (set_next_input, edit_magic, ask_exit) are not pagers.
pub fn pager_from_payload(payload: &Payload) -> Option<Value> {
    match payload {
        Payload::Page { .. } => serde_json::to_value(payload).ok(),
        _ => None,
    }
}

fn display_id(output: &Value) -> Option<&str> {
    output
        .get("transient")
        .and_then(|t| t.get("display_id"))
        .and_then(|d| d.as_str())
}

/// Outputs of every cell, as a frontend would render them.
#[derive(Debug, Clone, Default)]
pub struct NotebookOutputs {
    cells: HashMap<String, Vec<Value>>,
    execution_counts: HashMap<String, usize>,
}

impl NotebookOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one action in. Returns whether anything changed.
    pub fn apply(&mut self, action: &Action) -> bool {
        match action {
            Action::ClearOutputs { id } => {
                self.cells.insert(id.clone(), Vec::new());
                true
            }
            Action::UpdateCellOutput { id, output } => {
                let outputs = self.cells.entry(id.clone()).or_default();
                append_output(outputs, output.clone());
                true
            }
            Action::UpdateCellExecutionCount {
                id,
                execution_count,
            } => {
                self.execution_counts.insert(id.clone(), *execution_count);
                true
            }
            Action::UpdateDisplay { output } => self.update_display(output) > 0,
            _ => false,
        }
    }

    pub fn outputs(&self, cell_id: &str) -> &[Value] {
        self.cells.get(cell_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn execution_count(&self, cell_id: &str) -> Option<usize> {
        self.execution_counts.get(cell_id).copied()
    }

    /// Replace data (and metadata, when given) of every output in any cell
    /// that carries the update's display id. Returns how many were replaced.
    pub fn update_display(&mut self, update: &Value) -> usize {
        let Some(target) = display_id(update) else {
            return 0;
        };
        let mut replaced = 0;
        for outputs in self.cells.values_mut() {
            for output in outputs.iter_mut() {
                if display_id(output) != Some(target) {
                    continue;
                }
                output["data"] = update.get("data").cloned().unwrap_or_else(|| json!({}));
                if let Some(metadata) = update.get("metadata") {
                    output["metadata"] = metadata.clone();
                }
                replaced += 1;
            }
        }
        replaced
    }
}

/// Append an output, merging it into the previous one when both are stream
/// records of the same name.
pub fn append_output(outputs: &mut Vec<Value>, output: Value) {
    if let Some(last) = outputs.last_mut() {
        let same_stream = last["output_type"] == "stream"
            && output["output_type"] == "stream"
            && last["name"] == output["name"];
        if same_stream {
            if let (Some(previous), Some(more)) = (last["text"].as_str(), output["text"].as_str()) {
                let merged = format!("{}{}", previous, more);
                last["text"] = Value::String(merged);
                return;
            }
        }
    }
    outputs.push(output);
}
