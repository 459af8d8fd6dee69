//! Actions flowing into and out of a session.
//!
//! One enum carries both directions, the way a redux-style frontend store
//! sees them: driving actions (`EXECUTE_CELL`, `LAUNCH_KERNEL`, ...) come in
//! from the host, and everything the orchestrators produce goes back out.
//! The JSON shape is `{"type": "SCREAMING_SNAKE_CASE", ...camelCaseFields}`
//! so frontends can consume events directly.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedAction;
use crate::launch::KernelConnection;

/// What to launch. Only `name` is required; a non-empty `argv` bypasses
/// kernelspec discovery (`{connection_file}` is substituted in it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,
}

impl KernelSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            language: None,
            argv: Vec::new(),
        }
    }
}

/// Per-cell execution status as shown next to the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Busy,
    Idle,
    /// Finished, but the kernel reported an `error` output along the way.
    Errored,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Busy => write!(f, "busy"),
            CellStatus::Idle => write!(f, "idle"),
            CellStatus::Errored => write!(f, "errored"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Action {
    // Driving actions.
    /// `id` and `source` stay loosely typed so that a malformed action from
    /// the host can be reported instead of failing deserialization.
    ExecuteCell {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        source: Value,
    },
    AbortExecution {
        id: String,
    },
    LaunchKernel {
        #[serde(default)]
        kernel_spec: Option<KernelSpec>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    LaunchKernelByName {
        kernel_spec_name: String,
        cwd: PathBuf,
    },
    /// A freshly ready kernel. Scopes the kernel-wide watchers. Lives only
    /// in-process since it carries the live connection.
    #[serde(skip)]
    NewKernel {
        kernel: Arc<KernelConnection>,
    },

    // Cell events.
    UpdateCellPagers {
        id: String,
        pagers: Vec<Value>,
    },
    UpdateCellStatus {
        id: String,
        status: CellStatus,
    },
    ClearOutputs {
        id: String,
    },
    /// Append one normalized output record to the cell.
    UpdateCellOutput {
        id: String,
        output: Value,
    },
    UpdateCellExecutionCount {
        id: String,
        execution_count: usize,
    },

    // Kernel-wide events.
    UpdateDisplay {
        output: Value,
    },
    SetLanguageInfo {
        lang_info: Value,
    },
    SetExecutionState {
        execution_state: String,
    },
    SetKernelInfo {
        kernel_spec: KernelSpec,
        lang_info: Value,
    },

    // Failures, with a payload fit for display.
    ErrorExecuting {
        payload: String,
    },
    ErrorKernelLaunchFailed {
        payload: String,
    },
}

/// Discriminant of an [`Action`], named after its wire `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ExecuteCell,
    AbortExecution,
    LaunchKernel,
    LaunchKernelByName,
    NewKernel,
    UpdateCellPagers,
    UpdateCellStatus,
    ClearOutputs,
    UpdateCellOutput,
    UpdateCellExecutionCount,
    UpdateDisplay,
    SetLanguageInfo,
    SetExecutionState,
    SetKernelInfo,
    ErrorExecuting,
    ErrorKernelLaunchFailed,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ExecuteCell => "EXECUTE_CELL",
            ActionKind::AbortExecution => "ABORT_EXECUTION",
            ActionKind::LaunchKernel => "LAUNCH_KERNEL",
            ActionKind::LaunchKernelByName => "LAUNCH_KERNEL_BY_NAME",
            ActionKind::NewKernel => "NEW_KERNEL",
            ActionKind::UpdateCellPagers => "UPDATE_CELL_PAGERS",
            ActionKind::UpdateCellStatus => "UPDATE_CELL_STATUS",
            ActionKind::ClearOutputs => "CLEAR_OUTPUTS",
            ActionKind::UpdateCellOutput => "UPDATE_CELL_OUTPUT",
            ActionKind::UpdateCellExecutionCount => "UPDATE_CELL_EXECUTION_COUNT",
            ActionKind::UpdateDisplay => "UPDATE_DISPLAY",
            ActionKind::SetLanguageInfo => "SET_LANGUAGE_INFO",
            ActionKind::SetExecutionState => "SET_EXECUTION_STATE",
            ActionKind::SetKernelInfo => "SET_KERNEL_INFO",
            ActionKind::ErrorExecuting => "ERROR_EXECUTING",
            ActionKind::ErrorKernelLaunchFailed => "ERROR_KERNEL_LAUNCH_FAILED",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn execute_cell(id: impl Into<String>, source: impl Into<String>) -> Self {
        Action::ExecuteCell {
            id: Some(id.into()),
            source: Value::String(source.into()),
        }
    }

    pub fn abort_execution(id: impl Into<String>) -> Self {
        Action::AbortExecution { id: id.into() }
    }

    pub fn launch_kernel(kernel_spec: KernelSpec, cwd: impl Into<PathBuf>) -> Self {
        Action::LaunchKernel {
            kernel_spec: Some(kernel_spec),
            cwd: Some(cwd.into()),
        }
    }

    pub fn launch_kernel_by_name(name: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Action::LaunchKernelByName {
            kernel_spec_name: name.into(),
            cwd: cwd.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ExecuteCell { .. } => ActionKind::ExecuteCell,
            Action::AbortExecution { .. } => ActionKind::AbortExecution,
            Action::LaunchKernel { .. } => ActionKind::LaunchKernel,
            Action::LaunchKernelByName { .. } => ActionKind::LaunchKernelByName,
            Action::NewKernel { .. } => ActionKind::NewKernel,
            Action::UpdateCellPagers { .. } => ActionKind::UpdateCellPagers,
            Action::UpdateCellStatus { .. } => ActionKind::UpdateCellStatus,
            Action::ClearOutputs { .. } => ActionKind::ClearOutputs,
            Action::UpdateCellOutput { .. } => ActionKind::UpdateCellOutput,
            Action::UpdateCellExecutionCount { .. } => ActionKind::UpdateCellExecutionCount,
            Action::UpdateDisplay { .. } => ActionKind::UpdateDisplay,
            Action::SetLanguageInfo { .. } => ActionKind::SetLanguageInfo,
            Action::SetExecutionState { .. } => ActionKind::SetExecutionState,
            Action::SetKernelInfo { .. } => ActionKind::SetKernelInfo,
            Action::ErrorExecuting { .. } => ActionKind::ErrorExecuting,
            Action::ErrorKernelLaunchFailed { .. } => ActionKind::ErrorKernelLaunchFailed,
        }
    }

    /// The cell this action concerns, if any.
    pub fn cell_id(&self) -> Option<&str> {
        match self {
            Action::ExecuteCell { id, .. } => id.as_deref(),
            Action::AbortExecution { id }
            | Action::UpdateCellPagers { id, .. }
            | Action::UpdateCellStatus { id, .. }
            | Action::ClearOutputs { id }
            | Action::UpdateCellOutput { id, .. }
            | Action::UpdateCellExecutionCount { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }

    /// Check the fields of an `EXECUTE_CELL` and hand back `(id, source)`.
    ///
    /// Any other action is rejected as missing an id.
    pub fn validate_execute(&self) -> Result<(&str, &str), MalformedAction> {
        let Action::ExecuteCell { id, source } = self else {
            return Err(MalformedAction::MissingId);
        };
        let id = id.as_deref().ok_or(MalformedAction::MissingId)?;
        let source = source.as_str().ok_or(MalformedAction::SourceNotText)?;
        Ok((id, source))
    }
}
