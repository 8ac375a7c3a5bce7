use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::truncate;

/// Tools that only observe the project. Approved automatically in every mode.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "NotebookRead",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "BashOutput",
];

/// Tools that modify files. Approved automatically under `acceptEdits`.
pub const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Tool an agent calls to hand its plan back for review.
pub const PLAN_EXIT_TOOL: &str = "ExitPlanMode";

pub const DEFAULT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "default" => Some(PermissionMode::Default),
            "acceptEdits" | "accept-edits" | "accept_edits" => Some(PermissionMode::AcceptEdits),
            "bypassPermissions" | "bypass-permissions" | "bypass_permissions" => {
                Some(PermissionMode::BypassPermissions)
            }
            "plan" => Some(PermissionMode::Plan),
            _ => None,
        }
    }

    /// Mode a session runs under when `plan_mode` is requested on top of it.
    pub fn while_planning(self, plan_mode: bool) -> Self {
        if plan_mode {
            PermissionMode::Plan
        } else {
            self
        }
    }

    /// Mode a session resumes under once its plan is approved.
    pub fn after_plan(self) -> Self {
        match self {
            PermissionMode::Plan => PermissionMode::Default,
            other => other,
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_read_only_tool(tool: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool)
}

pub fn is_edit_tool(tool: &str) -> bool {
    EDIT_TOOLS.contains(&tool)
}

/// Whether a tool use may proceed without asking the user.
pub fn auto_approve(tool: &str, mode: PermissionMode) -> bool {
    match mode {
        PermissionMode::BypassPermissions => true,
        PermissionMode::AcceptEdits => is_read_only_tool(tool) || is_edit_tool(tool),
        PermissionMode::Default | PermissionMode::Plan => is_read_only_tool(tool),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl PermissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionStatus::Pending => "pending",
            PermissionStatus::Approved => "approved",
            PermissionStatus::Denied => "denied",
            PermissionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub id: String,
    pub project_id: String,
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    pub input_preview: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: PermissionStatus,
}

impl PendingPermission {
    pub fn is_pending(&self) -> bool {
        self.status == PermissionStatus::Pending
    }
}

/// Serialized tool input bounded to `max` characters.
pub fn input_preview(input: &Value, max: usize) -> String {
    let raw = match input {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&raw, max)
}
