use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::PermissionMode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Planning,
    WaitingApproval,
    Implementing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Planning => "planning",
            RequestStatus::WaitingApproval => "waiting_approval",
            RequestStatus::Implementing => "implementing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Forward edges of the lifecycle graph. Terminal states have none; every
    /// other state may finish at any time.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Completed)
                | (_, Failed)
                | (Pending, Processing)
                | (Processing, Planning)
                | (Planning, WaitingApproval)
                | (WaitingApproval, Implementing)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid status transition: {from} -> {to}")]
    Invalid {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("status mismatch: expected {expected}, found {actual}")]
    Mismatch {
        expected: RequestStatus,
        actual: RequestStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub project_id: String,
    pub instruction: String,
    pub cli_preference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    pub status: RequestStatus,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestEvent<'a> {
    Advanced { to: RequestStatus },
    Completed,
    Failed { message: &'a str },
    CancelRequested,
    SessionAssigned { session_id: &'a str },
}

impl RequestRecord {
    pub fn new(
        id: String,
        project_id: String,
        instruction: String,
        cli_preference: String,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            project_id,
            instruction,
            cli_preference,
            model: None,
            plan_mode: false,
            permission_mode: PermissionMode::Default,
            status: RequestStatus::Pending,
            cancel_requested: false,
            error_message: None,
            session_id: None,
            created_at_ms,
            updated_at_ms: created_at_ms,
            completed_at_ms: None,
        }
    }

    pub fn apply_event(&self, event: RequestEvent<'_>, now_ms: u64) -> Result<Self, TransitionError> {
        let mut next = self.clone();
        next.updated_at_ms = now_ms;

        match event {
            RequestEvent::Advanced { to } => {
                if to.is_terminal() || !self.status.can_transition_to(to) {
                    return Err(TransitionError::Invalid {
                        from: self.status,
                        to,
                    });
                }
                next.status = to;
            }
            RequestEvent::Completed => {
                self.check_edge(RequestStatus::Completed)?;
                next.status = RequestStatus::Completed;
                next.completed_at_ms = Some(now_ms);
                next.error_message = None;
            }
            RequestEvent::Failed { message } => {
                self.check_edge(RequestStatus::Failed)?;
                next.status = RequestStatus::Failed;
                next.completed_at_ms = Some(now_ms);
                let trimmed = message.trim();
                next.error_message = Some(if trimmed.is_empty() {
                    "request failed".to_owned()
                } else {
                    trimmed.to_owned()
                });
            }
            RequestEvent::CancelRequested => {
                next.cancel_requested = true;
            }
            RequestEvent::SessionAssigned { session_id } => {
                let trimmed = session_id.trim();
                if !trimmed.is_empty() {
                    next.session_id = Some(trimmed.to_owned());
                }
            }
        }

        Ok(next)
    }

    fn check_edge(&self, to: RequestStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.status,
                to,
            })
        }
    }
}

/// Instruction used when a plan is sent back with a modification.
pub fn revise_instruction(original: &str, modification: &str) -> String {
    format!("{original}\n\n{modification}")
}
