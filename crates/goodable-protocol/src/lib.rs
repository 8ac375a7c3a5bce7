use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "0.1";

pub const EVT_STATUS: &str = "status";
pub const EVT_MESSAGE: &str = "message";
pub const EVT_TASK_STARTED: &str = "task_started";
pub const EVT_TASK_COMPLETED: &str = "task_completed";
pub const EVT_TASK_INTERRUPTED: &str = "task_interrupted";
pub const EVT_PERMISSION_REQUESTED: &str = "permission_requested";
pub const EVT_PERMISSION_RESOLVED: &str = "permission_resolved";

/// `status` values that are not request states.
pub const STATUS_PLAN_APPROVED: &str = "plan_approved";
pub const STATUS_PLAN_MODIFIED: &str = "plan_modified";
pub const STATUS_PLAN_REJECTED: &str = "plan_rejected";

/// Envelope pushed to project subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new<T: Serialize>(r#type: &str, data: &T) -> Self {
        Self {
            r#type: r#type.to_owned(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub request_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartedEvent {
    pub request_id: String,
    pub cli: String,
    #[serde(default)]
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedEvent {
    pub request_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInterruptedEvent {
    pub request_id: String,
    pub interrupted: bool,
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionInfo {
    pub id: String,
    pub project_id: String,
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    pub input_preview: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResolvedEvent {
    pub permission_id: String,
    pub request_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPermissionRequest {
    pub permission_id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPermissionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermissionsQuery {
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermissionsResponse {
    pub permissions: Vec<PermissionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovePlanRequest {
    pub request_id: String,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovePlanResponse {
    pub success: bool,
    pub request_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptResponse {
    pub success: bool,
    /// The running session was signalled directly.
    pub interrupted: bool,
    /// The cancel flag was set for the executor to pick up.
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActRequest {
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActResponse {
    pub success: bool,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub id: String,
    pub project_id: String,
    pub instruction: String,
    pub cli_preference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub plan_mode: bool,
    pub permission_mode: String,
    pub status: String,
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestListResponse {
    pub requests: Vec<RequestInfo>,
}

/// Body a CLI hook posts to ask for a tool-use decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPermissionRequest {
    pub project_id: String,
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPermissionResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_event_wraps_payload() {
        let ev = StreamEvent::new(
            EVT_STATUS,
            &StatusEvent {
                status: "waiting_approval".to_owned(),
                request_id: "r1".to_owned(),
                plan_text: Some("1. do it".to_owned()),
                message: None,
            },
        );

        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "type": "status",
                "data": {"status": "waiting_approval", "requestId": "r1", "planText": "1. do it"}
            })
        );
    }

    #[test]
    fn approve_plan_accepts_missing_modification() {
        let raw = r#"{"requestId":"r1","approve":true}"#;
        let req: ApprovePlanRequest = serde_json::from_str(raw).unwrap();
        assert!(req.approve);
        assert_eq!(req.modification, None);
    }

    #[test]
    fn act_request_defaults() {
        let req: ActRequest = serde_json::from_str(r#"{"instruction":"hi"}"#).unwrap();
        assert!(!req.plan_mode);
        assert_eq!(req.cli_preference, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"permissionId":"p1","approved":false,"extra":1}"#;
        let req: ConfirmPermissionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.permission_id, "p1");
        assert!(!req.approved);
    }
}
