use goodable_core::permission::PendingPermission;
use goodable_core::request::RequestRecord;
use goodable_protocol::{
    ChatMessage, ChatRole, MessageEvent, PermissionInfo, PermissionResolvedEvent, RequestInfo,
    StatusEvent, StreamEvent, EVT_MESSAGE, EVT_PERMISSION_REQUESTED, EVT_PERMISSION_RESOLVED,
    EVT_STATUS,
};

use super::now_ms;

pub(in crate::daemon) fn to_proto_permission(p: &PendingPermission) -> PermissionInfo {
    PermissionInfo {
        id: p.id.clone(),
        project_id: p.project_id.clone(),
        request_id: p.request_id.clone(),
        tool_name: p.tool_name.clone(),
        tool_input: p.tool_input.clone(),
        input_preview: p.input_preview.clone(),
        created_at_ms: p.created_at_ms,
        expires_at_ms: p.expires_at_ms,
        status: p.status.as_str().to_owned(),
    }
}

pub(in crate::daemon) fn to_proto_request(r: &RequestRecord) -> RequestInfo {
    RequestInfo {
        id: r.id.clone(),
        project_id: r.project_id.clone(),
        instruction: r.instruction.clone(),
        cli_preference: r.cli_preference.clone(),
        model: r.model.clone(),
        plan_mode: r.plan_mode,
        permission_mode: r.permission_mode.as_str().to_owned(),
        status: r.status.as_str().to_owned(),
        cancel_requested: r.cancel_requested,
        error_message: r.error_message.clone(),
        session_id: r.session_id.clone(),
        created_at_ms: r.created_at_ms,
        updated_at_ms: r.updated_at_ms,
        completed_at_ms: r.completed_at_ms,
    }
}

pub(in crate::daemon) fn status_event(
    request_id: &str,
    status: &str,
    plan_text: Option<&str>,
    message: Option<&str>,
) -> StreamEvent {
    StreamEvent::new(
        EVT_STATUS,
        &StatusEvent {
            status: status.to_owned(),
            request_id: request_id.to_owned(),
            plan_text: plan_text.map(str::to_owned),
            message: message.map(str::to_owned),
        },
    )
}

pub(in crate::daemon) fn message_event(
    request_id: &str,
    role: ChatRole,
    content: String,
    tool_name: Option<&str>,
    tool_use_id: Option<&str>,
    is_error: bool,
) -> StreamEvent {
    StreamEvent::new(
        EVT_MESSAGE,
        &MessageEvent {
            request_id: request_id.to_owned(),
            message: ChatMessage {
                role,
                content,
                tool_name: tool_name.map(str::to_owned),
                tool_use_id: tool_use_id.filter(|s| !s.is_empty()).map(str::to_owned),
                is_error,
                ts_ms: now_ms(),
            },
        },
    )
}

pub(in crate::daemon) fn permission_requested_event(p: &PendingPermission) -> StreamEvent {
    StreamEvent::new(EVT_PERMISSION_REQUESTED, &to_proto_permission(p))
}

pub(in crate::daemon) fn permission_resolved_event(
    permission_id: &str,
    request_id: &str,
    status: &str,
) -> StreamEvent {
    StreamEvent::new(
        EVT_PERMISSION_RESOLVED,
        &PermissionResolvedEvent {
            permission_id: permission_id.to_owned(),
            request_id: request_id.to_owned(),
            status: status.to_owned(),
        },
    )
}
