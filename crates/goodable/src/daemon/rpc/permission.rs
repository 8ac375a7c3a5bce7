use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use goodable_core::permission::{PermissionMode, PLAN_EXIT_TOOL};
use goodable_core::request::RequestStatus;
use goodable_protocol::{
    ConfirmPermissionRequest, ConfirmPermissionResponse, HookPermissionRequest,
    HookPermissionResponse, PendingPermissionsQuery, PendingPermissionsResponse,
};

use crate::agent::ToolDecision;

use super::super::executor::{gate_tool_use, PLAN_REVIEW_MESSAGE};
use super::super::proto::to_proto_permission;
use super::super::SharedState;
use super::error_response;

pub(in crate::daemon) async fn handle_permission_confirm(
    State(shared): State<Arc<SharedState>>,
    Json(req): Json<ConfirmPermissionRequest>,
) -> Response {
    let id = req.permission_id.trim();
    if id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "permissionId is required");
    }

    let Some(existing) = shared.permissions.get(id).await else {
        return error_response(StatusCode::NOT_FOUND, "permission not found");
    };
    if !shared.permissions.resolve(id, req.approved).await {
        let current = shared
            .permissions
            .get(id)
            .await
            .map(|p| p.status)
            .unwrap_or(existing.status);
        return error_response(
            StatusCode::CONFLICT,
            &format!("permission already {current}"),
        );
    }

    Json(ConfirmPermissionResponse { success: true }).into_response()
}

pub(in crate::daemon) async fn handle_permission_pending(
    State(shared): State<Arc<SharedState>>,
    Query(query): Query<PendingPermissionsQuery>,
) -> Json<PendingPermissionsResponse> {
    let permissions = shared
        .permissions
        .list_pending(query.project_id.trim())
        .await
        .iter()
        .map(to_proto_permission)
        .collect();
    Json(PendingPermissionsResponse { permissions })
}

/// Blocking decision for an external agent hook. Returns once the tool use
/// is approved, denied, or expired.
pub(in crate::daemon) async fn handle_permission_request(
    State(shared): State<Arc<SharedState>>,
    Json(req): Json<HookPermissionRequest>,
) -> Response {
    let tool_name = req.tool_name.trim();
    if tool_name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "toolName is required");
    }

    let record = shared
        .requests
        .get(&req.request_id)
        .await
        .filter(|r| r.project_id == req.project_id);
    let Some(record) = record else {
        return error_response(StatusCode::NOT_FOUND, "request not found");
    };

    let deny = |message: &str| {
        Json(HookPermissionResponse {
            approved: false,
            permission_id: None,
            message: Some(message.to_owned()),
        })
        .into_response()
    };

    if record.status.is_terminal() || record.cancel_requested {
        return deny("request is no longer running");
    }
    if tool_name == PLAN_EXIT_TOOL
        && matches!(
            record.status,
            RequestStatus::Planning | RequestStatus::WaitingApproval
        )
    {
        return deny(PLAN_REVIEW_MESSAGE);
    }

    let mode = if record.status == RequestStatus::Planning {
        PermissionMode::Plan
    } else {
        record.permission_mode
    };

    tracing::debug!(
        project = %record.project_id,
        request_id = %record.id,
        tool = %tool_name,
        tool_use_id = ?req.tool_use_id,
        "hook permission request"
    );

    let (decision, permission_id) = gate_tool_use(
        &shared,
        &record.project_id,
        &record.id,
        tool_name,
        req.tool_input,
        mode,
        None,
    )
    .await;

    let (approved, message) = match decision {
        ToolDecision::Allow => (true, None),
        ToolDecision::Deny { message } => (false, Some(message)),
    };
    Json(HookPermissionResponse {
        approved,
        permission_id,
        message,
    })
    .into_response()
}
