use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use goodable_protocol::{ErrorResponse, HealthResponse};

mod chat;
mod permission;

pub(super) use chat::{
    handle_act, handle_approve_plan, handle_interrupt, handle_request_list, handle_request_show,
    handle_stream,
};
pub(super) use permission::{
    handle_permission_confirm, handle_permission_pending, handle_permission_request,
};

pub(super) fn error_response(status: StatusCode, msg: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        error: msg.to_owned(),
    };
    (status, Json(body)).into_response()
}

pub(super) async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}
