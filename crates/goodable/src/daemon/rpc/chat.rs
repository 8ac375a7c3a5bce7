use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use goodable_core::paths::safe_join;
use goodable_core::permission::PermissionMode;
use goodable_core::request::{revise_instruction, RequestRecord, RequestStatus};
use goodable_protocol::{
    ActRequest, ActResponse, ApprovePlanRequest, ApprovePlanResponse, InterruptRequest,
    InterruptResponse, RequestListResponse, StreamEvent, TaskInterruptedEvent,
    EVT_TASK_INTERRUPTED, STATUS_PLAN_APPROVED, STATUS_PLAN_MODIFIED, STATUS_PLAN_REJECTED,
};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt as _};

use super::super::executor::{
    fail_request, publish_failed, spawn_task, TaskSpec, INTERRUPTED_MESSAGE,
};
use super::super::proto::{status_event, to_proto_request};
use super::super::{generate_id, now_ms, SharedState};
use super::error_response;

pub(in crate::daemon) const PLAN_REJECTED_MESSAGE: &str = "plan rejected";

pub(in crate::daemon) async fn handle_act(
    State(shared): State<Arc<SharedState>>,
    Path(project_id): Path<String>,
    Json(req): Json<ActRequest>,
) -> Response {
    if let Err(err) = safe_join(&shared.projects_dir, &project_id) {
        return error_response(StatusCode::BAD_REQUEST, &format!("invalid project id: {err}"));
    }
    let instruction = req.instruction.trim();
    if instruction.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "instruction is required");
    }

    let cli = req
        .cli_preference
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| shared.config.effective_default_cli())
        .to_owned();
    if !shared.backends.contains(&cli) {
        return error_response(StatusCode::BAD_REQUEST, &format!("unknown cli: {cli}"));
    }

    let permission_mode = match req.permission_mode.as_deref().map(str::trim) {
        None | Some("") => shared.config.effective_permissions().default_mode,
        Some(raw) => match PermissionMode::parse(raw) {
            Some(mode) => mode,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid permission mode: {raw}"),
                )
            }
        },
    };
    let plan_mode = req.plan_mode || permission_mode == PermissionMode::Plan;
    let model = req
        .model
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    let mut record = RequestRecord::new(
        generate_id("req"),
        project_id.clone(),
        instruction.to_owned(),
        cli.clone(),
        now_ms(),
    );
    record.model = model.clone();
    record.plan_mode = plan_mode;
    record.permission_mode = permission_mode;
    let record = shared.requests.create(record).await;

    tracing::info!(
        project = %project_id,
        request_id = %record.id,
        cli = %cli,
        plan_mode,
        "request accepted"
    );

    let spec = TaskSpec {
        project_id,
        request_id: record.id.clone(),
        cli,
        instruction: record.instruction.clone(),
        model,
        resume_session_id: None,
        plan_mode,
        permission_mode,
    };
    spawn_task(shared.clone(), spec).await;

    Json(ActResponse {
        success: true,
        request_id: record.id,
    })
    .into_response()
}

pub(in crate::daemon) async fn handle_approve_plan(
    State(shared): State<Arc<SharedState>>,
    Path(project_id): Path<String>,
    Json(req): Json<ApprovePlanRequest>,
) -> Response {
    let record = shared
        .requests
        .get(&req.request_id)
        .await
        .filter(|r| r.project_id == project_id);
    let Some(record) = record else {
        return error_response(StatusCode::NOT_FOUND, "request not found");
    };
    if record.status != RequestStatus::WaitingApproval {
        return error_response(
            StatusCode::CONFLICT,
            &format!("request is {}, not waiting_approval", record.status),
        );
    }

    let modification = req
        .modification
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if !req.approve && modification.is_none() {
        let failed = match shared
            .requests
            .fail_from(&record.id, RequestStatus::WaitingApproval, PLAN_REJECTED_MESSAGE)
            .await
        {
            Ok(r) => r,
            Err(err) => return error_response(StatusCode::CONFLICT, &err.to_string()),
        };
        shared.publisher.publish(
            &project_id,
            status_event(&record.id, STATUS_PLAN_REJECTED, None, None),
        );
        publish_failed(&shared, &failed);
        return Json(ApprovePlanResponse {
            success: true,
            request_id: failed.id,
            status: failed.status.as_str().to_owned(),
        })
        .into_response();
    }

    let updated = match shared
        .requests
        .compare_and_set(
            &record.id,
            RequestStatus::WaitingApproval,
            RequestStatus::Implementing,
        )
        .await
    {
        Ok(r) => r,
        Err(err) => return error_response(StatusCode::CONFLICT, &err.to_string()),
    };

    let (label, instruction) = match modification {
        Some(change) if !req.approve => (
            STATUS_PLAN_MODIFIED,
            revise_instruction(&updated.instruction, change),
        ),
        _ => (STATUS_PLAN_APPROVED, updated.instruction.clone()),
    };
    tracing::info!(project = %project_id, request_id = %record.id, decision = label, "plan reviewed");
    shared
        .publisher
        .publish(&project_id, status_event(&record.id, label, None, None));
    shared.publisher.publish(
        &project_id,
        status_event(&record.id, RequestStatus::Implementing.as_str(), None, None),
    );

    let spec = TaskSpec {
        project_id,
        request_id: updated.id.clone(),
        cli: updated.cli_preference.clone(),
        instruction,
        model: updated.model.clone(),
        resume_session_id: updated.session_id.clone(),
        plan_mode: false,
        permission_mode: updated.permission_mode.after_plan(),
    };
    spawn_task(shared.clone(), spec).await;

    Json(ApprovePlanResponse {
        success: true,
        request_id: updated.id,
        status: updated.status.as_str().to_owned(),
    })
    .into_response()
}

pub(in crate::daemon) async fn handle_interrupt(
    State(shared): State<Arc<SharedState>>,
    Path(project_id): Path<String>,
    Json(req): Json<InterruptRequest>,
) -> Response {
    let record = shared
        .requests
        .get(&req.request_id)
        .await
        .filter(|r| r.project_id == project_id);
    let Some(record) = record else {
        return error_response(StatusCode::NOT_FOUND, "request not found");
    };
    if record.status.is_terminal() {
        return error_response(
            StatusCode::CONFLICT,
            &format!("request already {}", record.status),
        );
    }

    let control = {
        let active = shared.active.lock().await;
        active.get(&record.id).map(|task| {
            task.cancel_tx.send_replace(true);
            task.control.clone()
        })
    };

    let mut interrupted = false;
    match control {
        Some(Some(control)) => match control.interrupt().await {
            Ok(()) => interrupted = true,
            Err(err) => {
                tracing::debug!(request_id = %record.id, error = %err, "direct interrupt failed");
            }
        },
        Some(None) => {}
        None if record.status == RequestStatus::WaitingApproval => {
            // Nothing is running; a parked plan can be failed right away.
            fail_request(&shared, &record.id, INTERRUPTED_MESSAGE).await;
            interrupted = true;
        }
        None => {}
    }

    let scheduled = !interrupted;
    if scheduled {
        if let Err(err) = shared.requests.request_cancel(&record.id).await {
            tracing::warn!(request_id = %record.id, error = %err, "failed to flag cancel");
        }
    }

    tracing::info!(request_id = %record.id, interrupted, scheduled, "interrupt requested");
    shared.publisher.publish(
        &project_id,
        StreamEvent::new(
            EVT_TASK_INTERRUPTED,
            &TaskInterruptedEvent {
                request_id: record.id.clone(),
                interrupted,
                scheduled,
            },
        ),
    );

    Json(InterruptResponse {
        success: true,
        interrupted,
        scheduled,
    })
    .into_response()
}

pub(in crate::daemon) async fn handle_stream(
    State(shared): State<Arc<SharedState>>,
    Path(project_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = shared.publisher.subscribe(&project_id);
    tracing::debug!(
        project = %project_id,
        subscribers = shared.publisher.subscriber_count(&project_id),
        "stream subscriber attached"
    );

    let events = BroadcastStream::new(rx).filter_map(|item| item.ok()).map(Some);
    let shutdown = WatchStream::new(shared.shutdown.subscribe())
        .filter(|stopping| *stopping)
        .map(|_| None);

    let stream = events
        .merge(shutdown)
        .take_while(Option::is_some)
        .filter_map(|event: Option<StreamEvent>| event)
        .map(|event| Ok(to_sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(&event.r#type).json_data(event) {
        Ok(e) => e,
        Err(err) => Event::default()
            .event("error")
            .data(format!("serialize event: {err}")),
    }
}

pub(in crate::daemon) async fn handle_request_list(
    State(shared): State<Arc<SharedState>>,
    Path(project_id): Path<String>,
) -> Json<RequestListResponse> {
    let requests = shared
        .requests
        .list(&project_id)
        .await
        .iter()
        .map(to_proto_request)
        .collect();
    Json(RequestListResponse { requests })
}

pub(in crate::daemon) async fn handle_request_show(
    State(shared): State<Arc<SharedState>>,
    Path((project_id, request_id)): Path<(String, String)>,
) -> Response {
    match shared
        .requests
        .get(&request_id)
        .await
        .filter(|r| r.project_id == project_id)
    {
        Some(record) => Json(to_proto_request(&record)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "request not found"),
    }
}
