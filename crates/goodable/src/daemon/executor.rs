//! Drives one request through an agent session.
//!
//! The executor owns the request's status from `pending` up to a terminal
//! state, except for the plan approval gap: it parks the request in
//! `waiting_approval` and exits, and approval spawns a fresh executor that
//! resumes the agent session.

use std::sync::Arc;

use anyhow::Context as _;
use goodable_core::permission::{auto_approve, PermissionMode, PermissionStatus, PLAN_EXIT_TOOL};
use goodable_core::request::{RequestRecord, RequestStatus};
use goodable_core::stream::{format_tool_input, plan_text};
use goodable_protocol::{
    ChatRole, StreamEvent, TaskCompletedEvent, TaskStartedEvent, EVT_TASK_COMPLETED,
    EVT_TASK_STARTED,
};
use serde_json::Value;
use tokio::sync::watch;

use crate::agent::{AgentEvent, SessionControl, SessionInput, ToolDecision};

use super::proto::{
    message_event, permission_requested_event, permission_resolved_event, status_event,
};
use super::SharedState;

pub(in crate::daemon) const INTERRUPTED_MESSAGE: &str = "interrupted by user";
pub(in crate::daemon) const SESSION_ENDED_MESSAGE: &str = "agent session ended unexpectedly";
pub(in crate::daemon) const PLAN_REVIEW_MESSAGE: &str = "plan submitted for review";

#[derive(Debug, Clone)]
pub(in crate::daemon) struct TaskSpec {
    pub(in crate::daemon) project_id: String,
    pub(in crate::daemon) request_id: String,
    pub(in crate::daemon) cli: String,
    pub(in crate::daemon) instruction: String,
    pub(in crate::daemon) model: Option<String>,
    pub(in crate::daemon) resume_session_id: Option<String>,
    pub(in crate::daemon) plan_mode: bool,
    pub(in crate::daemon) permission_mode: PermissionMode,
}

impl TaskSpec {
    fn gating_mode(&self) -> PermissionMode {
        self.permission_mode.while_planning(self.plan_mode)
    }
}

/// Registers the task as active and runs it in the background.
pub(in crate::daemon) async fn spawn_task(
    shared: Arc<SharedState>,
    spec: TaskSpec,
) -> tokio::task::JoinHandle<()> {
    let cancel_tx = shared.register_active(&spec.request_id).await;
    tokio::spawn(async move {
        let request_id = spec.request_id.clone();
        run_task(&shared, spec, cancel_tx).await;
        shared.remove_active(&request_id).await;
    })
}

enum Exit {
    Done,
    Cancelled,
}

async fn run_task(shared: &SharedState, spec: TaskSpec, cancel_tx: Arc<watch::Sender<bool>>) {
    let mut cancel_rx = cancel_tx.subscribe();

    let Some(record) = shared.requests.get(&spec.request_id).await else {
        tracing::warn!(request_id = %spec.request_id, "executor started for unknown request");
        return;
    };

    let resumed = match record.status {
        RequestStatus::Pending => false,
        RequestStatus::Implementing => true,
        other => {
            tracing::warn!(request_id = %spec.request_id, status = %other, "request not runnable");
            return;
        }
    };

    if is_cancelled(shared, &spec, &cancel_rx).await {
        finish_cancelled(shared, &spec, None).await;
        return;
    }

    if !resumed {
        if !advance(shared, &spec, RequestStatus::Processing).await {
            return;
        }
        if spec.plan_mode && !advance(shared, &spec, RequestStatus::Planning).await {
            return;
        }
    }

    let Some(backend) = shared.backends.get(&spec.cli) else {
        fail(shared, &spec, &format!("unknown cli: {}", spec.cli)).await;
        return;
    };

    publish(
        shared,
        &spec,
        StreamEvent::new(
            EVT_TASK_STARTED,
            &TaskStartedEvent {
                request_id: spec.request_id.clone(),
                cli: spec.cli.clone(),
                resumed,
            },
        ),
    );

    let project_dir = shared.projects_dir.join(&spec.project_id);
    if let Err(err) = tokio::fs::create_dir_all(&project_dir)
        .await
        .with_context(|| format!("create project dir: {}", project_dir.display()))
    {
        fail(shared, &spec, &format!("{err:#}")).await;
        return;
    }

    let input = SessionInput {
        project_id: spec.project_id.clone(),
        request_id: spec.request_id.clone(),
        project_dir,
        instruction: spec.instruction.clone(),
        model: spec.model.clone(),
        resume_session_id: spec.resume_session_id.clone(),
        plan_mode: spec.plan_mode,
        permission_mode: spec.permission_mode,
        server_url: shared.server_url.clone(),
        hook_timeout_secs: shared.hook_timeout_secs,
    };

    let mut session = match backend.start(input).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(request_id = %spec.request_id, error = %format!("{err:#}"), "agent start failed");
            fail(shared, &spec, &format!("{err:#}")).await;
            return;
        }
    };
    shared
        .attach_control(&spec.request_id, session.control.clone())
        .await;
    let control = session.control.clone();

    loop {
        if is_cancelled(shared, &spec, &cancel_rx).await {
            finish_cancelled(shared, &spec, Some(&control)).await;
            return;
        }

        let event = tokio::select! {
            event = session.events.recv() => event,
            _ = cancelled(&mut cancel_rx) => continue,
        };
        let Some(event) = event else {
            // An interrupted agent closes its stream; report the interrupt, not the close.
            if is_cancelled(shared, &spec, &cancel_rx).await {
                finish_cancelled(shared, &spec, None).await;
            } else {
                fail(shared, &spec, SESSION_ENDED_MESSAGE).await;
            }
            return;
        };

        match handle_event(shared, &spec, &control, &mut cancel_rx, event).await {
            None => {}
            Some(Exit::Done) => return,
            Some(Exit::Cancelled) => {
                finish_cancelled(shared, &spec, Some(&control)).await;
                return;
            }
        }
    }
}

async fn handle_event(
    shared: &SharedState,
    spec: &TaskSpec,
    control: &Arc<dyn SessionControl>,
    cancel_rx: &mut watch::Receiver<bool>,
    event: AgentEvent,
) -> Option<Exit> {
    match event {
        AgentEvent::SessionStarted { session_id } => {
            if let Err(err) = shared
                .requests
                .set_session_id(&spec.request_id, &session_id)
                .await
            {
                tracing::debug!(request_id = %spec.request_id, error = %err, "failed to record session id");
            }
            None
        }
        AgentEvent::AssistantText { text } => {
            publish(
                shared,
                spec,
                message_event(&spec.request_id, ChatRole::Assistant, text, None, None, false),
            );
            None
        }
        AgentEvent::ToolUse {
            tool_use_id,
            name,
            input,
            decision,
        } => {
            publish(
                shared,
                spec,
                message_event(
                    &spec.request_id,
                    ChatRole::Tool,
                    format_tool_input(&name, &input),
                    Some(&name),
                    Some(&tool_use_id),
                    false,
                ),
            );

            if spec.plan_mode && name == PLAN_EXIT_TOOL {
                if let Some(plan) = plan_text(&input) {
                    if let Some(tx) = decision {
                        let _ = tx.send(ToolDecision::Deny {
                            message: PLAN_REVIEW_MESSAGE.to_owned(),
                        });
                    }
                    submit_plan(shared, spec, control, plan).await;
                    return Some(Exit::Done);
                }
            }

            let Some(tx) = decision else {
                return None;
            };
            let (verdict, _) = gate_tool_use(
                shared,
                &spec.project_id,
                &spec.request_id,
                &name,
                input,
                spec.gating_mode(),
                Some(&mut *cancel_rx),
            )
            .await;
            let _ = tx.send(verdict);
            if is_cancelled(shared, spec, cancel_rx).await {
                return Some(Exit::Cancelled);
            }
            None
        }
        AgentEvent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            publish(
                shared,
                spec,
                message_event(
                    &spec.request_id,
                    ChatRole::Tool,
                    content,
                    None,
                    Some(&tool_use_id),
                    is_error,
                ),
            );
            None
        }
        AgentEvent::Finished {
            is_error,
            result,
            session_id,
        } => {
            if let Some(session_id) = session_id.as_deref() {
                let _ = shared
                    .requests
                    .set_session_id(&spec.request_id, session_id)
                    .await;
            }
            if is_error {
                let message = result.as_deref().unwrap_or("agent reported an error");
                fail(shared, spec, message).await;
            } else {
                complete(shared, spec).await;
            }
            Some(Exit::Done)
        }
    }
}

async fn submit_plan(
    shared: &SharedState,
    spec: &TaskSpec,
    control: &Arc<dyn SessionControl>,
    plan: &str,
) {
    if let Err(err) = control.interrupt().await {
        tracing::debug!(request_id = %spec.request_id, error = %err, "interrupt after plan failed");
    }

    match shared
        .requests
        .compare_and_set(
            &spec.request_id,
            RequestStatus::Planning,
            RequestStatus::WaitingApproval,
        )
        .await
    {
        Ok(_) => {
            tracing::info!(request_id = %spec.request_id, "plan ready for review");
            publish(
                shared,
                spec,
                status_event(
                    &spec.request_id,
                    RequestStatus::WaitingApproval.as_str(),
                    Some(plan),
                    None,
                ),
            );
        }
        Err(err) => {
            tracing::warn!(request_id = %spec.request_id, error = %err, "failed to park request for approval");
        }
    }
}

/// Decides one tool use: allowlist first, then a human via the permission store.
/// Returns the permission id when one was created.
pub(in crate::daemon) async fn gate_tool_use(
    shared: &SharedState,
    project_id: &str,
    request_id: &str,
    tool_name: &str,
    input: Value,
    mode: PermissionMode,
    cancel_rx: Option<&mut watch::Receiver<bool>>,
) -> (ToolDecision, Option<String>) {
    if auto_approve(tool_name, mode) {
        return (ToolDecision::Allow, None);
    }

    let (perm, wait) = match shared
        .permissions
        .create_and_wait(project_id, request_id, tool_name, input)
        .await
    {
        Ok(v) => v,
        Err(err) => {
            let deny = ToolDecision::Deny {
                message: err.to_string(),
            };
            return (deny, None);
        }
    };
    shared
        .publisher
        .publish(project_id, permission_requested_event(&perm));

    let approved = match cancel_rx {
        Some(cancel_rx) => tokio::select! {
            approved = wait.wait() => approved,
            _ = cancelled(cancel_rx) => {
                shared.permissions.cancel_for_request(project_id, request_id).await;
                false
            }
        },
        None => wait.wait().await,
    };

    let status = shared
        .permissions
        .get(&perm.id)
        .await
        .map(|p| p.status)
        .unwrap_or(PermissionStatus::Expired);
    shared.publisher.publish(
        project_id,
        permission_resolved_event(&perm.id, request_id, status.as_str()),
    );

    let decision = if approved {
        ToolDecision::Allow
    } else {
        ToolDecision::Deny {
            message: format!("permission {status} for {tool_name}"),
        }
    };
    (decision, Some(perm.id))
}

async fn is_cancelled(
    shared: &SharedState,
    spec: &TaskSpec,
    cancel_rx: &watch::Receiver<bool>,
) -> bool {
    let flagged = *cancel_rx.borrow();
    flagged || shared.requests.is_cancel_requested(&spec.request_id).await
}

/// Resolves once the cancel token is set. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn finish_cancelled(
    shared: &SharedState,
    spec: &TaskSpec,
    control: Option<&Arc<dyn SessionControl>>,
) {
    if let Some(control) = control {
        if let Err(err) = control.interrupt().await {
            tracing::debug!(request_id = %spec.request_id, error = %err, "interrupt failed");
        }
    }
    shared
        .permissions
        .cancel_for_request(&spec.project_id, &spec.request_id)
        .await;
    tracing::info!(request_id = %spec.request_id, "request interrupted");
    fail(shared, spec, INTERRUPTED_MESSAGE).await;
}

async fn advance(shared: &SharedState, spec: &TaskSpec, to: RequestStatus) -> bool {
    match shared.requests.advance(&spec.request_id, to).await {
        Ok(_) => {
            publish(shared, spec, status_event(&spec.request_id, to.as_str(), None, None));
            true
        }
        Err(err) => {
            tracing::warn!(request_id = %spec.request_id, error = %err, "status change rejected");
            false
        }
    }
}

async fn complete(shared: &SharedState, spec: &TaskSpec) {
    match shared.requests.complete(&spec.request_id).await {
        Ok(_) => {
            tracing::info!(request_id = %spec.request_id, "request completed");
            publish_terminal(shared, spec, RequestStatus::Completed, None);
        }
        Err(err) => {
            tracing::debug!(request_id = %spec.request_id, error = %err, "complete skipped");
        }
    }
}

pub(in crate::daemon) async fn fail(shared: &SharedState, spec: &TaskSpec, message: &str) {
    fail_request(shared, &spec.request_id, message).await;
}

/// Fails a request and tells subscribers. A request that already finished is left alone.
pub(in crate::daemon) async fn fail_request(shared: &SharedState, request_id: &str, message: &str) {
    match shared.requests.fail(request_id, message).await {
        Ok(record) => publish_failed(shared, &record),
        Err(err) => {
            tracing::debug!(request_id = %request_id, error = %err, "fail skipped");
        }
    }
}

pub(in crate::daemon) fn publish_failed(shared: &SharedState, record: &RequestRecord) {
    let error = record.error_message.as_deref();
    tracing::info!(request_id = %record.id, error = ?error, "request failed");
    shared.publisher.publish(
        &record.project_id,
        status_event(&record.id, RequestStatus::Failed.as_str(), None, error),
    );
    shared.publisher.publish(
        &record.project_id,
        task_completed_event(&record.id, RequestStatus::Failed, error),
    );
}

fn publish_terminal(
    shared: &SharedState,
    spec: &TaskSpec,
    status: RequestStatus,
    error: Option<&str>,
) {
    publish(shared, spec, status_event(&spec.request_id, status.as_str(), None, error));
    publish(shared, spec, task_completed_event(&spec.request_id, status, error));
}

fn task_completed_event(request_id: &str, status: RequestStatus, error: Option<&str>) -> StreamEvent {
    StreamEvent::new(
        EVT_TASK_COMPLETED,
        &TaskCompletedEvent {
            request_id: request_id.to_owned(),
            status: status.as_str().to_owned(),
            error: error.map(str::to_owned),
        },
    )
}

fn publish(shared: &SharedState, spec: &TaskSpec, event: StreamEvent) {
    shared.publisher.publish(&spec.project_id, event);
}
