use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::{rpc, DaemonHandle, SharedState};

pub(in crate::daemon) fn build_router(shared: Arc<SharedState>) -> Router {
    Router::new()
        .route("/health", get(rpc::handle_health))
        .route("/permissions/confirm", post(rpc::handle_permission_confirm))
        .route("/permissions/pending", get(rpc::handle_permission_pending))
        .route("/permissions/request", post(rpc::handle_permission_request))
        .route("/chat/:project_id/act", post(rpc::handle_act))
        .route("/chat/:project_id/approve-plan", post(rpc::handle_approve_plan))
        .route("/chat/:project_id/interrupt", post(rpc::handle_interrupt))
        .route("/chat/:project_id/stream", get(rpc::handle_stream))
        .route("/chat/:project_id/requests", get(rpc::handle_request_list))
        .route(
            "/chat/:project_id/requests/:request_id",
            get(rpc::handle_request_show),
        )
        .with_state(shared)
}

pub(in crate::daemon) async fn bind(bind_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = normalize_bind_addr(bind_addr);
    TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))
}

pub(in crate::daemon) async fn serve(
    listener: TcpListener,
    shared: Arc<SharedState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(shared);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("http server exited")
}

pub(in crate::daemon) async fn shutdown_signal_watcher(handle: DaemonHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async { if let Some(s) = sigterm.as_mut() { s.recv().await; } } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received");
    handle.request_shutdown();
}

pub(crate) fn normalize_bind_addr(bind_addr: &str) -> String {
    let trimmed = bind_addr.trim();
    if let Some(port) = trimmed.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    trimmed.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use goodable_core::permission::{PermissionMode, PLAN_EXIT_TOOL};
    use goodable_core::request::{RequestRecord, RequestStatus};
    use http_body_util::BodyExt as _;
    use serde_json::{json, Value};
    use tower::ServiceExt as _;

    use crate::agent::scripted::{ScriptedBackend, Step};
    use crate::agent::BackendRegistry;
    use crate::daemon::state::testing::shared_with;

    fn app_with(scripts: Vec<Vec<Step>>) -> (Arc<SharedState>, Arc<ScriptedBackend>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(scripts));
        let registry = BackendRegistry::default().with_backend("claude", backend.clone());
        let shared = shared_with(registry, Some(Duration::from_secs(3600)), dir.path().to_path_buf());
        (shared, backend, dir)
    }

    async fn call(shared: &Arc<SharedState>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = build_router(shared.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn wait_for_status(shared: &SharedState, id: &str, want: RequestStatus) {
        for _ in 0..200 {
            if shared.requests.get(id).await.map(|r| r.status) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {id} never reached {want}");
    }

    async fn wait_for_pending(shared: &Arc<SharedState>, n: usize) -> Vec<Value> {
        for _ in 0..200 {
            let (_, body) = call(shared, "GET", "/permissions/pending?projectId=demo", None).await;
            let list = body["permissions"].as_array().cloned().unwrap_or_default();
            if list.len() == n {
                return list;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {n} pending permissions");
    }

    async fn parked_plan(shared: &SharedState, id: &str) {
        let mut record = RequestRecord::new(
            id.to_owned(),
            "demo".to_owned(),
            "add a footer".to_owned(),
            "claude".to_owned(),
            1,
        );
        record.plan_mode = true;
        record.permission_mode = PermissionMode::Plan;
        shared.requests.create(record).await;
        for to in [
            RequestStatus::Processing,
            RequestStatus::Planning,
            RequestStatus::WaitingApproval,
        ] {
            shared.requests.advance(id, to).await.unwrap();
        }
        shared.requests.set_session_id(id, "sess-plan").await.unwrap();
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (shared, _, _dir) = app_with(Vec::new());
        let (status, body) = call(&shared, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn act_then_confirm_over_http() {
        let (shared, backend, _dir) = app_with(vec![vec![
            Step::Tool("Write", json!({"file_path": "index.html"})),
            Step::Finish { is_error: false },
        ]]);

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "add a footer"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let request_id = body["requestId"].as_str().unwrap().to_owned();

        let pending = wait_for_pending(&shared, 1).await;
        assert_eq!(pending[0]["toolName"], "Write");
        assert_eq!(pending[0]["status"], "pending");
        assert_eq!(pending[0]["requestId"], request_id.as_str());

        let perm_id = pending[0]["id"].as_str().unwrap().to_owned();
        let (status, body) = call(
            &shared,
            "POST",
            "/permissions/confirm",
            Some(json!({"permissionId": perm_id, "approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = call(
            &shared,
            "POST",
            "/permissions/confirm",
            Some(json!({"permissionId": perm_id, "approved": false})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        wait_for_status(&shared, &request_id, RequestStatus::Completed).await;
        let (status, body) = call(
            &shared,
            "GET",
            &format!("/chat/demo/requests/{request_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(backend.decisions.lock().unwrap().len(), 1);

        let (status, body) = call(&shared, "GET", "/chat/demo/requests", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requests"].as_array().unwrap().len(), 1);
        assert_eq!(body["requests"][0]["id"], request_id.as_str());
    }

    #[tokio::test]
    async fn confirm_unknown_permission_is_not_found() {
        let (shared, _, _dir) = app_with(Vec::new());
        let (status, body) = call(
            &shared,
            "POST",
            "/permissions/confirm",
            Some(json!({"permissionId": "perm-nope", "approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn act_rejects_bad_input() {
        let (shared, _, _dir) = app_with(Vec::new());
        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "go", "cliPreference": "codex"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown cli: codex");

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "go", "permissionMode": "yolo"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/%2E%2E/act",
            Some(json!({"instruction": "go"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approve_plan_resumes_session() {
        let (shared, backend, _dir) = app_with(vec![vec![Step::Finish { is_error: false }]]);
        parked_plan(&shared, "r1").await;
        let mut events = shared.publisher.subscribe("demo");

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "r1", "approve": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "implementing");

        wait_for_status(&shared, "r1", RequestStatus::Completed).await;
        let inputs = backend.inputs.lock().unwrap().clone();
        assert_eq!(inputs[0].instruction, "add a footer");
        assert_eq!(inputs[0].resume_session_id.as_deref(), Some("sess-plan"));
        assert!(!inputs[0].plan_mode);
        assert_eq!(inputs[0].permission_mode, PermissionMode::Default);

        let first = events.recv().await.unwrap();
        assert_eq!(first.data["status"], "plan_approved");
        let second = events.recv().await.unwrap();
        assert_eq!(second.data["status"], "implementing");

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "r1", "approve": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn modified_plan_carries_the_change() {
        let (shared, backend, _dir) = app_with(vec![vec![Step::Finish { is_error: false }]]);
        parked_plan(&shared, "r1").await;

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "r1", "approve": false, "modification": "use a dark footer"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        wait_for_status(&shared, "r1", RequestStatus::Completed).await;
        let inputs = backend.inputs.lock().unwrap().clone();
        assert_eq!(inputs[0].instruction, "add a footer\n\nuse a dark footer");
        assert_eq!(inputs[0].resume_session_id.as_deref(), Some("sess-plan"));
    }

    #[tokio::test]
    async fn approved_plan_ignores_modification() {
        let (shared, backend, _dir) = app_with(vec![vec![Step::Finish { is_error: false }]]);
        parked_plan(&shared, "r1").await;
        let mut events = shared.publisher.subscribe("demo");

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "r1", "approve": true, "modification": "use a dark footer"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        wait_for_status(&shared, "r1", RequestStatus::Completed).await;
        let inputs = backend.inputs.lock().unwrap().clone();
        assert_eq!(inputs[0].instruction, "add a footer");
        let first = events.recv().await.unwrap();
        assert_eq!(first.data["status"], "plan_approved");
    }

    #[tokio::test]
    async fn rejected_plan_fails_request() {
        let (shared, backend, _dir) = app_with(Vec::new());
        parked_plan(&shared, "r1").await;

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "r1", "approve": false, "modification": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");

        let record = shared.requests.get("r1").await.unwrap();
        assert_eq!(record.error_message.as_deref(), Some("plan rejected"));
        assert!(backend.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn approve_plan_unknown_or_wrong_project_is_not_found() {
        let (shared, _, _dir) = app_with(Vec::new());
        parked_plan(&shared, "r1").await;

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/other/approve-plan",
            Some(json!({"requestId": "r1", "approve": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/approve-plan",
            Some(json!({"requestId": "missing", "approve": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupt_running_request() {
        let (shared, _, _dir) = app_with(vec![vec![Step::Session("s"), Step::Hang]]);
        let (_, body) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "loop forever"})),
        )
        .await;
        let request_id = body["requestId"].as_str().unwrap().to_owned();
        wait_for_status(&shared, &request_id, RequestStatus::Processing).await;
        for _ in 0..200 {
            let attached = shared
                .active
                .lock()
                .await
                .get(&request_id)
                .is_some_and(|t| t.control.is_some());
            if attached {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/interrupt",
            Some(json!({"requestId": request_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["interrupted"], true);
        assert_eq!(body["scheduled"], false);

        wait_for_status(&shared, &request_id, RequestStatus::Failed).await;
        let record = shared.requests.get(&request_id).await.unwrap();
        assert_eq!(record.error_message.as_deref(), Some("interrupted by user"));

        let (status, _) = call(
            &shared,
            "POST",
            "/chat/demo/interrupt",
            Some(json!({"requestId": request_id})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn failed_direct_interrupt_is_scheduled() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new(vec![vec![Step::Session("s"), Step::Hang]])
                .with_failing_interrupt(),
        );
        let registry = BackendRegistry::default().with_backend("claude", backend);
        let shared = shared_with(registry, Some(Duration::from_secs(3600)), dir.path().to_path_buf());

        let (_, body) = call(
            &shared,
            "POST",
            "/chat/demo/act",
            Some(json!({"instruction": "loop forever"})),
        )
        .await;
        let request_id = body["requestId"].as_str().unwrap().to_owned();
        wait_for_status(&shared, &request_id, RequestStatus::Processing).await;
        for _ in 0..200 {
            let attached = shared
                .active
                .lock()
                .await
                .get(&request_id)
                .is_some_and(|t| t.control.is_some());
            if attached {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut events = shared.publisher.subscribe("demo");

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/interrupt",
            Some(json!({"requestId": request_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "interrupted": false, "scheduled": true})
        );

        let mut seen = None;
        while let Ok(event) = events.try_recv() {
            if event.r#type == "task_interrupted" {
                seen = Some(event);
                break;
            }
        }
        let seen = seen.expect("task_interrupted published before the call returned");
        assert_eq!(seen.data["requestId"], request_id.as_str());
        assert_eq!(seen.data["scheduled"], true);

        wait_for_status(&shared, &request_id, RequestStatus::Failed).await;
        let record = shared.requests.get(&request_id).await.unwrap();
        assert!(record.cancel_requested);
        assert_eq!(record.error_message.as_deref(), Some("interrupted by user"));
    }

    #[tokio::test]
    async fn interrupt_without_executor_falls_back_to_flag() {
        let (shared, _, _dir) = app_with(Vec::new());
        shared
            .requests
            .create(RequestRecord::new(
                "r1".to_owned(),
                "demo".to_owned(),
                "x".to_owned(),
                "claude".to_owned(),
                1,
            ))
            .await;

        let (status, body) = call(
            &shared,
            "POST",
            "/chat/demo/interrupt",
            Some(json!({"requestId": "r1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interrupted"], false);
        assert_eq!(body["scheduled"], true);
        assert!(shared.requests.is_cancel_requested("r1").await);
    }

    #[tokio::test]
    async fn hook_request_blocks_until_confirmed() {
        let (shared, _, _dir) = app_with(Vec::new());
        let mut record = RequestRecord::new(
            "r1".to_owned(),
            "demo".to_owned(),
            "x".to_owned(),
            "claude".to_owned(),
            1,
        );
        record.permission_mode = PermissionMode::Default;
        shared.requests.create(record).await;
        shared.requests.advance("r1", RequestStatus::Processing).await.unwrap();

        let (status, body) = call(
            &shared,
            "POST",
            "/permissions/request",
            Some(json!({"projectId": "demo", "requestId": "r1", "toolName": "Grep", "toolInput": {"pattern": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], true);
        assert!(body.get("permissionId").is_none());

        let hook = tokio::spawn({
            let shared = shared.clone();
            async move {
                call(
                    &shared,
                    "POST",
                    "/permissions/request",
                    Some(json!({"projectId": "demo", "requestId": "r1", "toolName": "Bash", "toolInput": {"command": "make"}})),
                )
                .await
            }
        });

        let pending = wait_for_pending(&shared, 1).await;
        let perm_id = pending[0]["id"].as_str().unwrap().to_owned();
        assert!(shared.permissions.resolve(&perm_id, false).await);

        let (status, body) = hook.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], false);
        assert_eq!(body["permissionId"], perm_id.as_str());
    }

    #[tokio::test]
    async fn hook_denies_plan_exit_while_planning() {
        let (shared, _, _dir) = app_with(Vec::new());
        parked_plan(&shared, "r1").await;

        let (status, body) = call(
            &shared,
            "POST",
            "/permissions/request",
            Some(json!({"projectId": "demo", "requestId": "r1", "toolName": PLAN_EXIT_TOOL, "toolInput": {"plan": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], false);
        assert_eq!(body["message"], "plan submitted for review");
    }

    #[test]
    fn normalize_bind_addr_expands_bare_port() {
        assert_eq!(normalize_bind_addr(":8787"), "0.0.0.0:8787");
        assert_eq!(normalize_bind_addr(" 127.0.0.1:9 "), "127.0.0.1:9");
    }
}
