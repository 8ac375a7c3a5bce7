use std::env;
use std::io::Read as _;

use anyhow::{anyhow, Context as _};
use goodable_protocol::{HookPermissionRequest, HookPermissionResponse};
use serde::{Deserialize, Serialize};

use crate::agent::command::{ENV_PROJECT_ID, ENV_REQUEST_ID, ENV_URL};
use crate::client::Client;

#[derive(Debug, Deserialize)]
struct HookInput {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub tool_use_id: String,
}

#[derive(Debug, Serialize)]
struct PreToolUseOutput {
    #[serde(rename = "hookSpecificOutput")]
    pub hook_specific_output: PreToolUseSpecificOutput,
}

#[derive(Debug, Serialize)]
struct PreToolUseSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,
    #[serde(rename = "permissionDecision")]
    pub permission_decision: String,
    #[serde(
        rename = "permissionDecisionReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision_reason: Option<String>,
}

/// Where the hook reports to, taken from the environment the server gave the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HookTarget {
    server_url: String,
    project_id: String,
    request_id: String,
}

/// `PreToolUse` hook: forwards the tool use to the server and blocks until it
/// is decided. Any failure along the way denies the tool use.
pub async fn handle_pre_tool_use(server_url_override: Option<&str>) -> anyhow::Result<()> {
    let hook_input = read_hook_input()?;
    let decision = match decide(server_url_override, hook_input).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "hook permission request failed");
            HookPermissionResponse {
                approved: false,
                permission_id: None,
                message: Some(format!("permission request failed: {err:#}")),
            }
        }
    };
    output_pre_tool_use(&decision)
}

async fn decide(
    server_url_override: Option<&str>,
    hook_input: HookInput,
) -> anyhow::Result<HookPermissionResponse> {
    let target = target_from_env(server_url_override)?;
    let client = Client::new(&target.server_url)?;
    let req = permission_request(&target, hook_input)?;
    tracing::debug!(
        project = %req.project_id,
        request_id = %req.request_id,
        tool = %req.tool_name,
        "hook asking for permission"
    );
    client.hook_permission_request(&req).await
}

fn target_from_env(server_url_override: Option<&str>) -> anyhow::Result<HookTarget> {
    let server_url = server_url_override
        .map(str::to_owned)
        .or_else(|| env_value(ENV_URL))
        .ok_or_else(|| anyhow!("{ENV_URL} is not set (not running under goodable)"))?;
    let project_id = env_value(ENV_PROJECT_ID)
        .ok_or_else(|| anyhow!("{ENV_PROJECT_ID} is not set (not running under goodable)"))?;
    let request_id = env_value(ENV_REQUEST_ID)
        .ok_or_else(|| anyhow!("{ENV_REQUEST_ID} is not set (not running under goodable)"))?;
    Ok(HookTarget {
        server_url,
        project_id,
        request_id,
    })
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn permission_request(
    target: &HookTarget,
    hook_input: HookInput,
) -> anyhow::Result<HookPermissionRequest> {
    let tool_name = hook_input.tool_name.trim().to_owned();
    if tool_name.is_empty() {
        return Err(anyhow!("hook input has no tool_name"));
    }

    let tool_use_id = hook_input.tool_use_id.trim().to_owned();
    Ok(HookPermissionRequest {
        project_id: target.project_id.clone(),
        request_id: target.request_id.clone(),
        tool_name,
        tool_input: hook_input.tool_input,
        tool_use_id: (!tool_use_id.is_empty()).then_some(tool_use_id),
    })
}

fn read_hook_input() -> anyhow::Result<HookInput> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read stdin")?;
    parse_hook_input(&buf)
}

fn parse_hook_input(raw: &str) -> anyhow::Result<HookInput> {
    serde_json::from_str(raw).context("parse hook input JSON")
}

fn render_output(resp: &HookPermissionResponse) -> anyhow::Result<String> {
    let output = PreToolUseOutput {
        hook_specific_output: PreToolUseSpecificOutput {
            hook_event_name: "PreToolUse".to_owned(),
            permission_decision: if resp.approved { "allow" } else { "deny" }.to_owned(),
            permission_decision_reason: resp
                .message
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        },
    };
    serde_json::to_string(&output).context("serialize hook output")
}

fn output_pre_tool_use(resp: &HookPermissionResponse) -> anyhow::Result<()> {
    let json = render_output(resp)?;
    println!("{json}");
    Ok(())
}
