use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use goodable_core::config::{CliConfig, PromptMode};
use goodable_core::stream::{InputMessage, StreamItem, StreamMessage};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::{mpsc, watch};

use super::{AgentBackend, AgentEvent, AgentSession, SessionControl, SessionInput};
use crate::ipc::jsonl::{write_jsonl, JsonlReader};

pub const HOOK_EXE_ENV: &str = "GOODABLE_HOOK_EXE";

pub const ENV_URL: &str = "GOODABLE_URL";
pub const ENV_PROJECT_ID: &str = "GOODABLE_PROJECT_ID";
pub const ENV_REQUEST_ID: &str = "GOODABLE_REQUEST_ID";
pub const ENV_PERMISSION_MODE: &str = "GOODABLE_PERMISSION_MODE";

/// Runs an agent CLI as a child process speaking `stream-json` on stdout.
pub struct CommandBackend {
    name: String,
    cli: CliConfig,
}

impl CommandBackend {
    pub fn new(name: String, cli: CliConfig) -> Self {
        Self { name, cli }
    }

    fn build_args(&self, input: &SessionInput, hook_exe_prefix: &str) -> anyhow::Result<Vec<String>> {
        let cli = &self.cli;
        let mut args = cli.args.clone();

        if let (Some(flag), Some(model)) = (
            cli.model_flag.as_deref(),
            input.model.as_deref().filter(|m| !m.trim().is_empty()),
        ) {
            args.extend([flag.to_owned(), model.trim().to_owned()]);
        }

        if let (Some(flag), Some(session_id)) =
            (cli.resume_flag.as_deref(), input.resume_session_id.as_deref())
        {
            args.extend([flag.to_owned(), session_id.to_owned()]);
        }

        if let Some(flag) = cli.permission_mode_flag.as_deref() {
            args.extend([flag.to_owned(), input.effective_mode().as_str().to_owned()]);
        }

        if let Some(flag) = cli.settings_flag.as_deref() {
            let settings = hook_settings(hook_exe_prefix, input.hook_timeout_secs);
            let settings_json =
                serde_json::to_string(&settings).context("serialize agent settings")?;
            args.extend([flag.to_owned(), settings_json]);
        }

        if cli.prompt_mode == PromptMode::Arg {
            args.push(input.instruction.clone());
        }

        Ok(args)
    }
}

fn hook_settings(hook_exe_prefix: &str, timeout_secs: u64) -> serde_json::Value {
    serde_json::json!({
        "hooks": {
            "PreToolUse": [
                {
                    "matcher": "*",
                    "hooks": [
                        {
                            "type": "command",
                            "command": render_shell_command(&[hook_exe_prefix, "hook", "pre-tool-use"]),
                            "timeout": timeout_secs,
                        }
                    ]
                }
            ]
        }
    })
}

#[async_trait]
impl AgentBackend for CommandBackend {
    async fn start(&self, input: SessionInput) -> anyhow::Result<AgentSession> {
        let program = which::which(&self.cli.command)
            .with_context(|| format!("{} CLI not found: {}", self.name, self.cli.command))?;
        let args = self.build_args(&input, &hook_exe_prefix())?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .env(ENV_URL, &input.server_url)
            .env(ENV_PROJECT_ID, &input.project_id)
            .env(ENV_REQUEST_ID, &input.request_id)
            .env(ENV_PERMISSION_MODE, input.effective_mode().as_str())
            .envs(&self.cli.env)
            .current_dir(&input.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match self.cli.prompt_mode {
            PromptMode::StreamJson => cmd.stdin(Stdio::piped()),
            PromptMode::Arg => cmd.stdin(Stdio::null()),
        };

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} agent", self.name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} agent stdout missing", self.name))?;

        if let Some(mut stdin) = child.stdin.take() {
            let msg = InputMessage::user(&input.instruction, input.resume_session_id.clone());
            write_jsonl(&mut stdin, &msg)
                .await
                .with_context(|| format!("write prompt to {} agent", self.name))?;
            // Dropping stdin closes it; the CLI exits after its result.
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stderr_logger(self.name.clone(), input.request_id.clone(), stderr));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (kill_tx, kill_rx) = watch::channel(false);

        tokio::spawn(stdout_reader(stdout, events_tx));
        tokio::spawn(reaper(self.name.clone(), input.request_id.clone(), child, kill_rx));

        tracing::info!(
            cli = %self.name,
            project = %input.project_id,
            request_id = %input.request_id,
            resumed = input.resume_session_id.is_some(),
            "agent started"
        );

        Ok(AgentSession {
            events: events_rx,
            control: Arc::new(ProcessControl { kill_tx }),
        })
    }
}

struct ProcessControl {
    kill_tx: watch::Sender<bool>,
}

#[async_trait]
impl SessionControl for ProcessControl {
    async fn interrupt(&self) -> anyhow::Result<()> {
        self.kill_tx
            .send(true)
            .map_err(|_| anyhow!("agent process already exited"))
    }
}

async fn stdout_reader(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<AgentEvent>) {
    let mut reader = JsonlReader::new(BufReader::new(stdout));
    loop {
        let msg = match reader.next::<StreamMessage>().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "agent stdout read failed");
                break;
            }
        };

        for item in msg.items() {
            if tx.send(agent_event(item)).await.is_err() {
                return;
            }
        }
    }
    if reader.skipped() > 0 {
        tracing::debug!(skipped = reader.skipped(), "agent stdout had non-json lines");
    }
}

fn agent_event(item: StreamItem) -> AgentEvent {
    match item {
        StreamItem::SessionStarted { session_id } => AgentEvent::SessionStarted { session_id },
        StreamItem::Text { text } => AgentEvent::AssistantText { text },
        StreamItem::ToolUse {
            tool_use_id,
            name,
            input,
        } => AgentEvent::ToolUse {
            tool_use_id,
            name,
            input,
            decision: None,
        },
        StreamItem::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => AgentEvent::ToolResult {
            tool_use_id,
            content,
            is_error,
        },
        StreamItem::Finished {
            is_error,
            result,
            session_id,
        } => AgentEvent::Finished {
            is_error,
            result,
            session_id,
        },
    }
}

async fn stderr_logger(cli: String, request_id: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(cli = %cli, request_id = %request_id, line = %line, "agent stderr");
        }
    }
}

async fn reaper(
    cli: String,
    request_id: String,
    mut child: tokio::process::Child,
    mut kill_rx: watch::Receiver<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill_rx.changed() => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let exit_code = status.and_then(|s| s.code());
    tracing::info!(cli = %cli, request_id = %request_id, exit_code = ?exit_code, "agent exited");
}

pub fn hook_exe_prefix_from(env_override: Option<&OsStr>, current_exe: Option<&Path>) -> String {
    if let Some(prefix) = env_override
        .and_then(|v| v.to_str())
        .map(sanitize_hook_exe_prefix)
        .filter(|s| !s.is_empty())
    {
        return prefix;
    }

    if let Some(prefix) = current_exe
        .and_then(|p| p.to_str())
        .map(sanitize_hook_exe_prefix)
        .filter(|s| !s.is_empty())
    {
        return prefix;
    }

    "goodable".to_owned()
}

pub fn hook_exe_prefix() -> String {
    let env_override = std::env::var_os(HOOK_EXE_ENV);
    let current_exe = std::env::current_exe().ok();
    hook_exe_prefix_from(env_override.as_deref(), current_exe.as_deref())
}

fn sanitize_hook_exe_prefix(input: &str) -> String {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_suffix(" (deleted)").unwrap_or(trimmed);
    trimmed.trim().to_owned()
}

fn shell_escape_posix(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len() + 2);
    escaped.push('\'');
    for ch in word.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

pub fn render_shell_command(words: &[&str]) -> String {
    words
        .iter()
        .copied()
        .map(shell_escape_posix)
        .collect::<Vec<_>>()
        .join(" ")
}
