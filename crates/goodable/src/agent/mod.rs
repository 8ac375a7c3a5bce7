//! Agent sessions as seen by the executor: a stream of events plus a way to
//! stop the session early.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use goodable_core::config::ConfigFile;
use goodable_core::permission::PermissionMode;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub mod command;

pub use command::CommandBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInput {
    pub project_id: String,
    pub request_id: String,
    pub project_dir: PathBuf,
    pub instruction: String,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub plan_mode: bool,
    pub permission_mode: PermissionMode,
    /// Base URL the hook bridge calls back into.
    pub server_url: String,
    pub hook_timeout_secs: u64,
}

impl SessionInput {
    /// Mode passed to the CLI. Plan requests always run in `plan`.
    pub fn effective_mode(&self) -> PermissionMode {
        self.permission_mode.while_planning(self.plan_mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    Allow,
    Deny { message: String },
}

#[derive(Debug)]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
    },
    AssistantText {
        text: String,
    },
    /// `decision` is set when the backend blocks the tool until the executor
    /// answers. Backends gated out of band (the PreToolUse hook) leave it empty.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
        decision: Option<oneshot::Sender<ToolDecision>>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Finished {
        is_error: bool,
        result: Option<String>,
        session_id: Option<String>,
    },
}

#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Stop the session. Errors when the session is already gone.
    async fn interrupt(&self) -> anyhow::Result<()>;
}

/// A running session. The event channel closes when the agent exits.
pub struct AgentSession {
    pub events: mpsc::Receiver<AgentEvent>,
    pub control: Arc<dyn SessionControl>,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn start(&self, input: SessionInput) -> anyhow::Result<AgentSession>;
}

/// Backends keyed by CLI name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn AgentBackend>>,
}

impl BackendRegistry {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let mut registry = Self::default();
        for name in cfg.cli_names() {
            if let Some(cli) = cfg.cli_config(&name) {
                let backend = CommandBackend::new(name.clone(), cli);
                registry.backends.insert(name, Arc::new(backend));
            }
        }
        registry
    }

    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn AgentBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }
}
