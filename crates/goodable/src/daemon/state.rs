use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use goodable_core::config::ConfigFile;
use tokio::sync::{watch, Mutex};

use crate::agent::{BackendRegistry, SessionControl};

use super::permissions::PermissionStore;
use super::publisher::StreamPublisher;
use super::requests::RequestStore;
use super::DaemonHandle;

/// A request whose executor is running.
pub(in crate::daemon) struct ActiveTask {
    pub(in crate::daemon) cancel_tx: Arc<watch::Sender<bool>>,
    /// Set once the agent session is up.
    pub(in crate::daemon) control: Option<Arc<dyn SessionControl>>,
}

pub(in crate::daemon) struct SharedState {
    pub(in crate::daemon) config: ConfigFile,
    /// Base URL handed to agents for the hook bridge.
    pub(in crate::daemon) server_url: String,
    pub(in crate::daemon) projects_dir: PathBuf,
    pub(in crate::daemon) hook_timeout_secs: u64,
    pub(in crate::daemon) requests: RequestStore,
    pub(in crate::daemon) permissions: PermissionStore,
    pub(in crate::daemon) publisher: StreamPublisher,
    pub(in crate::daemon) backends: BackendRegistry,
    pub(in crate::daemon) active: Mutex<BTreeMap<String, ActiveTask>>,
    pub(in crate::daemon) shutdown: DaemonHandle,
}

impl SharedState {
    /// Registers a running task and returns its cancel sender.
    pub(in crate::daemon) async fn register_active(&self, request_id: &str) -> Arc<watch::Sender<bool>> {
        let (tx, _rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let mut active = self.active.lock().await;
        active.insert(
            request_id.to_owned(),
            ActiveTask {
                cancel_tx: tx.clone(),
                control: None,
            },
        );
        tx
    }

    pub(in crate::daemon) async fn attach_control(
        &self,
        request_id: &str,
        control: Arc<dyn SessionControl>,
    ) {
        let mut active = self.active.lock().await;
        if let Some(task) = active.get_mut(request_id) {
            task.control = Some(control);
        }
    }

    pub(in crate::daemon) async fn remove_active(&self, request_id: &str) {
        let mut active = self.active.lock().await;
        active.remove(request_id);
    }
}

#[cfg(test)]
pub(in crate::daemon) mod testing {
    use std::time::Duration;

    use super::*;

    pub(in crate::daemon) fn shared_with(
        backends: BackendRegistry,
        permission_timeout: Option<Duration>,
        projects_dir: PathBuf,
    ) -> Arc<SharedState> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(SharedState {
            config: ConfigFile::default(),
            server_url: "http://127.0.0.1:0".to_owned(),
            projects_dir,
            hook_timeout_secs: 60,
            requests: RequestStore::in_memory(),
            permissions: PermissionStore::new(permission_timeout, 500),
            publisher: StreamPublisher::default(),
            backends,
            active: Mutex::new(BTreeMap::new()),
            shutdown: DaemonHandle { shutdown_tx },
        })
    }
}
