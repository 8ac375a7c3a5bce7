use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use goodable_core::paths::GoodablePaths;
use tokio::sync::{watch, Mutex};

use crate::agent::BackendRegistry;
use crate::config_store;

mod executor;
mod permissions;
mod proto;
mod publisher;
mod requests;
mod rpc;
mod server;
mod state;

use permissions::PermissionStore;
use publisher::StreamPublisher;
use requests::RequestStore;
use state::SharedState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

pub async fn run_foreground(
    paths: &GoodablePaths,
    bind_override: Option<String>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = DaemonHandle { shutdown_tx };

    let config = config_store::load(paths).await?;
    let server_cfg = config.effective_server();
    let permissions_cfg = config.effective_permissions();

    let projects_dir = server_cfg
        .projects_dir
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| paths.projects_dir.clone());
    tokio::fs::create_dir_all(&projects_dir)
        .await
        .with_context(|| format!("create projects dir: {}", projects_dir.display()))?;

    let requests = RequestStore::open(paths.runtime_dir.clone()).await?;
    let permissions = PermissionStore::new(
        permissions_cfg
            .effective_timeout_secs()
            .map(Duration::from_secs),
        permissions_cfg.effective_preview_chars(),
    );

    let bind_addr = bind_override.unwrap_or_else(|| server_cfg.effective_bind_addr().to_owned());
    let listener = server::bind(&bind_addr).await?;
    let local_addr = listener.local_addr().context("read bound address")?;
    let server_url = server_cfg
        .effective_public_url()
        .map(|s| s.trim_end_matches('/').to_owned())
        .unwrap_or_else(|| local_url(local_addr));

    // Hooks must outlive the permission wait; with expiry disabled they wait a day.
    let hook_timeout_secs = permissions_cfg
        .effective_timeout_secs()
        .unwrap_or(goodable_core::config::DEFAULT_PERMISSION_TIMEOUT_SECS)
        + 60;

    let backends = BackendRegistry::from_config(&config);
    let retention = Duration::from_secs(permissions_cfg.effective_retention_secs());

    let shared = Arc::new(SharedState {
        config,
        server_url: server_url.clone(),
        projects_dir,
        hook_timeout_secs,
        requests,
        permissions: permissions.clone(),
        publisher: StreamPublisher::default(),
        backends,
        active: Mutex::new(std::collections::BTreeMap::new()),
        shutdown: handle.clone(),
    });

    tokio::spawn(server::shutdown_signal_watcher(handle.clone()));
    tokio::spawn(permissions.sweeper(retention, SWEEP_INTERVAL, shutdown_rx.clone()));

    tracing::info!(addr = %local_addr, url = %server_url, "server ready");
    println!("ready {server_url}");

    server::serve(listener, shared, shutdown_rx).await?;

    tracing::info!("server shutting down");
    Ok(())
}

fn local_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    format!("http://{}", SocketAddr::new(ip, addr.port()))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `{prefix}-{16 hex}`; falls back to the clock and a counter when the OS RNG is unavailable.
pub(in crate::daemon) fn generate_id(prefix: &str) -> String {
    static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => format!("{prefix}-{}", hex::encode(bytes)),
        Err(err) => {
            tracing::debug!(error = ?err, "getrandom failed, using timestamp id");
            let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}-{}-{seq}", now_ms())
        }
    }
}

/// Draws ids from `next` until one is not `taken`.
pub(in crate::daemon) fn unique_id(
    taken: impl Fn(&str) -> bool,
    mut next: impl FnMut() -> String,
) -> String {
    loop {
        let id = next();
        if !taken(&id) {
            return id;
        }
        tracing::warn!(id = %id, "generated id already in use, retrying");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        let a = generate_id("perm");
        let b = generate_id("perm");
        assert!(a.starts_with("perm-"));
        assert_eq!(a.len(), "perm-".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn unique_id_skips_taken_ids() {
        let mut drawn = vec!["perm-b", "perm-a", "perm-a"];
        let id = unique_id(|id| id == "perm-a", || drawn.pop().unwrap().to_owned());
        assert_eq!(id, "perm-b");
        assert!(drawn.is_empty());
    }

    #[test]
    fn local_url_maps_unspecified_to_loopback() {
        let addr: SocketAddr = "0.0.0.0:8787".parse().unwrap();
        assert_eq!(local_url(addr), "http://127.0.0.1:8787");
        let addr: SocketAddr = "10.0.0.2:9000".parse().unwrap();
        assert_eq!(local_url(addr), "http://10.0.0.2:9000");
    }

    #[tokio::test]
    async fn shutdown_handle_notifies_subscribers() {
        let (shutdown_tx, _) = watch::channel(false);
        let handle = DaemonHandle { shutdown_tx };
        let mut rx = handle.subscribe();
        handle.request_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
