use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use goodable_core::permission::{input_preview, PendingPermission, PermissionStatus};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use super::{generate_id, now_ms, unique_id};

pub(in crate::daemon) type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("tool_name is required")]
    EmptyToolName,
}

struct Entry {
    record: PendingPermission,
    resolver: Option<oneshot::Sender<bool>>,
    timer: Option<AbortHandle>,
}

impl Entry {
    /// Moves a pending entry to `status` and wakes its waiter. No-op otherwise.
    fn settle(&mut self, status: PermissionStatus) -> bool {
        if !self.record.is_pending() {
            return false;
        }
        self.record.status = status;
        if let Some(tx) = self.resolver.take() {
            let _ = tx.send(status == PermissionStatus::Approved);
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        true
    }
}

struct Inner {
    entries: Mutex<BTreeMap<String, Entry>>,
    timeout: Option<Duration>,
    preview_chars: usize,
    clock: Clock,
}

/// Suspended decision for one tool use.
pub struct PermissionWait {
    rx: oneshot::Receiver<bool>,
}

impl PermissionWait {
    /// `true` when approved. Denied, expired, and dropped entries all read as `false`.
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<Inner>,
}

impl PermissionStore {
    pub fn new(timeout: Option<Duration>, preview_chars: usize) -> Self {
        Self::with_clock(timeout, preview_chars, Arc::new(now_ms))
    }

    pub(in crate::daemon) fn with_clock(
        timeout: Option<Duration>,
        preview_chars: usize,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                timeout,
                preview_chars,
                clock,
            }),
        }
    }

    fn now(&self) -> u64 {
        (self.inner.clock)()
    }

    pub async fn create_and_wait(
        &self,
        project_id: &str,
        request_id: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> Result<(PendingPermission, PermissionWait), PermissionError> {
        let tool_name = tool_name.trim();
        if tool_name.is_empty() {
            return Err(PermissionError::EmptyToolName);
        }

        let created_at_ms = self.now();
        let expires_at_ms = match self.inner.timeout {
            Some(timeout) => created_at_ms.saturating_add(timeout.as_millis() as u64),
            None => u64::MAX,
        };
        let mut record = PendingPermission {
            id: String::new(),
            project_id: project_id.to_owned(),
            request_id: request_id.to_owned(),
            tool_name: tool_name.to_owned(),
            input_preview: input_preview(&tool_input, self.inner.preview_chars),
            tool_input,
            created_at_ms,
            expires_at_ms,
            status: PermissionStatus::Pending,
        };

        let (tx, rx) = oneshot::channel();
        let mut entries = self.inner.entries.lock().await;
        record.id = unique_id(|id| entries.contains_key(id), || generate_id("perm"));
        let timer = self.inner.timeout.map(|timeout| {
            let store = self.clone();
            let id = record.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                store.expire(&id).await;
            })
            .abort_handle()
        });
        entries.insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                resolver: Some(tx),
                timer,
            },
        );
        drop(entries);

        tracing::info!(
            permission_id = %record.id,
            project = %record.project_id,
            request_id = %record.request_id,
            tool = %record.tool_name,
            "permission requested"
        );
        Ok((record, PermissionWait { rx }))
    }

    pub async fn list_pending(&self, project_id: &str) -> Vec<PendingPermission> {
        let now = self.now();
        let mut entries = self.inner.entries.lock().await;
        let mut out = Vec::new();
        for entry in entries.values_mut() {
            if entry.record.project_id != project_id || !entry.record.is_pending() {
                continue;
            }
            if now >= entry.record.expires_at_ms {
                entry.settle(PermissionStatus::Expired);
                tracing::info!(permission_id = %entry.record.id, "permission expired");
                continue;
            }
            out.push(entry.record.clone());
        }
        drop(entries);

        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Succeeds only for a pending permission. Unknown ids and already
    /// resolved entries return `false` and change nothing.
    pub async fn resolve(&self, id: &str, approved: bool) -> bool {
        let status = if approved {
            PermissionStatus::Approved
        } else {
            PermissionStatus::Denied
        };
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        let ok = entry.settle(status);
        if ok {
            tracing::info!(permission_id = %id, status = %status, "permission resolved");
        }
        ok
    }

    pub async fn expire(&self, id: &str) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let ok = entries
            .get_mut(id)
            .is_some_and(|entry| entry.settle(PermissionStatus::Expired));
        if ok {
            tracing::info!(permission_id = %id, "permission expired");
        }
        ok
    }

    pub async fn get(&self, id: &str) -> Option<PendingPermission> {
        let entries = self.inner.entries.lock().await;
        entries.get(id).map(|e| e.record.clone())
    }

    /// Denies every pending permission of one request.
    pub async fn cancel_for_request(&self, project_id: &str, request_id: &str) -> usize {
        let mut entries = self.inner.entries.lock().await;
        let mut n = 0;
        for entry in entries.values_mut() {
            if entry.record.project_id == project_id
                && entry.record.request_id == request_id
                && entry.settle(PermissionStatus::Denied)
            {
                n += 1;
            }
        }
        if n > 0 {
            tracing::info!(project = %project_id, request_id = %request_id, n, "denied pending permissions");
        }
        n
    }

    /// Drops entries created more than `retention` ago, resolved or not.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let cutoff = self.now().saturating_sub(retention.as_millis() as u64);
        let mut entries = self.inner.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| {
            if e.record.created_at_ms >= cutoff {
                return true;
            }
            e.settle(PermissionStatus::Expired);
            false
        });
        before - entries.len()
    }

    pub(in crate::daemon) async fn sweeper(
        self,
        retention: Duration,
        interval: Duration,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.sweep(retention).await;
                    if n > 0 {
                        tracing::debug!(n, "swept permissions");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    use serde_json::json;

    fn manual_clock(start: u64) -> (Arc<AtomicU64>, Clock) {
        let now = Arc::new(AtomicU64::new(start));
        let clock_now = now.clone();
        (now, Arc::new(move || clock_now.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn create_list_approve_list() {
        let store = PermissionStore::new(Some(Duration::from_secs(60)), 500);
        let (perm, wait) = store
            .create_and_wait("demo", "r1", "Bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(perm.status, PermissionStatus::Pending);
        assert_eq!(perm.input_preview, r#"{"command":"ls"}"#);

        let pending = store.list_pending("demo").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, perm.id);
        assert!(store.list_pending("other").await.is_empty());

        assert!(store.resolve(&perm.id, true).await);
        assert!(wait.wait().await);
        assert!(store.list_pending("demo").await.is_empty());
        assert_eq!(
            store.get(&perm.id).await.unwrap().status,
            PermissionStatus::Approved
        );
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let store = PermissionStore::new(None, 500);
        let (perm, wait) = store
            .create_and_wait("demo", "r1", "Write", json!({}))
            .await
            .unwrap();

        assert!(store.resolve(&perm.id, false).await);
        assert!(!store.resolve(&perm.id, true).await);
        assert!(!wait.wait().await);
        assert_eq!(
            store.get(&perm.id).await.unwrap().status,
            PermissionStatus::Denied
        );
        assert!(!store.resolve("missing", true).await);
    }

    #[tokio::test]
    async fn empty_tool_name_is_rejected() {
        let store = PermissionStore::new(None, 500);
        let err = store
            .create_and_wait("demo", "r1", "  ", json!({}))
            .await
            .err();
        assert_eq!(err, Some(PermissionError::EmptyToolName));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_unread_permission_once() {
        let store = PermissionStore::new(Some(Duration::from_secs(30)), 500);
        let (perm, wait) = store
            .create_and_wait("demo", "r1", "Bash", json!({"command": "rm -rf build"}))
            .await
            .unwrap();

        assert!(!wait.wait().await);
        assert_eq!(
            store.get(&perm.id).await.unwrap().status,
            PermissionStatus::Expired
        );
        assert!(!store.expire(&perm.id).await);
        assert!(!store.resolve(&perm.id, true).await);
    }

    #[tokio::test]
    async fn listing_flips_overdue_entries() {
        let (now, clock) = manual_clock(1_000);
        let store = PermissionStore::with_clock(Some(Duration::from_secs(3600)), 500, clock);
        let (perm, wait) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();
        assert_eq!(perm.expires_at_ms, 1_000 + 3_600_000);

        now.store(1_000 + 3_600_000, Ordering::SeqCst);
        assert!(store.list_pending("demo").await.is_empty());
        assert!(!wait.wait().await);
        assert_eq!(
            store.get(&perm.id).await.unwrap().status,
            PermissionStatus::Expired
        );
    }

    #[tokio::test]
    async fn pending_sorted_by_creation_then_id() {
        let (now, clock) = manual_clock(10);
        let store = PermissionStore::with_clock(None, 500, clock);
        let (late, _w1) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();
        now.store(5, Ordering::SeqCst);
        let (early, _w2) = store
            .create_and_wait("demo", "r1", "Edit", json!({}))
            .await
            .unwrap();

        let ids = store
            .list_pending("demo")
            .await
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn cancel_for_request_denies_only_that_request() {
        let store = PermissionStore::new(None, 500);
        let (_, w1) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();
        let (other, _w2) = store
            .create_and_wait("demo", "r2", "Bash", json!({}))
            .await
            .unwrap();

        assert_eq!(store.cancel_for_request("demo", "r1").await, 1);
        assert!(!w1.wait().await);
        let pending = store.list_pending("demo").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, other.id);
    }

    #[tokio::test]
    async fn sweep_drops_old_entries_regardless_of_status() {
        let (now, clock) = manual_clock(0);
        let store = PermissionStore::with_clock(None, 500, clock);
        let (resolved, _w1) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();
        store.resolve(&resolved.id, true).await;
        let (stale, w2) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();

        now.store(10_000, Ordering::SeqCst);
        let (fresh, _w3) = store
            .create_and_wait("demo", "r1", "Bash", json!({}))
            .await
            .unwrap();

        assert_eq!(store.sweep(Duration::from_secs(5)).await, 2);
        assert!(store.get(&resolved.id).await.is_none());
        assert!(store.get(&stale.id).await.is_none());
        assert!(store.get(&fresh.id).await.is_some());
        assert!(!w2.wait().await);
    }
}
