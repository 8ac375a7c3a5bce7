use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use goodable_core::request::{RequestEvent, RequestRecord, RequestStatus, TransitionError};
use tokio::sync::Mutex;

use super::now_ms;
use crate::runtime_store;

pub(in crate::daemon) const RESTART_MESSAGE: &str = "interrupted by server restart";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestStoreError {
    #[error("request not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

struct Inner {
    records: Mutex<BTreeMap<String, RequestRecord>>,
    /// Serializes snapshot writes so the file never goes backwards.
    persist: Mutex<()>,
    runtime_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct RequestStore {
    inner: Arc<Inner>,
}

impl RequestStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::with_records(BTreeMap::new(), None)
    }

    fn with_records(records: BTreeMap<String, RequestRecord>, runtime_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(records),
                persist: Mutex::new(()),
                runtime_dir,
            }),
        }
    }

    /// Loads `requests.json`. Requests that were mid-flight when the previous
    /// process died are failed; `waiting_approval` ones are kept as is.
    pub async fn open(runtime_dir: PathBuf) -> anyhow::Result<Self> {
        let loaded = runtime_store::load_requests(&runtime_dir).await?;
        let now = now_ms();
        let mut records = BTreeMap::new();
        let mut failed = 0usize;
        for record in loaded {
            let record = if record.status.is_terminal()
                || record.status == RequestStatus::WaitingApproval
            {
                record
            } else {
                failed += 1;
                record.apply_event(
                    RequestEvent::Failed {
                        message: RESTART_MESSAGE,
                    },
                    now,
                )?
            };
            records.insert(record.id.clone(), record);
        }

        let store = Self::with_records(records, Some(runtime_dir));
        if failed > 0 {
            tracing::warn!(n = failed, "failed requests interrupted by restart");
            let snapshot = store.snapshot().await;
            store.write(snapshot).await;
        }
        Ok(store)
    }

    async fn snapshot(&self) -> Vec<RequestRecord> {
        let records = self.inner.records.lock().await;
        records.values().cloned().collect()
    }

    async fn write(&self, snapshot: Vec<RequestRecord>) {
        let Some(dir) = self.inner.runtime_dir.as_deref() else {
            return;
        };
        if let Err(err) = runtime_store::save_requests(dir, &snapshot).await {
            tracing::warn!(error = %err, "failed to persist requests");
        }
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<RequestRecord, RequestStoreError>
    where
        F: FnOnce(&RequestRecord) -> Result<RequestRecord, TransitionError>,
    {
        let mut records = self.inner.records.lock().await;
        let current = records
            .get(id)
            .ok_or_else(|| RequestStoreError::NotFound(id.to_owned()))?;
        let next = f(current)?;
        records.insert(id.to_owned(), next.clone());

        // Take the write slot before releasing the records so snapshots land in order.
        let snapshot = records.values().cloned().collect::<Vec<_>>();
        let _persist = self.inner.persist.lock().await;
        drop(records);
        self.write(snapshot).await;
        Ok(next)
    }

    pub async fn create(&self, record: RequestRecord) -> RequestRecord {
        let mut records = self.inner.records.lock().await;
        records.insert(record.id.clone(), record.clone());
        let snapshot = records.values().cloned().collect::<Vec<_>>();
        let _persist = self.inner.persist.lock().await;
        drop(records);
        self.write(snapshot).await;
        record
    }

    pub async fn get(&self, id: &str) -> Option<RequestRecord> {
        let records = self.inner.records.lock().await;
        records.get(id).cloned()
    }

    pub async fn list(&self, project_id: &str) -> Vec<RequestRecord> {
        let records = self.inner.records.lock().await;
        let mut out = records
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn advance(
        &self,
        id: &str,
        to: RequestStatus,
    ) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| r.apply_event(RequestEvent::Advanced { to }, now_ms()))
            .await
    }

    /// Moves `expected -> to`, failing with a mismatch when another writer got there first.
    pub async fn compare_and_set(
        &self,
        id: &str,
        expected: RequestStatus,
        to: RequestStatus,
    ) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| {
            if r.status != expected {
                return Err(TransitionError::Mismatch {
                    expected,
                    actual: r.status,
                });
            }
            match to {
                RequestStatus::Completed => r.apply_event(RequestEvent::Completed, now_ms()),
                RequestStatus::Failed => r.apply_event(RequestEvent::Failed { message: "" }, now_ms()),
                _ => r.apply_event(RequestEvent::Advanced { to }, now_ms()),
            }
        })
        .await
    }

    /// Fails the request only if it is still in `expected`.
    pub async fn fail_from(
        &self,
        id: &str,
        expected: RequestStatus,
        message: &str,
    ) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| {
            if r.status != expected {
                return Err(TransitionError::Mismatch {
                    expected,
                    actual: r.status,
                });
            }
            r.apply_event(RequestEvent::Failed { message }, now_ms())
        })
        .await
    }

    pub async fn complete(&self, id: &str) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| r.apply_event(RequestEvent::Completed, now_ms()))
            .await
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| r.apply_event(RequestEvent::Failed { message }, now_ms()))
            .await
    }

    pub async fn request_cancel(&self, id: &str) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| r.apply_event(RequestEvent::CancelRequested, now_ms()))
            .await
    }

    pub async fn is_cancel_requested(&self, id: &str) -> bool {
        let records = self.inner.records.lock().await;
        records.get(id).is_some_and(|r| r.cancel_requested)
    }

    pub async fn set_session_id(
        &self,
        id: &str,
        session_id: &str,
    ) -> Result<RequestRecord, RequestStoreError> {
        self.mutate(id, |r| {
            r.apply_event(RequestEvent::SessionAssigned { session_id }, now_ms())
        })
        .await
    }
}
