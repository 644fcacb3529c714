//! In-memory collaborators used by the binary and by tests
//!
//! Both record every call so callers can assert on exact write / poll counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared_types::{ExecutionStatus, QueryResult, ResourceKind, ResourceRef, WorkItem};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    ExecutionRequest, ExecutorError, PollResponse, QueryExecutor, ResourcePayload, ResourceStore,
    RunToken, SavedResource, StoreError, WriteError,
};

fn next_version(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

// ============================================================================
// InMemoryStore
// ============================================================================

/// Resource store with optimistic concurrency on `updated_at`
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    resources: DashMap<ResourceRef, ResourcePayload>,
    work_items: DashMap<ResourceRef, WorkItem>,
    writes: Mutex<Vec<ResourcePayload>>,
    failures: Mutex<VecDeque<WriteError>>,
    publishes: Mutex<Vec<(String, bool)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as if it already existed server-side; returns it
    /// stamped with its server version.
    pub fn seed(&self, mut payload: ResourcePayload) -> ResourcePayload {
        payload.set_updated_at(Some(next_version(None)));
        match &payload {
            ResourcePayload::WorkItem(item) => {
                self.inner.work_items.insert(item.resource(), item.clone());
            }
            _ => {
                self.inner
                    .resources
                    .insert(payload.resource(), payload.clone());
            }
        }
        payload
    }

    /// Simulate another session saving `resource`, invalidating local versions.
    pub fn bump_version(&self, resource: &ResourceRef) -> bool {
        if let Some(mut entry) = self.inner.resources.get_mut(resource) {
            let version = next_version(entry.updated_at());
            entry.set_updated_at(Some(version));
            return true;
        }
        false
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<ResourcePayload> {
        if resource.kind == ResourceKind::Folder {
            return self
                .inner
                .work_items
                .get(resource)
                .map(|item| ResourcePayload::WorkItem(item.clone()));
        }
        self.inner.resources.get(resource).map(|p| p.clone())
    }

    /// Make the next write fail with `error`
    pub async fn fail_next(&self, error: WriteError) {
        self.inner.failures.lock().await.push_back(error);
    }

    /// Every write attempt, in arrival order
    pub async fn writes(&self) -> Vec<ResourcePayload> {
        self.inner.writes.lock().await.clone()
    }

    pub async fn writes_for(&self, resource: &ResourceRef) -> Vec<ResourcePayload> {
        self.inner
            .writes
            .lock()
            .await
            .iter()
            .filter(|payload| &payload.resource() == resource)
            .cloned()
            .collect()
    }

    pub async fn publishes(&self) -> Vec<(String, bool)> {
        self.inner.publishes.lock().await.clone()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn update(&self, payload: ResourcePayload) -> Result<SavedResource, WriteError> {
        self.inner.writes.lock().await.push(payload.clone());
        if let Some(error) = self.inner.failures.lock().await.pop_front() {
            return Err(error);
        }

        let resource = payload.resource();
        let current = match &payload {
            ResourcePayload::WorkItem(item) => {
                self.inner.work_items.get(&resource).map(|w| w.updated_at)
            }
            _ => self.inner.resources.get(&resource).map(|p| p.updated_at()),
        };
        if let Some(current) = current {
            if current != payload.updated_at() {
                tracing::debug!(resource = %resource, "Rejecting stale write");
                return Err(WriteError::from_status(resource, 409, "stale version"));
            }
        }

        let updated_at = next_version(current.flatten());
        let mut stored = payload;
        stored.set_updated_at(Some(updated_at));
        match stored {
            ResourcePayload::WorkItem(item) => {
                self.inner.work_items.insert(resource.clone(), item);
            }
            other => {
                self.inner.resources.insert(resource.clone(), other);
            }
        }
        Ok(SavedResource {
            resource,
            updated_at,
        })
    }

    async fn fetch(&self, resource: &ResourceRef) -> Result<ResourcePayload, StoreError> {
        self.get(resource)
            .ok_or_else(|| StoreError::NotFound(resource.clone()))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), StoreError> {
        let removed = if resource.kind == ResourceKind::Folder {
            self.inner.work_items.remove(resource).is_some()
        } else {
            let removed = self.inner.resources.remove(resource).is_some();
            // The explorer entry goes with the resource
            self.inner.work_items.remove(resource);
            removed
        };
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound(resource.clone()))
        }
    }

    async fn list_work_items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut items: Vec<WorkItem> = self
            .inner
            .work_items
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.kind.cmp(&b.kind)));
        Ok(items)
    }

    async fn set_published(
        &self,
        dashboard_id: &str,
        published: bool,
    ) -> Result<SavedResource, WriteError> {
        self.inner
            .publishes
            .lock()
            .await
            .push((dashboard_id.to_string(), published));
        if let Some(error) = self.inner.failures.lock().await.pop_front() {
            return Err(error);
        }

        let resource = ResourceRef::dashboard(dashboard_id);
        let Some(mut entry) = self.inner.resources.get_mut(&resource) else {
            return Err(WriteError::from_status(resource, 404, "dashboard not found"));
        };
        let updated_at = next_version(entry.updated_at());
        if let ResourcePayload::Dashboard(dashboard) = entry.value_mut() {
            dashboard.published = published;
            dashboard.updated_at = Some(updated_at);
        }
        Ok(SavedResource {
            resource,
            updated_at,
        })
    }
}

// ============================================================================
// ScriptedExecutor
// ============================================================================

struct ScriptedRun {
    steps: VecDeque<PollResponse>,
}

/// Query executor whose poll responses follow a script.
///
/// Each submitted run takes a copy of the current script; polls walk through
/// it and keep repeating the last step.
#[derive(Clone)]
pub struct ScriptedExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    runs: Mutex<HashMap<String, ScriptedRun>>,
    script: Mutex<Vec<PollResponse>>,
    result: Mutex<QueryResult>,
    submit_failures: Mutex<VecDeque<ExecutorError>>,
    fetch_failures: Mutex<VecDeque<ExecutorError>>,
    submissions: Mutex<Vec<ExecutionRequest>>,
    cancels: Mutex<Vec<RunToken>>,
    honor_cancel: AtomicBool,
    polls: AtomicUsize,
    counter: AtomicU64,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                runs: Mutex::new(HashMap::new()),
                script: Mutex::new(vec![PollResponse::status(ExecutionStatus::Finished)]),
                result: Mutex::new(QueryResult::default()),
                submit_failures: Mutex::new(VecDeque::new()),
                fetch_failures: Mutex::new(VecDeque::new()),
                submissions: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                honor_cancel: AtomicBool::new(true),
                polls: AtomicUsize::new(0),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Poll responses for runs submitted from now on
    pub async fn script(&self, steps: Vec<PollResponse>) {
        if steps.is_empty() {
            return;
        }
        *self.inner.script.lock().await = steps;
    }

    pub async fn set_result(&self, result: QueryResult) {
        *self.inner.result.lock().await = result;
    }

    pub async fn fail_next_submit(&self, error: ExecutorError) {
        self.inner.submit_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_fetch(&self, error: ExecutorError) {
        self.inner.fetch_failures.lock().await.push_back(error);
    }

    /// When false, cancel requests are acknowledged but the run keeps
    /// following its script (the server finished first).
    pub fn set_honor_cancel(&self, honor: bool) {
        self.inner.honor_cancel.store(honor, Ordering::Relaxed);
    }

    pub async fn submissions(&self) -> Vec<ExecutionRequest> {
        self.inner.submissions.lock().await.clone()
    }

    pub async fn cancels(&self) -> Vec<RunToken> {
        self.inner.cancels.lock().await.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.inner.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn submit(&self, request: ExecutionRequest) -> Result<RunToken, ExecutorError> {
        self.inner.submissions.lock().await.push(request);
        if let Some(error) = self.inner.submit_failures.lock().await.pop_front() {
            return Err(error);
        }
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let token = RunToken(format!("run-{n}"));
        let steps: VecDeque<PollResponse> = self.inner.script.lock().await.iter().cloned().collect();
        self.inner
            .runs
            .lock()
            .await
            .insert(token.0.clone(), ScriptedRun { steps });
        Ok(token)
    }

    async fn poll(&self, token: &RunToken) -> Result<PollResponse, ExecutorError> {
        self.inner.polls.fetch_add(1, Ordering::Relaxed);
        let mut runs = self.inner.runs.lock().await;
        let run = runs
            .get_mut(&token.0)
            .ok_or_else(|| ExecutorError::UnknownRun(token.0.clone()))?;
        let step = if run.steps.len() > 1 {
            run.steps.pop_front()
        } else {
            run.steps.front().cloned()
        };
        step.ok_or_else(|| ExecutorError::UnknownRun(token.0.clone()))
    }

    async fn fetch_result(&self, token: &RunToken) -> Result<QueryResult, ExecutorError> {
        if let Some(error) = self.inner.fetch_failures.lock().await.pop_front() {
            return Err(error);
        }
        if !self.inner.runs.lock().await.contains_key(&token.0) {
            return Err(ExecutorError::UnknownRun(token.0.clone()));
        }
        Ok(self.inner.result.lock().await.clone())
    }

    async fn cancel(&self, token: &RunToken) -> Result<(), ExecutorError> {
        self.inner.cancels.lock().await.push(token.clone());
        if self.inner.honor_cancel.load(Ordering::Relaxed) {
            if let Some(run) = self.inner.runs.lock().await.get_mut(&token.0) {
                run.steps = VecDeque::from(vec![PollResponse::status(ExecutionStatus::Cancelled)]);
            }
        }
        Ok(())
    }
}
