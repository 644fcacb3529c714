//! Directory - addresses actors by logical key
//!
//! A cheap, cloneable handle over a concurrent map from stable string keys
//! (`dashboard-<id>`, `query-<id>`, ...) to live actor cells. Registration only
//! makes an actor discoverable; ownership stays with whoever spawned it.
//!
//! Every effective mutation publishes a fresh immutable [`DirectorySnapshot`]
//! on a `watch` channel so observers can re-derive presence reactively.

use dashmap::DashMap;
use ractor::{ActorCell, ActorId, ActorRef, Message};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Stable key namespace shared by every actor that resolves collaborators
pub mod keys {
    use shared_types::ResourceKind;

    pub const WORK_ITEMS: &str = "workItems";
    pub const QUERIES: &str = "queries";
    pub const NOTIFICATIONS: &str = "notifications";

    pub fn dashboard(id: &str) -> String {
        format!("dashboard-{id}")
    }

    pub fn query(id: &str) -> String {
        format!("query-{id}")
    }

    pub fn query_run(id: &str) -> String {
        format!("queryRun-{id}")
    }

    pub fn visualization(id: &str) -> String {
        format!("visualization-{id}")
    }

    pub fn work_item(kind: ResourceKind, id: &str) -> String {
        format!("workItem-{}-{id}", kind.as_str())
    }
}

/// Proof of one registration; only the holder may `release` it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationToken {
    key: String,
    id: u64,
}

impl RegistrationToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct DirectoryEntry {
    cell: ActorCell,
    message_type: TypeId,
    type_name: &'static str,
    token: u64,
}

/// Read-only view of one entry inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub actor_id: ActorId,
    pub message_type: &'static str,
}

/// Immutable copy of the whole directory at one instant
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub version: u64,
    pub entries: BTreeMap<String, EntryInfo>,
}

impl DirectorySnapshot {
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct Directory {
    entries: Arc<DashMap<String, DirectoryEntry>>,
    snapshots: Arc<watch::Sender<Arc<DirectorySnapshot>>>,
    next_token: Arc<AtomicU64>,
    version: Arc<AtomicU64>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(DirectorySnapshot::default()));
        Self {
            entries: Arc::new(DashMap::new()),
            snapshots: Arc::new(tx),
            next_token: Arc::new(AtomicU64::new(1)),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register `actor` under `key`. A live entry under the same key is
    /// replaced (not stopped).
    pub fn register<M: Message>(&self, actor: &ActorRef<M>, key: impl Into<String>) -> RegistrationToken {
        let key = key.into();
        let token = self.insert(actor, &key);
        self.publish();
        token
    }

    /// Register many actors of one message type, publishing a single snapshot.
    pub fn bulk_register<M, I, K>(&self, actors: I) -> Vec<RegistrationToken>
    where
        M: Message,
        I: IntoIterator<Item = (K, ActorRef<M>)>,
        K: Into<String>,
    {
        let tokens: Vec<RegistrationToken> = actors
            .into_iter()
            .map(|(key, actor)| {
                let key = key.into();
                self.insert(&actor, &key)
            })
            .collect();
        if !tokens.is_empty() {
            self.publish();
        }
        tokens
    }

    fn insert<M: Message>(&self, actor: &ActorRef<M>, key: &str) -> RegistrationToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = DirectoryEntry {
            cell: actor.get_cell(),
            message_type: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            token: id,
        };
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            if previous.cell.get_id() != actor.get_id() {
                tracing::warn!(
                    key = %key,
                    previous_actor = %previous.cell.get_id(),
                    actor_id = %actor.get_id(),
                    "Directory key re-registered; previous actor is no longer addressable"
                );
            }
        }
        tracing::debug!(key = %key, actor_id = %actor.get_id(), "Directory entry registered");
        RegistrationToken {
            key: key.to_string(),
            id,
        }
    }

    /// Stop the actor registered under `key` and remove the entry.
    /// Returns `false` (and publishes nothing) for unknown keys.
    pub fn unregister(&self, key: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        tracing::debug!(key = %key, actor_id = %entry.cell.get_id(), "Directory entry unregistered");
        entry.cell.stop(Some(format!("unregistered:{key}")));
        self.publish();
        true
    }

    /// Remove the entry only if it still belongs to `token`. Does not stop
    /// the actor.
    pub fn release(&self, token: &RegistrationToken) -> bool {
        let removed = self
            .entries
            .remove_if(&token.key, |_, entry| entry.token == token.id)
            .is_some();
        if removed {
            self.publish();
        }
        removed
    }

    /// Resolve `key` to a typed handle. Never blocks, never creates.
    pub fn get<M: Message>(&self, key: &str) -> Option<ActorRef<M>> {
        let entry = self.entries.get(key)?;
        if entry.message_type != TypeId::of::<M>() {
            tracing::debug!(
                key = %key,
                expected = std::any::type_name::<M>(),
                registered = entry.type_name,
                "Directory lookup with mismatched message type"
            );
            return None;
        }
        Some(ActorRef::from(entry.cell.clone()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<DirectorySnapshot>> {
        self.snapshots.subscribe()
    }

    fn publish(&self) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    EntryInfo {
                        actor_id: entry.cell.get_id(),
                        message_type: entry.type_name,
                    },
                )
            })
            .collect();
        self.snapshots
            .send_replace(Arc::new(DirectorySnapshot { version, entries }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ractor::{Actor, ActorProcessingErr, ActorStatus};

    struct Echo;

    #[async_trait]
    impl Actor for Echo {
        type Msg = String;
        type State = ();
        type Arguments = ();

        async fn pre_start(
            &self,
            _myself: ActorRef<Self::Msg>,
            _args: Self::Arguments,
        ) -> Result<Self::State, ActorProcessingErr> {
            Ok(())
        }
    }

    struct Counter;

    #[async_trait]
    impl Actor for Counter {
        type Msg = u32;
        type State = ();
        type Arguments = ();

        async fn pre_start(
            &self,
            _myself: ActorRef<Self::Msg>,
            _args: Self::Arguments,
        ) -> Result<Self::State, ActorProcessingErr> {
            Ok(())
        }
    }

    async fn wait_stopped(cell: &ActorCell) {
        for _ in 0..50 {
            if cell.get_status() == ActorStatus::Stopped {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_get_returns_registered_handle() {
        let directory = Directory::new();
        let (echo, _handle) = Actor::spawn(None, Echo, ()).await.unwrap();

        directory.register(&echo, keys::dashboard("d1"));

        let found: ActorRef<String> = directory.get("dashboard-d1").unwrap();
        assert_eq!(found.get_id(), echo.get_id());
        assert!(directory.get::<String>("dashboard-d2").is_none());

        echo.stop(None);
    }

    #[tokio::test]
    async fn test_get_rejects_wrong_message_type() {
        let directory = Directory::new();
        let (counter, _handle) = Actor::spawn(None, Counter, ()).await.unwrap();
        directory.register(&counter, "query-q1");

        assert!(directory.get::<String>("query-q1").is_none());
        assert!(directory.get::<u32>("query-q1").is_some());

        counter.stop(None);
    }

    #[tokio::test]
    async fn test_unregister_stops_actor_and_publishes() {
        let directory = Directory::new();
        let (echo, handle) = Actor::spawn(None, Echo, ()).await.unwrap();
        directory.register(&echo, "query-q1");
        let before = directory.snapshot();
        assert!(before.contains("query-q1"));

        assert!(directory.unregister("query-q1"));
        handle.await.unwrap();

        let after = directory.snapshot();
        assert!(!after.contains("query-q1"));
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn test_unregister_unknown_key_is_noop() {
        let directory = Directory::new();
        let watcher = directory.watch();
        let version = directory.snapshot().version;

        assert!(!directory.unregister("dashboard-missing"));

        assert_eq!(directory.snapshot().version, version);
        assert!(!watcher.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_reregister_keeps_previous_actor_alive() {
        let directory = Directory::new();
        let (first, _h1) = Actor::spawn(None, Echo, ()).await.unwrap();
        let (second, _h2) = Actor::spawn(None, Echo, ()).await.unwrap();

        let stale = directory.register(&first, "dashboard-d1");
        directory.register(&second, "dashboard-d1");

        let found: ActorRef<String> = directory.get("dashboard-d1").unwrap();
        assert_eq!(found.get_id(), second.get_id());
        assert_eq!(first.get_status(), ActorStatus::Running);

        // The stale token no longer owns the key
        assert!(!directory.release(&stale));
        assert!(directory.contains("dashboard-d1"));

        first.stop(None);
        second.stop(None);
    }

    #[tokio::test]
    async fn test_release_removes_without_stopping() {
        let directory = Directory::new();
        let (echo, _handle) = Actor::spawn(None, Echo, ()).await.unwrap();
        let token = directory.register(&echo, "visualization-v1");

        assert!(directory.release(&token));
        assert!(!directory.contains("visualization-v1"));
        assert_eq!(echo.get_status(), ActorStatus::Running);

        echo.stop(None);
        wait_stopped(&echo.get_cell()).await;
    }

    #[tokio::test]
    async fn test_bulk_register_publishes_once() {
        let directory = Directory::new();
        let (a, _ha) = Actor::spawn(None, Counter, ()).await.unwrap();
        let (b, _hb) = Actor::spawn(None, Counter, ()).await.unwrap();
        let version = directory.snapshot().version;

        let tokens = directory.bulk_register(vec![
            (keys::work_item(shared_types::ResourceKind::Query, "q1"), a.clone()),
            (keys::work_item(shared_types::ResourceKind::Folder, "f1"), b.clone()),
        ]);

        assert_eq!(tokens.len(), 2);
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.version, version + 1);
        assert!(snapshot.contains("workItem-query-q1"));
        assert!(snapshot.contains("workItem-folder-f1"));

        a.stop(None);
        b.stop(None);
    }
}
