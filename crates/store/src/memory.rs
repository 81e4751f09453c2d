//! In-memory backend: one mutex-guarded table set behind every plugin
//! contract. Doubles as the test double for the service crates.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use muster_core::{
    Application, Configuration, ExpiryRecord, Node, Secret, Selector, Shadow, StoreError, Task,
    TaskStatus,
};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{
    ExpiryStore, IndexStore, LabelMatcher, Locker, ResourceStore, ShadowStore, StoreResult,
    TaskStore, TransactionFactory, TransactionHandle, Tx,
};

type Key = (String, String);
/// (namespace, kind_a, kind_b, value_a)
type IndexKey = (String, String, String, String);

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct State {
    nodes: FxHashMap<Key, Node>,
    applications: FxHashMap<Key, Application>,
    configurations: FxHashMap<Key, Configuration>,
    secrets: FxHashMap<Key, Secret>,
    shadows: FxHashMap<Key, Shadow>,
    indexes: FxHashMap<IndexKey, Vec<String>>,
    tasks: FxHashMap<Key, Task>,
    expiry: Vec<ExpiryRecord>,
    locks: FxHashMap<String, Lease>,
    seq: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.seq += 1;
        self.seq.to_string()
    }
}

/// Single-process backend over mutex-guarded hash tables.
#[derive(Clone, Default)]
pub struct MemBackend {
    state: Arc<Mutex<State>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens if a holder panicked; the tables are
        // still structurally sound, so keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-type table access for the generic resource-store impl.
trait Record: Clone + Send + 'static {
    fn key(&self) -> Key;
    fn set_version(&mut self, version: String);
    fn table(state: &mut State) -> &mut FxHashMap<Key, Self>;
}

macro_rules! impl_record {
    ($ty:ty, $table:ident) => {
        impl Record for $ty {
            fn key(&self) -> Key {
                (self.namespace.clone(), self.name.clone())
            }
            fn set_version(&mut self, version: String) {
                self.version = version;
            }
            fn table(state: &mut State) -> &mut FxHashMap<Key, Self> {
                &mut state.$table
            }
        }
    };
}

impl_record!(Node, nodes);
impl_record!(Application, applications);
impl_record!(Configuration, configurations);
impl_record!(Secret, secrets);

#[async_trait]
impl<T: Record + Sync> ResourceStore<T> for MemBackend {
    async fn get(&self, _tx: Tx<'_>, namespace: &str, name: &str) -> StoreResult<Option<T>> {
        let mut state = self.lock_state();
        Ok(T::table(&mut state)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, _tx: Tx<'_>, mut value: T) -> StoreResult<T> {
        let mut state = self.lock_state();
        let key = value.key();
        if T::table(&mut state).contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{}/{} already exists",
                key.0, key.1
            )));
        }
        value.set_version(state.next_version());
        T::table(&mut state).insert(key, value.clone());
        Ok(value)
    }

    async fn update(&self, _tx: Tx<'_>, mut value: T) -> StoreResult<T> {
        let mut state = self.lock_state();
        let key = value.key();
        if !T::table(&mut state).contains_key(&key) {
            return Err(StoreError::NotFound);
        }
        value.set_version(state.next_version());
        T::table(&mut state).insert(key, value.clone());
        Ok(value)
    }

    async fn delete(&self, _tx: Tx<'_>, namespace: &str, name: &str) -> StoreResult<()> {
        let mut state = self.lock_state();
        T::table(&mut state)
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, _tx: Tx<'_>, namespace: &str) -> StoreResult<Vec<T>> {
        let mut state = self.lock_state();
        let mut out: Vec<T> = T::table(&mut state)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by_key(|v| v.key());
        Ok(out)
    }
}

impl LabelMatcher for MemBackend {
    fn is_label_match(
        &self,
        selector: &str,
        labels: &BTreeMap<String, String>,
    ) -> muster_core::Result<bool> {
        Ok(Selector::parse(selector)?.matches(labels))
    }
}

#[async_trait]
impl ShadowStore for MemBackend {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Shadow>> {
        Ok(self
            .lock_state()
            .shadows
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, shadow: Shadow) -> StoreResult<Shadow> {
        let mut state = self.lock_state();
        let key = (shadow.namespace.clone(), shadow.name.clone());
        if state.shadows.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "shadow {}/{} already exists",
                key.0, key.1
            )));
        }
        state.shadows.insert(key, shadow.clone());
        Ok(shadow)
    }

    async fn list(&self, namespace: &str) -> StoreResult<Vec<Shadow>> {
        let state = self.lock_state();
        let mut out: Vec<Shadow> = state
            .shadows
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.lock_state()
            .shadows
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn update_desire(&self, shadow: Shadow) -> StoreResult<Shadow> {
        let mut state = self.lock_state();
        let key = (shadow.namespace.clone(), shadow.name.clone());
        let stored = state.shadows.get_mut(&key).ok_or(StoreError::NotFound)?;
        stored.desire = shadow.desire;
        Ok(stored.clone())
    }

    async fn update_report(&self, shadow: Shadow) -> StoreResult<Shadow> {
        let mut state = self.lock_state();
        let key = (shadow.namespace.clone(), shadow.name.clone());
        let stored = state.shadows.get_mut(&key).ok_or(StoreError::NotFound)?;
        stored.report = shadow.report;
        Ok(stored.clone())
    }
}

#[async_trait]
impl IndexStore for MemBackend {
    async fn refresh_index(
        &self,
        _tx: Tx<'_>,
        namespace: &str,
        kind_a: &str,
        kind_b: &str,
        value_a: &str,
        value_bs: Vec<String>,
    ) -> StoreResult<()> {
        let key = (
            namespace.to_string(),
            kind_a.to_string(),
            kind_b.to_string(),
            value_a.to_string(),
        );
        let mut state = self.lock_state();
        if value_bs.is_empty() {
            state.indexes.remove(&key);
        } else {
            state.indexes.insert(key, value_bs);
        }
        Ok(())
    }

    async fn list_index(
        &self,
        namespace: &str,
        kind: &str,
        wanted_kind: &str,
        value: &str,
    ) -> StoreResult<Vec<String>> {
        let state = self.lock_state();
        let mut out = Vec::new();
        for ((ns, ka, kb, va), vbs) in state.indexes.iter() {
            if ns != namespace {
                continue;
            }
            // Stored as (kind_a: va) -> pairs with each (kind_b: vb).
            if ka == kind && kb == wanted_kind && va == value {
                out.extend(vbs.iter().cloned());
            } else if ka == wanted_kind && kb == kind && vbs.iter().any(|v| v == value) {
                out.push(va.clone());
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[async_trait]
impl Locker for MemBackend {
    async fn lock(&self, name: &str, ttl_secs: u64) -> StoreResult<String> {
        let mut state = self.lock_state();
        let now = Utc::now();
        if let Some(lease) = state.locks.get(name) {
            if lease.expires_at > now {
                return Err(StoreError::Conflict(format!("lock {} is held", name)));
            }
        }
        let token = Uuid::new_v4().to_string();
        state.locks.insert(
            name.to_string(),
            Lease {
                token: token.clone(),
                expires_at: now + Duration::seconds(ttl_secs as i64),
            },
        );
        Ok(token)
    }

    async fn unlock(&self, name: &str, lease: &str) -> StoreResult<()> {
        let mut state = self.lock_state();
        match state.locks.get(name) {
            Some(held) if held.token == lease => {
                state.locks.remove(name);
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!(
                "lock {} held by another lease",
                name
            ))),
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl TaskStore for MemBackend {
    async fn create_task(&self, task: Task) -> StoreResult<Task> {
        let mut state = self.lock_state();
        let key = (task.namespace.clone(), task.name.clone());
        if state.tasks.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "task {}/{} already exists",
                key.0, key.1
            )));
        }
        state.tasks.insert(key, task.clone());
        Ok(task)
    }

    async fn get_task(&self, namespace: &str, name: &str) -> StoreResult<Option<Task>> {
        Ok(self
            .lock_state()
            .tasks
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn tasks_need_process(&self, limit: usize) -> StoreResult<Vec<Task>> {
        let state = self.lock_state();
        let mut out: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status != TaskStatus::Finished)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out.truncate(limit);
        Ok(out)
    }

    async fn update_task(&self, task: Task) -> StoreResult<Task> {
        let mut state = self.lock_state();
        let key = (task.namespace.clone(), task.name.clone());
        let stored = state.tasks.get_mut(&key).ok_or(StoreError::NotFound)?;
        if task.version <= stored.version {
            return Err(StoreError::Conflict(format!(
                "stale task version {} (stored {})",
                task.version, stored.version
            )));
        }
        *stored = task.clone();
        Ok(task)
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.lock_state()
            .tasks
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl ExpiryStore for MemBackend {
    async fn add_expiry(&self, record: ExpiryRecord) -> StoreResult<()> {
        let mut state = self.lock_state();
        state
            .expiry
            .retain(|r| !(r.namespace == record.namespace && r.name == record.name));
        state.expiry.push(record);
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiryRecord>> {
        Ok(self
            .lock_state()
            .expiry
            .iter()
            .filter(|r| r.expired_at <= now)
            .cloned()
            .collect())
    }

    async fn delete_expiry(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut state = self.lock_state();
        let before = state.expiry.len();
        state
            .expiry
            .retain(|r| !(r.namespace == namespace && r.name == name));
        if state.expiry.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Whole-state snapshot transaction: rollback restores the tables as they
/// were at begin. Concurrent writes between begin and rollback are clobbered;
/// acceptable for a single-process backend.
struct MemTx {
    state: Arc<Mutex<State>>,
    snapshot: Option<State>,
}

impl TransactionHandle for MemTx {
    fn commit(&mut self) -> StoreResult<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
        }
        Ok(())
    }
}

impl TransactionFactory for MemBackend {
    fn begin(&self) -> StoreResult<Box<dyn TransactionHandle>> {
        let snapshot = self.lock_state().clone();
        Ok(Box::new(MemTx {
            state: Arc::clone(&self.state),
            snapshot: Some(snapshot),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::AppInfo;

    fn node(ns: &str, name: &str) -> Node {
        Node {
            namespace: ns.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resource_crud_and_versioning() {
        let be = MemBackend::new();
        let created = ResourceStore::<Node>::create(&be, None, node("ns", "n1"))
            .await
            .unwrap();
        assert!(!created.version.is_empty());
        let mut updated = created.clone();
        updated.labels.insert("env".into(), "dev".into());
        let updated = ResourceStore::<Node>::update(&be, None, updated).await.unwrap();
        assert_ne!(updated.version, created.version);
        assert_eq!(
            ResourceStore::<Node>::create(&be, None, node("ns", "n1"))
                .await
                .unwrap_err(),
            StoreError::Conflict("ns/n1 already exists".into())
        );
        ResourceStore::<Node>::delete(&be, None, "ns", "n1").await.unwrap();
        assert_eq!(
            ResourceStore::<Node>::delete(&be, None, "ns", "n1")
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn refresh_index_is_full_replacement() {
        let be = MemBackend::new();
        be.refresh_index(None, "ns", "application", "config", "v", vec!["x".into(), "y".into()])
            .await
            .unwrap();
        be.refresh_index(None, "ns", "application", "config", "v", vec!["z".into()])
            .await
            .unwrap();
        let by_z = be.list_index("ns", "config", "application", "z").await.unwrap();
        assert_eq!(by_z, vec!["v"]);
        let by_x = be.list_index("ns", "config", "application", "x").await.unwrap();
        assert!(by_x.is_empty());
    }

    #[tokio::test]
    async fn lock_excludes_until_unlocked_or_expired() {
        let be = MemBackend::new();
        let lease = be.lock("cron", 60).await.unwrap();
        assert!(matches!(
            be.lock("cron", 60).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            be.unlock("cron", "bogus").await.unwrap_err(),
            StoreError::Conflict(_)
        ));
        be.unlock("cron", &lease).await.unwrap();
        let _again = be.lock("cron", 0).await.unwrap();
        // TTL of zero: an expired lease no longer excludes.
        let _stolen = be.lock("cron", 60).await.unwrap();
    }

    #[tokio::test]
    async fn task_update_rejects_stale_versions() {
        let be = MemBackend::new();
        let task = Task {
            name: "t".into(),
            namespace: "ns".into(),
            registration_name: "r".into(),
            ..Default::default()
        };
        be.create_task(task.clone()).await.unwrap();
        let mut run = task.clone();
        run.version = 1;
        be.update_task(run.clone()).await.unwrap();
        assert!(matches!(
            be.update_task(run).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn transaction_rollback_restores_tables() {
        let be = MemBackend::new();
        ResourceStore::<Node>::create(&be, None, node("ns", "keep"))
            .await
            .unwrap();
        let mut tx = be.begin().unwrap();
        ResourceStore::<Node>::create(&be, None, node("ns", "drop"))
            .await
            .unwrap();
        tx.rollback().unwrap();
        let nodes = ResourceStore::<Node>::list(&be, None, "ns").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "keep");
    }

    #[tokio::test]
    async fn shadow_updates_touch_only_their_document() {
        let be = MemBackend::new();
        ShadowStore::create(&be, Shadow::new("ns", "n1")).await.unwrap();
        let mut with_desire = Shadow::new("ns", "n1");
        with_desire.desire.apps.push(AppInfo::new("a", "1"));
        be.update_desire(with_desire).await.unwrap();
        let mut with_report = Shadow::new("ns", "n1");
        with_report.report.apps.push(AppInfo::new("a", "1"));
        let stored = be.update_report(with_report).await.unwrap();
        assert_eq!(stored.desire.apps.len(), 1);
        assert_eq!(stored.report.apps.len(), 1);
    }
}
