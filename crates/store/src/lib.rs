//! Storage plugin contracts consumed by the engine, plus the in-memory
//! backend used by tests and single-process deployments.
//!
//! Backends return classified [`StoreError`]s; the engine never matches on
//! backend message strings. Write methods accept an optional opaque
//! transaction handle owned by the backend; the engine only begins,
//! commits, or rolls it back.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use muster_core::{
    Application, Configuration, ExpiryRecord, Node, Secret, Shadow, StoreError, Task,
};

pub mod memory;

pub use memory::MemBackend;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backend-owned transaction. The engine never inspects its contents; it
/// only commits on success or rolls back on error/unwind.
pub trait TransactionHandle: Send + Sync {
    fn commit(&mut self) -> StoreResult<()>;
    fn rollback(&mut self) -> StoreResult<()>;
}

pub trait TransactionFactory: Send + Sync {
    fn begin(&self) -> StoreResult<Box<dyn TransactionHandle>>;
}

/// Optional transaction parameter passed to write methods.
pub type Tx<'a> = Option<&'a dyn TransactionHandle>;

/// Standard per-kind resource storage. Implemented once per resource type by
/// each backend.
#[async_trait]
pub trait ResourceStore<T>: Send + Sync {
    async fn get(&self, tx: Tx<'_>, namespace: &str, name: &str) -> StoreResult<Option<T>>;
    async fn create(&self, tx: Tx<'_>, value: T) -> StoreResult<T>;
    async fn update(&self, tx: Tx<'_>, value: T) -> StoreResult<T>;
    async fn delete(&self, tx: Tx<'_>, namespace: &str, name: &str) -> StoreResult<()>;
    async fn list(&self, tx: Tx<'_>, namespace: &str) -> StoreResult<Vec<T>>;
}

/// Label-predicate capability, polymorphic over the backend's selector
/// syntax.
pub trait LabelMatcher: Send + Sync {
    fn is_label_match(
        &self,
        selector: &str,
        labels: &BTreeMap<String, String>,
    ) -> muster_core::Result<bool>;
}

/// Shadow document persistence.
#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Shadow>>;
    async fn create(&self, shadow: Shadow) -> StoreResult<Shadow>;
    async fn list(&self, namespace: &str) -> StoreResult<Vec<Shadow>>;
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn update_desire(&self, shadow: Shadow) -> StoreResult<Shadow>;
    async fn update_report(&self, shadow: Shadow) -> StoreResult<Shadow>;
}

/// Bidirectional relation storage between two resource kinds.
///
/// `refresh_index` is a full replacement of the set stored under
/// `(namespace, kind_a, kind_b, value_a)`; conceptually it stores one
/// relation pair per B-value. `list_index` walks those pairs from either
/// side: given a `value` of `kind`, it returns every related value of
/// `wanted_kind`.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn refresh_index(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        kind_a: &str,
        kind_b: &str,
        value_a: &str,
        value_bs: Vec<String>,
    ) -> StoreResult<()>;

    async fn list_index(
        &self,
        namespace: &str,
        kind: &str,
        wanted_kind: &str,
        value: &str,
    ) -> StoreResult<Vec<String>>;
}

/// Distributed mutual exclusion for cron jobs and task-namespace
/// exclusivity. `lock` returns an opaque lease token that must be presented
/// to `unlock`.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, name: &str, ttl_secs: u64) -> StoreResult<String>;
    async fn unlock(&self, name: &str, lease: &str) -> StoreResult<()>;
}

/// Task persistence consumed by the task manager and submitters.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> StoreResult<Task>;
    async fn get_task(&self, namespace: &str, name: &str) -> StoreResult<Option<Task>>;
    /// Tasks whose status is not yet `Finished`, oldest first.
    async fn tasks_need_process(&self, limit: usize) -> StoreResult<Vec<Task>>;
    /// Persist a task run; the stored version must match `task.version` or
    /// the update is rejected with `Conflict` (optimistic concurrency).
    async fn update_task(&self, task: Task) -> StoreResult<Task>;
    async fn delete_task(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// The scheduled-application expiry table driven by the cron job.
#[async_trait]
pub trait ExpiryStore: Send + Sync {
    async fn add_expiry(&self, record: ExpiryRecord) -> StoreResult<()>;
    async fn list_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<Vec<ExpiryRecord>>;
    async fn delete_expiry(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Everything a full backend provides; the engine takes narrower views.
pub trait Backend:
    ResourceStore<Node>
    + ResourceStore<Application>
    + ResourceStore<Configuration>
    + ResourceStore<Secret>
    + ShadowStore
    + IndexStore
    + TaskStore
    + ExpiryStore
    + Locker
    + LabelMatcher
    + TransactionFactory
{
}

impl<T> Backend for T where
    T: ResourceStore<Node>
        + ResourceStore<Application>
        + ResourceStore<Configuration>
        + ResourceStore<Secret>
        + ShadowStore
        + IndexStore
        + TaskStore
        + ExpiryStore
        + Locker
        + LabelMatcher
        + TransactionFactory
{
}
