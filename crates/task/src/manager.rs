//! Task manager: fetch loop, dispatch loop, and per-task workers.
//!
//! State machine per task: `Pending -> (NeedRetry <-> running) -> Finished`.
//! The fetch loop polls storage on a fixed interval and feeds a bounded
//! queue; the dispatch loop pulls from the queue and runs one worker per
//! task, bounded by a counting semaphore. No ordering is guaranteed between
//! tasks; within one task, processors run strictly in registration order and
//! a failure halts the rest of that run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use metrics::counter;
use muster_core::{Error, Result, StoreError, Task, TaskStatus};
use muster_store::TaskStore;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TaskConfig;
use crate::registry::Registry;

type Key = (String, String);

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<Registry>,
    config: TaskConfig,
}

/// Stops the fetch loop on shutdown. In-flight workers finish on their own;
/// no draining guarantee is made.
pub struct TaskManagerHandle {
    close: watch::Sender<bool>,
    fetch: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl TaskManagerHandle {
    pub async fn shutdown(self) {
        let _ = self.close.send(true);
        let _ = self.fetch.await;
        let _ = self.dispatch.await;
        info!("task: manager stopped");
    }
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<Registry>, config: TaskConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn start(self: Arc<Self>) -> TaskManagerHandle {
        let (close_tx, close_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel::<Task>(self.config.queue_cap);
        let fetch = tokio::spawn(self.clone().fetch_loop(queue_tx, close_rx));
        let dispatch = tokio::spawn(self.dispatch_loop(queue_rx));
        TaskManagerHandle {
            close: close_tx,
            fetch,
            dispatch,
        }
    }

    async fn fetch_loop(self: Arc<Self>, queue: mpsc::Sender<Task>, mut close: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.fetch_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = close.changed() => break,
            }
            let batch = match self.store.tasks_need_process(self.config.queue_cap).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "task: fetch failed");
                    continue;
                }
            };
            for task in batch {
                // Receiver gone means the manager is shutting down.
                if queue.send(task).await.is_err() {
                    return;
                }
            }
        }
        debug!("task: fetch loop stopped");
    }

    async fn dispatch_loop(self: Arc<Self>, mut queue: mpsc::Receiver<Task>) {
        let limiter = Arc::new(Semaphore::new(self.config.concurrency));
        let in_flight: Arc<Mutex<HashSet<Key>>> = Arc::new(Mutex::new(HashSet::new()));
        while let Some(task) = queue.recv().await {
            let key = (task.namespace.clone(), task.name.clone());
            {
                let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                // Already running from an earlier fetch cycle.
                if !set.insert(key.clone()) {
                    continue;
                }
            }
            let permit = match limiter.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let mgr = self.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                if let Err(e) = mgr.run_task(task).await {
                    warn!(ns = %key.0, task = %key.1, error = %e, "task: run failed");
                }
                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                drop(permit);
            });
        }
        debug!("task: dispatch loop stopped");
    }

    /// One run of one task: every processor not already `Finished`, in
    /// registration order, halting on the first failure. The task version is
    /// bumped and persisted after every run; losing the optimistic write race
    /// means another instance handled it, which is not an error.
    pub async fn run_task(&self, mut task: Task) -> Result<()> {
        let procs = self
            .registry
            .processor_list(&task.registration_name)
            .ok_or_else(|| Error::ProcessNotExist(task.registration_name.clone()))?;
        counter!("task_runs_total", 1u64);

        let mut halted = false;
        for (name, step) in procs {
            if task.processors_status.get(&name) == Some(&TaskStatus::Finished) {
                continue;
            }
            match step.process(&task).await {
                Ok(()) => {
                    task.processors_status.insert(name, TaskStatus::Finished);
                }
                Err(e) => {
                    warn!(
                        ns = %task.namespace, task = %task.name, processor = %name, error = %e,
                        "task: processor failed, will retry"
                    );
                    task.processors_status.insert(name, TaskStatus::NeedRetry);
                    task.status = TaskStatus::NeedRetry;
                    counter!("task_retry_total", 1u64);
                    halted = true;
                    break;
                }
            }
        }
        if !halted {
            task.status = TaskStatus::Finished;
            counter!("task_finished_total", 1u64);
            info!(ns = %task.namespace, task = %task.name, "task: finished");
        }

        task.version += 1;
        match self.store.update_task(task).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(reason)) => {
                debug!(%reason, "task: lost update race, dropping run");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use muster_store::MemBackend;

    use super::*;
    use crate::registry::Processor;

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Counting {
        async fn process(&self, _task: &Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::NeedRetry)
            } else {
                Ok(())
            }
        }
    }

    fn task(name: &str, registration: &str) -> Task {
        Task {
            name: name.into(),
            namespace: "ns".into(),
            registration_name: registration.into(),
            resource_type: "namespace".into(),
            resource_name: "ns".into(),
            ..Default::default()
        }
    }

    fn manager(be: &Arc<MemBackend>, registry: Arc<Registry>, config: TaskConfig) -> Arc<TaskManager> {
        Arc::new(TaskManager::new(be.clone(), registry, config))
    }

    #[tokio::test]
    async fn failed_processor_halts_the_run_and_later_runs_skip_finished() {
        let be = Arc::new(MemBackend::new());
        let registry = Arc::new(Registry::new());
        let p1_calls = Arc::new(AtomicUsize::new(0));
        let p2_calls = Arc::new(AtomicUsize::new(0));
        let p3_calls = Arc::new(AtomicUsize::new(0));
        registry
            .register("teardown", "p1", Arc::new(Counting { calls: p1_calls.clone(), fail: false }))
            .unwrap();
        registry
            .register("teardown", "p2", Arc::new(Counting { calls: p2_calls.clone(), fail: true }))
            .unwrap();
        registry
            .register("teardown", "p3", Arc::new(Counting { calls: p3_calls.clone(), fail: false }))
            .unwrap();
        let mgr = manager(&be, registry, TaskConfig::default());

        let created = be.create_task(task("t1", "teardown")).await.unwrap();
        mgr.run_task(created).await.unwrap();

        let stored = be.get_task("ns", "t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::NeedRetry);
        assert_eq!(stored.processors_status["p1"], TaskStatus::Finished);
        assert_eq!(stored.processors_status["p2"], TaskStatus::NeedRetry);
        assert!(!stored.processors_status.contains_key("p3"));
        assert_eq!(p3_calls.load(Ordering::SeqCst), 0);

        // Second run resumes at p2; p1 is not re-invoked.
        mgr.run_task(stored).await.unwrap();
        assert_eq!(p1_calls.load(Ordering::SeqCst), 1);
        assert_eq!(p2_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn successful_run_finishes_task_and_bumps_version() {
        let be = Arc::new(MemBackend::new());
        let registry = Arc::new(Registry::new());
        registry
            .register("teardown", "only", Arc::new(Counting { calls: Arc::new(AtomicUsize::new(0)), fail: false }))
            .unwrap();
        let mgr = manager(&be, registry, TaskConfig::default());

        let created = be.create_task(task("t1", "teardown")).await.unwrap();
        mgr.run_task(created).await.unwrap();
        let stored = be.get_task("ns", "t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Finished);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn unknown_registration_is_a_typed_error() {
        let be = Arc::new(MemBackend::new());
        let mgr = manager(&be, Arc::new(Registry::new()), TaskConfig::default());
        let err = mgr.run_task(task("t1", "ghost")).await.unwrap_err();
        assert_eq!(err, Error::ProcessNotExist("ghost".into()));
    }

    struct Slow {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _task: &Task) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_is_bounded_by_the_semaphore() {
        let be = Arc::new(MemBackend::new());
        let registry = Arc::new(Registry::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        registry
            .register("teardown", "slow", Arc::new(Slow { running: running.clone(), peak: peak.clone() }))
            .unwrap();
        for i in 0..6 {
            be.create_task(task(&format!("t{i}"), "teardown")).await.unwrap();
        }
        let config = TaskConfig {
            concurrency: 2,
            fetch_interval: Duration::from_millis(20),
            ..TaskConfig::default()
        };
        let handle = manager(&be, registry, config).start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        for i in 0..6 {
            let stored = be.get_task("ns", &format!("t{i}")).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Finished, "t{i} not finished");
        }
    }
}
