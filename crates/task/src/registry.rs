//! Processor registry: RegistrationName to an ordered list of named
//! processors.
//!
//! Populated once during startup by every subsystem that wants cleanup work
//! done, then read by the task manager. An explicit handle, passed to whoever
//! needs it; there is no process-global.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use muster_core::{Error, Result, Task};

/// One step of a task. Steps are retried across runs, so implementations
/// must be idempotent or safely re-entrant.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<()>;
}

type ProcessorList = Vec<(String, Arc<dyn Processor>)>;

#[derive(Default)]
pub struct Registry {
    inner: Mutex<BTreeMap<String, ProcessorList>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor to the registration's ordered list. Fails with
    /// `ProcessConflict` if that processor name is already registered there.
    pub fn register(
        &self,
        registration: &str,
        processor: &str,
        step: Arc<dyn Processor>,
    ) -> Result<()> {
        let mut inner = self.lock_inner();
        let list = inner.entry(registration.to_string()).or_default();
        if list.iter().any(|(name, _)| name == processor) {
            return Err(Error::ProcessConflict {
                registration: registration.to_string(),
                processor: processor.to_string(),
            });
        }
        list.push((processor.to_string(), step));
        Ok(())
    }

    pub fn unregister(&self, registration: &str, processor: &str) -> Result<()> {
        let mut inner = self.lock_inner();
        let list = inner
            .get_mut(registration)
            .ok_or_else(|| Error::ProcessNotExist(registration.to_string()))?;
        let before = list.len();
        list.retain(|(name, _)| name != processor);
        if list.len() == before {
            return Err(Error::ProcessNotExist(processor.to_string()));
        }
        Ok(())
    }

    /// The ordered processor list for a registration, or `None` if nothing
    /// has been registered under that name.
    pub fn processor_list(&self, registration: &str) -> Option<ProcessorList> {
        self.lock_inner().get(registration).cloned()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ProcessorList>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
