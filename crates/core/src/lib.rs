//! Muster core types: fleet resources, shadow documents, and errors.

#![forbid(unsafe_code)]

pub mod error;
pub mod models;
pub mod selector;
pub mod shadow;

pub use error::{Error, Result, StoreError};
pub use models::{
    AppInfo, Application, Configuration, ExpiryRecord, Namespace, Node, ResourceInfo,
    ResourceKind, ResourceValue, Schedule, ScheduleStatus, Secret, Service, SyncMode, Task,
    TaskStatus, Volume, VolumeMount, VolumeSource, FUNCTION_CONFIG_PREFIX,
};
pub use selector::Selector;
pub use shadow::{Document, Shadow};
