//! Fleet resource models: nodes, applications, configurations, secrets, tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Generated function-config resources carry this prefix so the facade can
/// recognize and garbage-collect them.
pub const FUNCTION_CONFIG_PREFIX: &str = "muster-function-";

/// How a node expects its desired state to be managed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Cloud-managed: deltas are computed and pushed back on report.
    #[default]
    Online,
    /// Self-managed: the node never receives cloud-pushed desired state.
    Local,
}

/// An edge node, identified by (namespace, name). Owns exactly one shadow
/// with the same identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free-form attributes reported at registration time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A reference to a specific application version assigned to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Where a volume gets its content from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSource {
    Config {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Secret {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Plain host path; carries no cloud resource reference.
    HostPath { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// One service (container) of an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Whether a delayed application's schedule has run out yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    #[default]
    Pending,
    Finished,
}

/// Delayed-stop schedule carried by an application. The expiry cron flips
/// `status` to `Finished` once `at` has passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub status: ScheduleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub namespace: String,
    pub name: String,
    pub version: String,
    /// Label-selector expression matching this application to nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// System applications land in the `sysapps` desire list.
    #[serde(default)]
    pub system: bool,
    /// Function applications get generated function configs.
    #[serde(default)]
    pub is_function: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Application {
    pub fn app_info(&self) -> AppInfo {
        AppInfo::new(self.name.clone(), self.version.clone())
    }

    /// Names of configurations referenced by this application's volumes.
    pub fn config_refs(&self) -> Vec<String> {
        self.volumes
            .iter()
            .filter_map(|v| match &v.source {
                VolumeSource::Config { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of secrets referenced by this application's volumes.
    pub fn secret_refs(&self) -> Vec<String> {
        self.volumes
            .iter()
            .filter_map(|v| match &v.source {
                VolumeSource::Secret { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Name-uniqueness and mount-reference validation, enforced before any
    /// mutation is attempted.
    pub fn validate(&self) -> Result<()> {
        let mut volume_names = std::collections::BTreeSet::new();
        for v in &self.volumes {
            if !volume_names.insert(v.name.as_str()) {
                return Err(Error::AppNameConflict(v.name.clone()));
            }
        }
        let mut service_names = std::collections::BTreeSet::new();
        for s in &self.services {
            if !service_names.insert(s.name.as_str()) {
                return Err(Error::AppNameConflict(s.name.clone()));
            }
            for m in &s.volume_mounts {
                if !volume_names.contains(m.name.as_str()) {
                    return Err(Error::VolumeNotFoundWhenMount(m.name.clone()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Values may embed `object://` placeholders rewritten before delivery.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
}

/// Resource kinds participating in sync resolution and index relations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Node,
    Application,
    Configuration,
    Secret,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Node => "node",
            ResourceKind::Application => "application",
            ResourceKind::Configuration => "configuration",
            ResourceKind::Secret => "secret",
        };
        f.write_str(s)
    }
}

/// A versioned reference resolved by the sync service's desire call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    pub name: String,
    pub version: String,
}

/// Full resource body delivered to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ResourceValue {
    Application(Application),
    Configuration(Configuration),
    Secret(Secret),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    NeedRetry,
    Finished,
}

/// A named unit of asynchronous cleanup work composed of an ordered list of
/// independently retryable processor steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub name: String,
    pub namespace: String,
    /// Which processor list executes this task.
    pub registration_name: String,
    pub resource_type: String,
    pub resource_name: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub processors_status: BTreeMap<String, TaskStatus>,
    /// Incremented after every run for optimistic-concurrency storage.
    #[serde(default)]
    pub version: u64,
}

/// One row of the scheduled-application expiry table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpiryRecord {
    pub namespace: String,
    /// Application name whose schedule has run out.
    pub name: String,
    pub expired_at: DateTime<Utc>,
}
