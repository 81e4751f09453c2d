//! Sync service: the edge-facing reconciliation protocol.
//!
//! Inbound reports merge into the node's shadow and come back as the delta
//! the node must still converge to; outbound desire calls resolve versioned
//! resource references to full bodies for delivery. Transport is delegated
//! to a pluggable [`Link`] that routes by method name.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use muster_core::{
    Application, Configuration, Document, Error, Node, ResourceInfo, ResourceKind, ResourceValue,
    Result, Secret, StoreError, SyncMode,
};
use muster_node::NodeService;
use muster_store::ResourceStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Method name for inbound node reports.
pub const METHOD_REPORT: &str = "report";
/// Method name for outbound desire resolution.
pub const METHOD_DESIRE: &str = "desire";

/// Opaque message envelope carried by the sync link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub method: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Pluggable transport performing method-name routing to the sync service.
#[async_trait]
pub trait Link: Send + Sync {
    async fn request(&self, msg: Message) -> Result<Message>;
}

/// Rewrites embedded object placeholders in configuration bodies into
/// short-lived signed URLs before transmission.
#[async_trait]
pub trait ObjectPopulator: Send + Sync {
    async fn populate(&self, config: &mut Configuration) -> Result<()>;
}

/// Pass-through populator for deployments without object storage.
pub struct NoopPopulator;

#[async_trait]
impl ObjectPopulator for NoopPopulator {
    async fn populate(&self, _config: &mut Configuration) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SyncService {
    nodes: Arc<dyn ResourceStore<Node>>,
    apps: Arc<dyn ResourceStore<Application>>,
    configs: Arc<dyn ResourceStore<Configuration>>,
    secrets: Arc<dyn ResourceStore<Secret>>,
    node_service: NodeService,
    populator: Arc<dyn ObjectPopulator>,
}

impl SyncService {
    pub fn new(
        nodes: Arc<dyn ResourceStore<Node>>,
        apps: Arc<dyn ResourceStore<Application>>,
        configs: Arc<dyn ResourceStore<Configuration>>,
        secrets: Arc<dyn ResourceStore<Secret>>,
        node_service: NodeService,
        populator: Arc<dyn ObjectPopulator>,
    ) -> Self {
        Self {
            nodes,
            apps,
            configs,
            secrets,
            node_service,
            populator,
        }
    }

    /// Merge an inbound report and compute the delta the node must still
    /// converge to.
    ///
    /// Sync is gated until node bootstrap has produced an initial desired
    /// state: a desire without a single system application refuses with
    /// `NodeNotReady`. Self-managed (`SyncMode::Local`) nodes get an empty
    /// delta and no diff.
    pub async fn report(&self, namespace: &str, name: &str, report: &Document) -> Result<Document> {
        counter!("sync_report_total", 1u64);
        let shadow = self.node_service.update_report(namespace, name, report).await?;
        let node = self
            .nodes
            .get(None, namespace, name)
            .await?
            .ok_or_else(|| Error::from_store(StoreError::NotFound, "node", name))?;
        if node.sync_mode == SyncMode::Local {
            debug!(ns = %namespace, node = %name, "sync: local node, no delta");
            return Ok(Document::default());
        }
        if shadow.desire.sysapps.is_empty() {
            return Err(Error::NodeNotReady {
                name: name.to_string(),
            });
        }
        let delta = shadow.desire.diff(&shadow.report.comparable());
        debug!(ns = %namespace, node = %name,
            apps = delta.apps.len(), sysapps = delta.sysapps.len(), "sync: delta computed");
        Ok(delta)
    }

    /// Resolve a batch of versioned references to their current full bodies.
    /// Configuration bodies pass through the object-reference populator.
    pub async fn desire(
        &self,
        namespace: &str,
        infos: &[ResourceInfo],
        _metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceValue>> {
        counter!("sync_desire_total", 1u64);
        let mut out = Vec::with_capacity(infos.len());
        for info in infos {
            let value = match info.kind {
                ResourceKind::Application => {
                    let app = self
                        .apps
                        .get(None, namespace, &info.name)
                        .await?
                        .ok_or_else(|| Error::from_store(StoreError::NotFound, "application", &info.name))?;
                    ResourceValue::Application(app)
                }
                ResourceKind::Configuration => {
                    let mut cfg = self
                        .configs
                        .get(None, namespace, &info.name)
                        .await?
                        .ok_or_else(|| Error::from_store(StoreError::NotFound, "configuration", &info.name))?;
                    self.populator.populate(&mut cfg).await?;
                    ResourceValue::Configuration(cfg)
                }
                ResourceKind::Secret => {
                    let sec = self
                        .secrets
                        .get(None, namespace, &info.name)
                        .await?
                        .ok_or_else(|| Error::from_store(StoreError::NotFound, "secret", &info.name))?;
                    ResourceValue::Secret(sec)
                }
                ResourceKind::Node => {
                    return Err(Error::InvalidMessage(
                        "node references are not resolvable".into(),
                    ))
                }
            };
            out.push(value);
        }
        info!(ns = %namespace, resolved = out.len(), "sync: desire resolved");
        Ok(out)
    }

    /// Method-name routing for the wire protocol: `report` and `desire`
    /// envelopes dispatch to the functions above.
    pub async fn handle(&self, msg: Message) -> Result<Message> {
        let namespace = msg
            .metadata
            .get("namespace")
            .ok_or_else(|| Error::InvalidMessage("missing namespace metadata".into()))?
            .clone();
        match msg.method.as_str() {
            METHOD_REPORT => {
                let name = msg
                    .metadata
                    .get("name")
                    .ok_or_else(|| Error::InvalidMessage("missing name metadata".into()))?;
                let report: Document = serde_json::from_value(msg.content)
                    .map_err(|e| Error::InvalidMessage(e.to_string()))?;
                let delta = self.report(&namespace, name, &report).await?;
                Ok(Message {
                    method: METHOD_REPORT.into(),
                    metadata: msg.metadata.clone(),
                    content: serde_json::to_value(delta)
                        .map_err(|e| Error::InvalidMessage(e.to_string()))?,
                })
            }
            METHOD_DESIRE => {
                let infos: Vec<ResourceInfo> = serde_json::from_value(msg.content)
                    .map_err(|e| Error::InvalidMessage(e.to_string()))?;
                let values = self.desire(&namespace, &infos, &msg.metadata).await?;
                Ok(Message {
                    method: METHOD_DESIRE.into(),
                    metadata: msg.metadata.clone(),
                    content: serde_json::to_value(values)
                        .map_err(|e| Error::InvalidMessage(e.to_string()))?,
                })
            }
            other => Err(Error::InvalidMessage(format!("unknown method {}", other))),
        }
    }
}

/// In-process link calling the sync service directly; remote transports
/// implement [`Link`] the same way.
pub struct InProcLink {
    sync: SyncService,
}

impl InProcLink {
    pub fn new(sync: SyncService) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl Link for InProcLink {
    async fn request(&self, msg: Message) -> Result<Message> {
        self.sync.handle(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::AppInfo;
    use muster_index::IndexService;
    use muster_store::MemBackend;

    fn sync_over(be: &MemBackend) -> SyncService {
        let be = Arc::new(be.clone());
        let node_service = NodeService::new(
            be.clone(),
            be.clone(),
            be.clone(),
            be.clone(),
            IndexService::new(be.clone()),
        );
        SyncService::new(
            be.clone(),
            be.clone(),
            be.clone(),
            be.clone(),
            node_service,
            Arc::new(NoopPopulator),
        )
    }

    async fn seed_node(be: &MemBackend, sync_mode: SyncMode) {
        ResourceStore::<Node>::create(
            be,
            None,
            Node {
                namespace: "ns".into(),
                name: "n1".into(),
                sync_mode,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    fn report_doc(apps: &[(&str, &str)]) -> Document {
        Document {
            apps: apps.iter().map(|(n, v)| AppInfo::new(*n, *v)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_checkin_creates_shadow_then_gates_on_sysapps() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        seed_node(&be, SyncMode::Online).await;

        let err = svc.report("ns", "n1", &report_doc(&[])).await.unwrap_err();
        assert_eq!(err, Error::NodeNotReady { name: "n1".into() });

        // Bootstrap produces an initial desired state; sync proceeds.
        svc.node_service
            .update_desire(
                "ns",
                "n1",
                &Document {
                    sysapps: vec![AppInfo::new("core", "1")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let delta = svc.report("ns", "n1", &report_doc(&[])).await.unwrap();
        assert_eq!(delta.sysapps, vec![AppInfo::new("core", "1")]);
    }

    #[tokio::test]
    async fn matching_report_yields_empty_delta() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        seed_node(&be, SyncMode::Online).await;
        svc.node_service
            .update_desire(
                "ns",
                "n1",
                &Document {
                    apps: vec![AppInfo::new("a", "1")],
                    sysapps: vec![AppInfo::new("core", "1")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut report = report_doc(&[("a", "1")]);
        report.sysapps = vec![AppInfo::new("core", "1")];
        let delta = svc.report("ns", "n1", &report).await.unwrap();
        assert!(delta.apps.is_empty());
        assert!(delta.sysapps.is_empty());
    }

    #[tokio::test]
    async fn telemetry_in_report_does_not_enter_the_diff() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        seed_node(&be, SyncMode::Online).await;
        svc.node_service
            .update_desire(
                "ns",
                "n1",
                &Document {
                    sysapps: vec![AppInfo::new("core", "1")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut report = Document {
            sysapps: vec![AppInfo::new("core", "1")],
            ..Default::default()
        };
        report
            .ext
            .insert("telemetry".into(), serde_json::json!({"cpu": 0.9}));
        let delta = svc.report("ns", "n1", &report).await.unwrap();
        assert!(delta.sysapps.is_empty());
    }

    #[tokio::test]
    async fn local_nodes_receive_no_delta() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        seed_node(&be, SyncMode::Local).await;
        let delta = svc.report("ns", "n1", &report_doc(&[("a", "1")])).await.unwrap();
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn desire_resolves_current_bodies() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        ResourceStore::<Configuration>::create(
            &be,
            None,
            Configuration {
                namespace: "ns".into(),
                name: "conf".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let infos = vec![ResourceInfo {
            kind: ResourceKind::Configuration,
            name: "conf".into(),
            version: "1".into(),
        }];
        let values = svc.desire("ns", &infos, &BTreeMap::new()).await.unwrap();
        assert!(matches!(&values[0], ResourceValue::Configuration(c) if c.name == "conf"));

        let missing = vec![ResourceInfo {
            kind: ResourceKind::Secret,
            name: "ghost".into(),
            version: "1".into(),
        }];
        let err = svc.desire("ns", &missing, &BTreeMap::new()).await.unwrap_err();
        assert_eq!(
            err,
            Error::ResourceNotFound {
                kind: "secret".into(),
                name: "ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn link_routes_by_method_name() {
        let be = MemBackend::new();
        let svc = sync_over(&be);
        seed_node(&be, SyncMode::Online).await;
        svc.node_service
            .update_desire(
                "ns",
                "n1",
                &Document {
                    sysapps: vec![AppInfo::new("core", "2")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let link = InProcLink::new(svc);

        let mut metadata = BTreeMap::new();
        metadata.insert("namespace".to_string(), "ns".to_string());
        metadata.insert("name".to_string(), "n1".to_string());
        let resp = link
            .request(Message {
                method: METHOD_REPORT.into(),
                metadata: metadata.clone(),
                content: serde_json::json!({}),
            })
            .await
            .unwrap();
        let delta: Document = serde_json::from_value(resp.content).unwrap();
        assert_eq!(delta.sysapps, vec![AppInfo::new("core", "2")]);

        let err = link
            .request(Message {
                method: "bogus".into(),
                metadata,
                content: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }
}
