//! Node service: node and shadow lifecycle plus application-to-node
//! rematching.
//!
//! This crate is the sole writer of `Shadow.Desire` on the resource-change
//! path. Desire/report writes merge into the stored document (upsert by app
//! name), so a partial update never drops entries the caller didn't mention.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use muster_core::{
    AppInfo, Application, Document, Error, Node, Result, Shadow, StoreError,
};
use muster_index::IndexService;
use muster_store::{LabelMatcher, ResourceStore, ShadowStore, Tx};
use tracing::{debug, info, warn};

/// A node joined with its current shadow documents.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub node: Node,
    pub desire: Document,
    pub report: Document,
}

/// The outcome of evaluating every application selector against one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rematch {
    pub apps: Vec<AppInfo>,
    pub sysapps: Vec<AppInfo>,
    /// Names of all matched applications, user and system space.
    pub app_names: Vec<String>,
}

#[derive(Clone)]
pub struct NodeService {
    nodes: Arc<dyn ResourceStore<Node>>,
    apps: Arc<dyn ResourceStore<Application>>,
    shadows: Arc<dyn ShadowStore>,
    matcher: Arc<dyn LabelMatcher>,
    index: IndexService,
}

impl NodeService {
    pub fn new(
        nodes: Arc<dyn ResourceStore<Node>>,
        apps: Arc<dyn ResourceStore<Application>>,
        shadows: Arc<dyn ShadowStore>,
        matcher: Arc<dyn LabelMatcher>,
        index: IndexService,
    ) -> Self {
        Self {
            nodes,
            apps,
            shadows,
            matcher,
            index,
        }
    }

    /// Join the stored node with its current shadow.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<NodeView> {
        let node = self
            .nodes
            .get(None, namespace, name)
            .await?
            .ok_or_else(|| Error::from_store(StoreError::NotFound, "node", name))?;
        let shadow = self
            .shadows
            .get(namespace, name)
            .await?
            .unwrap_or_else(|| Shadow::new(namespace, name));
        Ok(NodeView {
            node,
            desire: shadow.desire,
            report: shadow.report,
        })
    }

    /// List nodes in a namespace, optionally filtered by a label selector.
    pub async fn list(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Node>> {
        let nodes = self.nodes.list(None, namespace).await?;
        match selector {
            None => Ok(nodes),
            Some(expr) => {
                let mut out = Vec::new();
                for n in nodes {
                    if self.matcher.is_label_match(expr, &n.labels)? {
                        out.push(n);
                    }
                }
                Ok(out)
            }
        }
    }

    pub async fn create(&self, mut node: Node) -> Result<Node> {
        if node.created_at.is_none() {
            node.created_at = Some(chrono::Utc::now());
        }
        let node = self.nodes.create(None, node).await?;
        self.update_node_and_app_index(None, &node).await?;
        counter!("node_create_total", 1u64);
        info!(ns = %node.namespace, node = %node.name, "node: created");
        Ok(node)
    }

    pub async fn update(&self, node: Node) -> Result<Node> {
        let name = node.name.clone();
        let node = self
            .nodes
            .update(None, node)
            .await
            .map_err(|e| Error::from_store(e, "node", &name))?;
        self.update_node_and_app_index(None, &node).await?;
        info!(ns = %node.namespace, node = %node.name, "node: updated");
        Ok(node)
    }

    /// Delete a node and its shadow. A failed application-index refresh is
    /// logged as recoverable dirty data; a later full-list refresh corrects
    /// the stale entry.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        ResourceStore::<Node>::delete(self.nodes.as_ref(), None, namespace, name)
            .await
            .map_err(|e| Error::from_store(e, "node", name))?;
        if let Err(e) = self.shadows.delete(namespace, name).await {
            if e != StoreError::NotFound {
                warn!(ns = %namespace, node = %name, error = %e, "node: dirty data, shadow not deleted");
            }
        }
        if let Err(e) = self
            .index
            .refresh_app_index_by_node(None, namespace, name, Vec::new())
            .await
        {
            warn!(ns = %namespace, node = %name, error = %e, "node: dirty data, app-node index not cleared");
        }
        info!(ns = %namespace, node = %name, "node: deleted");
        Ok(())
    }

    /// Evaluate every application selector in the namespace against the
    /// node's labels, write the result as the node's new desire, and refresh
    /// the Application↔Node index to exactly the matched set.
    pub async fn update_node_and_app_index(&self, tx: Tx<'_>, node: &Node) -> Result<Vec<String>> {
        let apps = self.apps.list(tx, &node.namespace).await?;
        let matched = self.rematch_applications_for_node(&apps, node)?;
        counter!("node_rematch_total", 1u64);
        debug!(ns = %node.namespace, node = %node.name, apps = matched.app_names.len(), "node: rematched");

        let desire = Document {
            apps: matched.apps.clone(),
            sysapps: matched.sysapps.clone(),
            ..Default::default()
        };
        self.update_desire(&node.namespace, &node.name, &desire).await?;
        self.index
            .refresh_app_index_by_node(tx, &node.namespace, &node.name, matched.app_names.clone())
            .await?;
        Ok(matched.app_names)
    }

    /// Pure selector evaluation, split by the application's system flag.
    pub fn rematch_applications_for_node(
        &self,
        apps: &[Application],
        node: &Node,
    ) -> Result<Rematch> {
        let mut out = Rematch::default();
        for app in apps {
            let expr = match app.selector.as_deref() {
                Some(s) if !s.is_empty() => s,
                _ => continue,
            };
            if !self.matcher.is_label_match(expr, &node.labels)? {
                continue;
            }
            if app.system {
                out.sysapps.push(app.app_info());
            } else {
                out.apps.push(app.app_info());
            }
            out.app_names.push(app.name.clone());
        }
        Ok(out)
    }

    /// Insert-or-replace one application's entry inside every matched node's
    /// existing desire. Returns the matched node names.
    pub async fn update_node_app_version(&self, tx: Tx<'_>, app: &Application) -> Result<Vec<String>> {
        let matched = self.nodes_matching(tx, app).await?;
        for name in &matched {
            let mut shadow = self.shadow_or_create(&app.namespace, name).await?;
            shadow.desire.upsert_app(app.app_info(), app.system);
            self.shadows.update_desire(shadow).await?;
        }
        debug!(ns = %app.namespace, app = %app.name, nodes = matched.len(), "node: app version pushed");
        Ok(matched)
    }

    /// Remove one application's entry from every matched node's desire.
    /// Returns the matched node names.
    pub async fn delete_node_app_version(&self, tx: Tx<'_>, app: &Application) -> Result<Vec<String>> {
        let matched = self.nodes_matching(tx, app).await?;
        for name in &matched {
            let mut shadow = match self.shadows.get(&app.namespace, name).await? {
                Some(s) => s,
                None => continue,
            };
            shadow.desire.remove_app(&app.name);
            self.shadows.update_desire(shadow).await?;
        }
        debug!(ns = %app.namespace, app = %app.name, nodes = matched.len(), "node: app version removed");
        Ok(matched)
    }

    /// Merge a report document into the node's shadow, creating the shadow
    /// on first check-in. Returns the merged shadow.
    pub async fn update_report(&self, namespace: &str, name: &str, report: &Document) -> Result<Shadow> {
        let mut shadow = self.shadow_or_create(namespace, name).await?;
        shadow.report.merge(report);
        let shadow = self.shadows.update_report(shadow).await?;
        Ok(shadow)
    }

    /// Merge a desire document into the node's shadow, creating the shadow
    /// on first write. Returns the merged shadow.
    pub async fn update_desire(&self, namespace: &str, name: &str, desire: &Document) -> Result<Shadow> {
        let mut shadow = self.shadow_or_create(namespace, name).await?;
        shadow.desire.merge(desire);
        let shadow = self.shadows.update_desire(shadow).await?;
        Ok(shadow)
    }

    async fn shadow_or_create(&self, namespace: &str, name: &str) -> Result<Shadow> {
        match self.shadows.get(namespace, name).await? {
            Some(s) => Ok(s),
            None => {
                let s = self.shadows.create(Shadow::new(namespace, name)).await?;
                debug!(ns = %namespace, node = %name, "node: shadow created");
                Ok(s)
            }
        }
    }

    async fn nodes_matching(&self, tx: Tx<'_>, app: &Application) -> Result<Vec<String>> {
        let expr = match app.selector.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(Vec::new()),
        };
        let nodes = self.nodes.list(tx, &app.namespace).await?;
        let mut out = Vec::new();
        for n in nodes {
            if self.matcher.is_label_match(expr, &n.labels)? {
                out.push(n.name);
            }
        }
        Ok(out)
    }

}
