//! Index service: a generic bidirectional relation store between resource
//! kinds, plus thin named wrappers for the relations the engine maintains
//! (Application↔Config, Application↔Secret, Application↔Node).
//!
//! A refresh is a full replacement of the related set for one left-hand
//! value; storage errors propagate verbatim and retry is the caller's job.

#![forbid(unsafe_code)]

use std::sync::Arc;

use muster_core::{Result, ResourceKind};
use muster_store::{IndexStore, Tx};
use tracing::debug;

#[derive(Clone)]
pub struct IndexService {
    store: Arc<dyn IndexStore>,
}

impl IndexService {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    /// Replace the full set of B-values related to `value_a` under the
    /// (kind_a, kind_b) relation.
    pub async fn refresh_index(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        kind_a: ResourceKind,
        kind_b: ResourceKind,
        value_a: &str,
        value_bs: Vec<String>,
    ) -> Result<()> {
        debug!(ns = %namespace, %kind_a, %kind_b, value = %value_a, count = value_bs.len(), "index: refresh");
        self.store
            .refresh_index(
                tx,
                namespace,
                &kind_a.to_string(),
                &kind_b.to_string(),
                value_a,
                value_bs,
            )
            .await?;
        Ok(())
    }

    /// Every `wanted_kind` value related to the given `value` of `kind`,
    /// walked from either side of the stored relation.
    pub async fn list_index(
        &self,
        namespace: &str,
        kind: ResourceKind,
        wanted_kind: ResourceKind,
        value: &str,
    ) -> Result<Vec<String>> {
        let out = self
            .store
            .list_index(namespace, &kind.to_string(), &wanted_kind.to_string(), value)
            .await?;
        Ok(out)
    }

    pub async fn refresh_config_index_by_app(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        app: &str,
        configs: Vec<String>,
    ) -> Result<()> {
        self.refresh_index(
            tx,
            namespace,
            ResourceKind::Application,
            ResourceKind::Configuration,
            app,
            configs,
        )
        .await
    }

    pub async fn refresh_secret_index_by_app(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        app: &str,
        secrets: Vec<String>,
    ) -> Result<()> {
        self.refresh_index(
            tx,
            namespace,
            ResourceKind::Application,
            ResourceKind::Secret,
            app,
            secrets,
        )
        .await
    }

    pub async fn refresh_node_index_by_app(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        app: &str,
        nodes: Vec<String>,
    ) -> Result<()> {
        self.refresh_index(
            tx,
            namespace,
            ResourceKind::Application,
            ResourceKind::Node,
            app,
            nodes,
        )
        .await
    }

    /// Make the set of applications assigned to one node exactly `apps`
    /// (the node-side write of the Application↔Node relation, used by
    /// rematching).
    ///
    /// The relation is stored canonically under per-application keys, so
    /// this rewrites each affected application's node set instead of
    /// introducing a second, node-keyed copy of the relation.
    pub async fn refresh_app_index_by_node(
        &self,
        tx: Tx<'_>,
        namespace: &str,
        node: &str,
        apps: Vec<String>,
    ) -> Result<()> {
        let current = self.list_app_index_by_node(namespace, node).await?;
        for app in current.iter().filter(|a| !apps.contains(*a)) {
            let mut nodes = self.list_node_index_by_app(namespace, app).await?;
            nodes.retain(|n| n != node);
            self.refresh_node_index_by_app(tx, namespace, app, nodes).await?;
        }
        for app in &apps {
            let mut nodes = self.list_node_index_by_app(namespace, app).await?;
            if !nodes.iter().any(|n| n == node) {
                nodes.push(node.to_string());
                self.refresh_node_index_by_app(tx, namespace, app, nodes).await?;
            }
        }
        Ok(())
    }

    /// Applications whose volumes reference the given configuration.
    pub async fn list_app_index_by_config(&self, namespace: &str, config: &str) -> Result<Vec<String>> {
        self.list_index(
            namespace,
            ResourceKind::Configuration,
            ResourceKind::Application,
            config,
        )
        .await
    }

    /// Applications whose volumes reference the given secret.
    pub async fn list_app_index_by_secret(&self, namespace: &str, secret: &str) -> Result<Vec<String>> {
        self.list_index(
            namespace,
            ResourceKind::Secret,
            ResourceKind::Application,
            secret,
        )
        .await
    }

    /// Applications currently assigned to the given node.
    pub async fn list_app_index_by_node(&self, namespace: &str, node: &str) -> Result<Vec<String>> {
        self.list_index(
            namespace,
            ResourceKind::Node,
            ResourceKind::Application,
            node,
        )
        .await
    }

    /// Nodes the given application is currently assigned to.
    pub async fn list_node_index_by_app(&self, namespace: &str, app: &str) -> Result<Vec<String>> {
        self.list_index(
            namespace,
            ResourceKind::Application,
            ResourceKind::Node,
            app,
        )
        .await
    }
}
