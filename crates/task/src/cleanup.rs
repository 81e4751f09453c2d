//! Namespace teardown processors. Registered once at startup; a namespace
//! deletion is submitted as a task named after the namespace and the manager
//! works through these steps in order, retrying failed steps on later runs.
//!
//! Order matters: applications go first so that configurations and secrets
//! are no longer referenced when their turn comes.

use std::sync::Arc;

use async_trait::async_trait;
use muster_core::{Result, Task};
use muster_facade::Facade;
use muster_node::NodeService;
use tracing::info;

use crate::registry::{Processor, Registry};

/// Registration name for namespace teardown tasks.
pub const NAMESPACE_DELETION: &str = "namespace-deletion";

struct AppCleanup {
    facade: Facade,
}

#[async_trait]
impl Processor for AppCleanup {
    async fn process(&self, task: &Task) -> Result<()> {
        let apps = self.facade.list_applications(&task.namespace).await?;
        for app in apps {
            self.facade.delete_application(&task.namespace, &app.name).await?;
        }
        info!(ns = %task.namespace, "cleanup: applications removed");
        Ok(())
    }
}

struct ConfigCleanup {
    facade: Facade,
}

#[async_trait]
impl Processor for ConfigCleanup {
    async fn process(&self, task: &Task) -> Result<()> {
        let configs = self.facade.list_configurations(&task.namespace).await?;
        for cfg in configs {
            self.facade.delete_configuration(&task.namespace, &cfg.name).await?;
        }
        info!(ns = %task.namespace, "cleanup: configurations removed");
        Ok(())
    }
}

struct SecretCleanup {
    facade: Facade,
}

#[async_trait]
impl Processor for SecretCleanup {
    async fn process(&self, task: &Task) -> Result<()> {
        let secrets = self.facade.list_secrets(&task.namespace).await?;
        for secret in secrets {
            self.facade.delete_secret(&task.namespace, &secret.name).await?;
        }
        info!(ns = %task.namespace, "cleanup: secrets removed");
        Ok(())
    }
}

struct NodeCleanup {
    nodes: NodeService,
}

#[async_trait]
impl Processor for NodeCleanup {
    async fn process(&self, task: &Task) -> Result<()> {
        let nodes = self.nodes.list(&task.namespace, None).await?;
        for node in nodes {
            self.nodes.delete(&task.namespace, &node.name).await?;
        }
        info!(ns = %task.namespace, "cleanup: nodes removed");
        Ok(())
    }
}

/// Register the namespace teardown chain under [`NAMESPACE_DELETION`].
pub fn register_namespace_cleanup(
    registry: &Registry,
    facade: Facade,
    nodes: NodeService,
) -> Result<()> {
    registry.register(
        NAMESPACE_DELETION,
        "applications",
        Arc::new(AppCleanup { facade: facade.clone() }),
    )?;
    registry.register(
        NAMESPACE_DELETION,
        "configurations",
        Arc::new(ConfigCleanup { facade: facade.clone() }),
    )?;
    registry.register(
        NAMESPACE_DELETION,
        "secrets",
        Arc::new(SecretCleanup { facade }),
    )?;
    registry.register(NAMESPACE_DELETION, "nodes", Arc::new(NodeCleanup { nodes }))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use muster_core::{Application, Configuration, Node, Secret, TaskStatus};
    use muster_index::IndexService;
    use muster_store::{MemBackend, ResourceStore, TaskStore};

    use super::*;
    use crate::config::TaskConfig;
    use crate::manager::TaskManager;

    fn wires(be: &Arc<MemBackend>) -> (Facade, NodeService) {
        let index = IndexService::new(be.clone());
        let nodes = NodeService::new(be.clone(), be.clone(), be.clone(), be.clone(), index.clone());
        let facade = Facade::new(
            be.clone(),
            be.clone(),
            be.clone(),
            be.clone(),
            be.clone(),
            index,
            nodes.clone(),
        );
        (facade, nodes)
    }

    #[tokio::test]
    async fn teardown_empties_the_namespace_and_finishes_the_task() {
        let be = Arc::new(MemBackend::new());
        let (facade, nodes) = wires(&be);
        nodes
            .create(Node {
                namespace: "doomed".into(),
                name: "n1".into(),
                labels: [("env".to_string(), "dev".to_string())].into(),
                ..Default::default()
            })
            .await
            .unwrap();
        facade
            .create_configuration(Configuration {
                namespace: "doomed".into(),
                name: "conf".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        facade
            .create_application(Application {
                namespace: "doomed".into(),
                name: "web".into(),
                selector: Some("env=dev".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        facade
            .create_secret(Secret {
                namespace: "doomed".into(),
                name: "token".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let registry = Arc::new(Registry::new());
        register_namespace_cleanup(&registry, facade, nodes).unwrap();
        let mgr = TaskManager::new(be.clone(), registry, TaskConfig::default());
        let task = be
            .create_task(Task {
                name: "drop-doomed".into(),
                namespace: "doomed".into(),
                registration_name: NAMESPACE_DELETION.into(),
                resource_type: "namespace".into(),
                resource_name: "doomed".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        mgr.run_task(task).await.unwrap();

        let stored = be.get_task("doomed", "drop-doomed").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Finished);
        assert!(ResourceStore::<Application>::list(be.as_ref(), None, "doomed")
            .await
            .unwrap()
            .is_empty());
        assert!(ResourceStore::<Configuration>::list(be.as_ref(), None, "doomed")
            .await
            .unwrap()
            .is_empty());
        assert!(ResourceStore::<Secret>::list(be.as_ref(), None, "doomed")
            .await
            .unwrap()
            .is_empty());
        assert!(ResourceStore::<Node>::list(be.as_ref(), None, "doomed")
            .await
            .unwrap()
            .is_empty());
    }
}
