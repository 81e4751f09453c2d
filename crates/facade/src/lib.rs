//! Facade: every externally-visible create/update/delete of an application,
//! configuration, or secret, orchestrated as one logical operation.
//!
//! The primary mutation runs under a storage transaction, rolled back on
//! error and on unwind via [`TxGuard`]. The cascading side effects (index
//! refresh, node desire push, function-config upkeep) run after commit and
//! are eventually consistent: their failure surfaces as an error but never
//! undoes the committed primary write, and deletion-path cleanup failures
//! are logged as dirty data and skipped. This is a known consistency weak
//! point.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use muster_core::{
    Application, Configuration, Error, ExpiryRecord, Result, ScheduleStatus, Secret, StoreError,
    Volume, VolumeSource, FUNCTION_CONFIG_PREFIX,
};
use muster_index::IndexService;
use muster_node::NodeService;
use muster_store::{ExpiryStore, ResourceStore, TransactionFactory, TransactionHandle, Tx};
use tracing::{info, warn};

/// Rolls the transaction back on drop unless committed. Dropping during a
/// panic unwind rolls back as well, then the panic continues.
pub struct TxGuard {
    tx: Option<Box<dyn TransactionHandle>>,
}

impl TxGuard {
    pub fn begin(factory: &dyn TransactionFactory) -> Result<Self> {
        let tx = factory.begin()?;
        Ok(Self { tx: Some(tx) })
    }

    pub fn handle(&self) -> Tx<'_> {
        self.tx.as_deref()
    }

    pub fn commit(mut self) -> Result<()> {
        if let Some(mut tx) = self.tx.take() {
            tx.commit()?;
        }
        Ok(())
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = tx.rollback() {
                warn!(error = %e, "facade: rollback failed");
            }
        }
    }
}

#[derive(Clone)]
pub struct Facade {
    apps: Arc<dyn ResourceStore<Application>>,
    configs: Arc<dyn ResourceStore<Configuration>>,
    secrets: Arc<dyn ResourceStore<Secret>>,
    expiry: Arc<dyn ExpiryStore>,
    txf: Arc<dyn TransactionFactory>,
    index: IndexService,
    nodes: NodeService,
}

impl Facade {
    pub fn new(
        apps: Arc<dyn ResourceStore<Application>>,
        configs: Arc<dyn ResourceStore<Configuration>>,
        secrets: Arc<dyn ResourceStore<Secret>>,
        expiry: Arc<dyn ExpiryStore>,
        txf: Arc<dyn TransactionFactory>,
        index: IndexService,
        nodes: NodeService,
    ) -> Self {
        Self {
            apps,
            configs,
            secrets,
            expiry,
            txf,
            index,
            nodes,
        }
    }

    // ---- applications ----

    pub async fn list_applications(&self, namespace: &str) -> Result<Vec<Application>> {
        Ok(self.apps.list(None, namespace).await?)
    }

    pub async fn create_application(&self, app: Application) -> Result<Application> {
        app.validate()?;
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let created = self.apps.create(guard.handle(), app).await?;
        guard.commit()?;
        counter!("facade_app_create_total", 1u64);
        self.cascade_application(&created).await?;
        info!(ns = %created.namespace, app = %created.name, "facade: application created");
        Ok(created)
    }

    pub async fn update_application(&self, app: Application) -> Result<Application> {
        app.validate()?;
        let name = app.name.clone();
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let updated = self
            .apps
            .update(guard.handle(), app)
            .await
            .map_err(|e| Error::from_store(e, "application", &name))?;
        guard.commit()?;
        counter!("facade_app_update_total", 1u64);
        self.cascade_application(&updated).await?;
        info!(ns = %updated.namespace, app = %updated.name, "facade: application updated");
        Ok(updated)
    }

    pub async fn delete_application(&self, namespace: &str, name: &str) -> Result<()> {
        let app = self
            .apps
            .get(None, namespace, name)
            .await?
            .ok_or_else(|| Error::from_store(StoreError::NotFound, "application", name))?;
        let guard = TxGuard::begin(self.txf.as_ref())?;
        ResourceStore::<Application>::delete(self.apps.as_ref(), guard.handle(), namespace, name)
            .await
            .map_err(|e| Error::from_store(e, "application", name))?;
        guard.commit()?;
        counter!("facade_app_delete_total", 1u64);

        // Cleanup is best effort: failures leave dirty data for a later
        // full-list refresh, they do not resurrect the application.
        if let Err(e) = self.nodes.delete_node_app_version(None, &app).await {
            warn!(ns = %namespace, app = %name, error = %e, "facade: dirty data, node desire not pruned");
        }
        for (what, res) in [
            (
                "app-node index",
                self.index
                    .refresh_node_index_by_app(None, namespace, name, Vec::new())
                    .await,
            ),
            (
                "app-config index",
                self.index
                    .refresh_config_index_by_app(None, namespace, name, Vec::new())
                    .await,
            ),
            (
                "app-secret index",
                self.index
                    .refresh_secret_index_by_app(None, namespace, name, Vec::new())
                    .await,
            ),
        ] {
            if let Err(e) = res {
                warn!(ns = %namespace, app = %name, error = %e, "facade: dirty data, {} not cleared", what);
            }
        }
        if app.is_function {
            self.gc_function_configs(&app, None).await;
        }
        if app.schedule.is_some() {
            match self.expiry.delete_expiry(namespace, name).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => {
                    warn!(ns = %namespace, app = %name, error = %e, "facade: dirty data, expiry record kept");
                }
            }
        }
        info!(ns = %namespace, app = %name, "facade: application deleted");
        Ok(())
    }

    /// Post-commit side effects shared by application create and update.
    async fn cascade_application(&self, app: &Application) -> Result<()> {
        self.index
            .refresh_config_index_by_app(None, &app.namespace, &app.name, app.config_refs())
            .await?;
        self.index
            .refresh_secret_index_by_app(None, &app.namespace, &app.name, app.secret_refs())
            .await?;
        let matched = self.nodes.update_node_app_version(None, app).await?;
        self.index
            .refresh_node_index_by_app(None, &app.namespace, &app.name, matched)
            .await?;
        if app.is_function {
            self.ensure_function_config(app).await?;
        }
        if let Some(schedule) = &app.schedule {
            if schedule.status == ScheduleStatus::Pending {
                self.expiry
                    .add_expiry(ExpiryRecord {
                        namespace: app.namespace.clone(),
                        name: app.name.clone(),
                        expired_at: schedule.at,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Generated function configs are named with a recognizable prefix and
    /// one suffix per application version; stale versions are collected.
    fn function_config_name(app: &Application) -> String {
        format!("{}{}-{}", FUNCTION_CONFIG_PREFIX, app.name, app.version)
    }

    async fn ensure_function_config(&self, app: &Application) -> Result<()> {
        let name = Self::function_config_name(app);
        if ResourceStore::<Configuration>::get(self.configs.as_ref(), None, &app.namespace, &name)
            .await?
            .is_none()
        {
            let cfg = Configuration {
                namespace: app.namespace.clone(),
                name: name.clone(),
                ..Default::default()
            };
            self.configs.create(None, cfg).await?;
            info!(ns = %app.namespace, config = %name, "facade: function config created");
        }
        self.gc_function_configs(app, Some(&name)).await;
        Ok(())
    }

    /// Delete generated configs for this application except `keep`.
    /// Failures are logged and skipped.
    async fn gc_function_configs(&self, app: &Application, keep: Option<&str>) {
        let prefix = format!("{}{}-", FUNCTION_CONFIG_PREFIX, app.name);
        let configs = match self.configs.list(None, &app.namespace).await {
            Ok(c) => c,
            Err(e) => {
                warn!(ns = %app.namespace, app = %app.name, error = %e, "facade: dirty data, function configs not listed");
                return;
            }
        };
        for cfg in configs {
            if !cfg.name.starts_with(&prefix) || keep == Some(cfg.name.as_str()) {
                continue;
            }
            if let Err(e) = ResourceStore::<Configuration>::delete(
                self.configs.as_ref(),
                None,
                &app.namespace,
                &cfg.name,
            )
            .await
            {
                warn!(ns = %app.namespace, config = %cfg.name, error = %e, "facade: dirty data, function config not collected");
            }
        }
    }

    // ---- configurations ----

    pub async fn list_configurations(&self, namespace: &str) -> Result<Vec<Configuration>> {
        Ok(self.configs.list(None, namespace).await?)
    }

    pub async fn create_configuration(&self, config: Configuration) -> Result<Configuration> {
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let created = self.configs.create(guard.handle(), config).await?;
        guard.commit()?;
        info!(ns = %created.namespace, config = %created.name, "facade: configuration created");
        Ok(created)
    }

    /// Update a configuration and roll its new version into every
    /// application volume that references it, pushing the bumped
    /// applications out to their matched nodes.
    pub async fn update_configuration(&self, config: Configuration) -> Result<Configuration> {
        let name = config.name.clone();
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let updated = self
            .configs
            .update(guard.handle(), config)
            .await
            .map_err(|e| Error::from_store(e, "configuration", &name))?;
        guard.commit()?;
        counter!("facade_config_update_total", 1u64);

        let users = self
            .index
            .list_app_index_by_config(&updated.namespace, &updated.name)
            .await?;
        for app_name in users {
            self.bump_app_volume(&updated.namespace, &app_name, |v| {
                matches!(&v.source, VolumeSource::Config { name, .. } if name == &updated.name)
            }, &updated.version)
            .await?;
        }
        info!(ns = %updated.namespace, config = %updated.name, "facade: configuration updated");
        Ok(updated)
    }

    pub async fn delete_configuration(&self, namespace: &str, name: &str) -> Result<()> {
        let users = self.index.list_app_index_by_config(namespace, name).await?;
        if !users.is_empty() {
            return Err(Error::ResourceInUse {
                kind: "configuration".into(),
                name: name.to_string(),
            });
        }
        let guard = TxGuard::begin(self.txf.as_ref())?;
        ResourceStore::<Configuration>::delete(self.configs.as_ref(), guard.handle(), namespace, name)
            .await
            .map_err(|e| Error::from_store(e, "configuration", name))?;
        guard.commit()?;
        info!(ns = %namespace, config = %name, "facade: configuration deleted");
        Ok(())
    }

    // ---- secrets ----

    pub async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        Ok(self.secrets.list(None, namespace).await?)
    }

    pub async fn create_secret(&self, secret: Secret) -> Result<Secret> {
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let created = self.secrets.create(guard.handle(), secret).await?;
        guard.commit()?;
        info!(ns = %created.namespace, secret = %created.name, "facade: secret created");
        Ok(created)
    }

    pub async fn update_secret(&self, secret: Secret) -> Result<Secret> {
        let name = secret.name.clone();
        let guard = TxGuard::begin(self.txf.as_ref())?;
        let updated = self
            .secrets
            .update(guard.handle(), secret)
            .await
            .map_err(|e| Error::from_store(e, "secret", &name))?;
        guard.commit()?;

        let users = self
            .index
            .list_app_index_by_secret(&updated.namespace, &updated.name)
            .await?;
        for app_name in users {
            self.bump_app_volume(&updated.namespace, &app_name, |v| {
                matches!(&v.source, VolumeSource::Secret { name, .. } if name == &updated.name)
            }, &updated.version)
            .await?;
        }
        info!(ns = %updated.namespace, secret = %updated.name, "facade: secret updated");
        Ok(updated)
    }

    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let users = self.index.list_app_index_by_secret(namespace, name).await?;
        if !users.is_empty() {
            return Err(Error::ResourceInUse {
                kind: "secret".into(),
                name: name.to_string(),
            });
        }
        let guard = TxGuard::begin(self.txf.as_ref())?;
        ResourceStore::<Secret>::delete(self.secrets.as_ref(), guard.handle(), namespace, name)
            .await
            .map_err(|e| Error::from_store(e, "secret", name))?;
        guard.commit()?;
        info!(ns = %namespace, secret = %name, "facade: secret deleted");
        Ok(())
    }

    /// Rewrite the resolved version of matching volumes in one application
    /// and push the bumped application to its nodes.
    async fn bump_app_volume<F>(
        &self,
        namespace: &str,
        app_name: &str,
        mut matches_volume: F,
        version: &str,
    ) -> Result<()>
    where
        F: FnMut(&Volume) -> bool,
    {
        let mut app = match ResourceStore::<Application>::get(self.apps.as_ref(), None, namespace, app_name).await? {
            Some(a) => a,
            // Index pointed at a vanished application: stale entry, skip.
            None => return Ok(()),
        };
        let mut touched = false;
        for vol in &mut app.volumes {
            if !matches_volume(vol) {
                continue;
            }
            match &mut vol.source {
                VolumeSource::Config { version: v, .. } | VolumeSource::Secret { version: v, .. } => {
                    *v = Some(version.to_string());
                    touched = true;
                }
                VolumeSource::HostPath { .. } => {}
            }
        }
        if !touched {
            return Ok(());
        }
        let app = self.apps.update(None, app).await?;
        let matched = self.nodes.update_node_app_version(None, &app).await?;
        self.index
            .refresh_node_index_by_app(None, namespace, &app.name, matched)
            .await?;
        Ok(())
    }
}
