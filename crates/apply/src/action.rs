//! The install and uninstall [`Action`]s handed to the walk.

use std::sync::Arc;

use async_trait::async_trait;
use installer_core::{Action, Component, ComponentType, Progress, Settings};
use installer_kubehub::Cluster;
use tokio_util::sync::CancellationToken;

use crate::checks::CheckRunner;
use crate::exec::CommandRunner;
use crate::helm::HelmApplier;
use crate::namespace::NamespaceApplier;
use crate::retry::RetryPolicy;
use crate::yaml::YamlApplier;
use crate::Result;

/// One applier per component type, plus the check runner.
pub struct Appliers {
    pub helm: HelmApplier,
    pub yaml: YamlApplier,
    pub namespace: NamespaceApplier,
    pub checks: CheckRunner,
}

impl Appliers {
    pub fn new(runner: Arc<dyn CommandRunner>, cluster: Arc<dyn Cluster>, settings: &Settings) -> Self {
        let policy = RetryPolicy { attempts: settings.retry_attempts, delay: settings.retry_delay };
        Self {
            helm: HelmApplier::new(runner.clone(), settings.helm_bin.clone(), settings.check_timeout),
            yaml: YamlApplier::new(runner, settings.kubectl_bin.clone(), policy),
            namespace: NamespaceApplier::new(cluster.clone()),
            checks: CheckRunner::new(cluster, settings.check_timeout),
        }
    }

    async fn install(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        self.checks.run_all(cancel, component, &component.pre_deploy).await?;
        match component.kind {
            ComponentType::Helm => self.helm.install(cancel, component).await?,
            ComponentType::Yaml => self.yaml.apply(cancel, component).await?,
            ComponentType::Namespace => self.namespace.apply(component).await?,
        }
        self.checks.run_all(cancel, component, &component.wait_complete).await
    }

    async fn uninstall(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        match component.kind {
            ComponentType::Helm => self.helm.uninstall(cancel, component).await,
            ComponentType::Yaml => self.yaml.delete(cancel, component).await,
            ComponentType::Namespace => self.namespace.delete(component).await,
        }
    }
}

/// Pre-deploy checks, apply, then wait-complete checks.
pub struct Install {
    appliers: Arc<Appliers>,
    progress: Arc<dyn Progress>,
}

impl Install {
    pub fn new(appliers: Arc<Appliers>, progress: Arc<dyn Progress>) -> Self {
        Self { appliers, progress }
    }
}

#[async_trait]
impl Action for Install {
    async fn apply(&self, cancel: &CancellationToken, component: &Component) -> anyhow::Result<()> {
        self.progress.note(&format!("Installing {}...", component.id));
        match self.appliers.install(cancel, component).await {
            Ok(()) => {
                self.progress.success(&format!("{} deployed", component.id));
                Ok(())
            }
            Err(e) => {
                self.progress.failure(&format!("{} failed: {}", component.id, e));
                Err(anyhow::Error::new(e).context(format!("installing {}", component.id)))
            }
        }
    }
}

/// Straight to the delete path; removal has no readiness checks.
pub struct Uninstall {
    appliers: Arc<Appliers>,
    progress: Arc<dyn Progress>,
}

impl Uninstall {
    pub fn new(appliers: Arc<Appliers>, progress: Arc<dyn Progress>) -> Self {
        Self { appliers, progress }
    }
}

#[async_trait]
impl Action for Uninstall {
    async fn apply(&self, cancel: &CancellationToken, component: &Component) -> anyhow::Result<()> {
        self.progress.note(&format!("Removing {}...", component.id));
        match self.appliers.uninstall(cancel, component).await {
            Ok(()) => {
                self.progress.success(&format!("{} removed", component.id));
                Ok(())
            }
            Err(e) => {
                self.progress.failure(&format!("{} removal failed: {}", component.id, e));
                Err(anyhow::Error::new(e).context(format!("removing {}", component.id)))
            }
        }
    }
}
