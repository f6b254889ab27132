//! Namespace upsert. Existing labels and annotations not named in the manifest are kept.

use std::collections::BTreeMap;
use std::sync::Arc;

use installer_core::{Component, ValueType};
use installer_kubehub::{Cluster, ClusterError, NamespaceMeta};
use tracing::{debug, info, warn};

use crate::{ApplyError, Result};

/// Update attempts when the namespace changes underneath us.
const CONFLICT_ATTEMPTS: usize = 3;

/// Split the component's values into (labels, annotations). Untyped values are skipped.
pub fn partition_values(component: &Component) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    for v in &component.values {
        match v.kind {
            Some(ValueType::Label) => {
                labels.insert(v.name.clone(), v.value.clone());
            }
            Some(ValueType::Annotation) => {
                annotations.insert(v.name.clone(), v.value.clone());
            }
            None => debug!(component = %component.id, value = %v.name, "untyped namespace value ignored"),
        }
    }
    (labels, annotations)
}

fn require_namespace(component: &Component) -> Result<()> {
    if component.namespace.trim().is_empty() {
        return Err(ApplyError::config(&component.id, "namespace component has no namespace"));
    }
    Ok(())
}

pub struct NamespaceApplier {
    cluster: Arc<dyn Cluster>,
}

impl NamespaceApplier {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    pub async fn apply(&self, component: &Component) -> Result<()> {
        require_namespace(component)?;
        let (labels, annotations) = partition_values(component);
        let name = component.namespace.clone();
        let desired = NamespaceMeta { name: name.clone(), labels, annotations, resource_version: None };

        match self.cluster.create_namespace(&desired).await {
            Ok(()) => {
                info!(component = %component.id, namespace = %name, "namespace created");
                return Ok(());
            }
            Err(ClusterError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let mut attempt = 1;
        loop {
            let mut live = self.cluster.get_namespace(&name).await?;
            live.labels.extend(desired.labels.clone());
            live.annotations.extend(desired.annotations.clone());
            match self.cluster.update_namespace(&live).await {
                Ok(()) => {
                    info!(component = %component.id, namespace = %name, "namespace updated");
                    return Ok(());
                }
                Err(ClusterError::Conflict { .. }) if attempt < CONFLICT_ATTEMPTS => {
                    warn!(namespace = %name, attempt, "namespace changed concurrently; merging again");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn delete(&self, component: &Component) -> Result<()> {
        require_namespace(component)?;
        match self.cluster.delete_namespace(&component.namespace).await {
            Ok(()) => {
                info!(component = %component.id, namespace = %component.namespace, "namespace deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(namespace = %component.namespace, "namespace already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
