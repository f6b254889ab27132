//! Installer kubehub: the slice of the Kubernetes API the installer needs.
//!
//! Everything goes through the [`Cluster`] trait so appliers and checks can be exercised
//! against an in-memory fake. [`KubeCluster`] is the kube-rs implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::wait::{await_condition, conditions},
    Client, Config,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod wait;

pub use wait::{bounded, pod_is_ready, service_has_ingress};

/// Metadata the installer reads and writes on a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMeta {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Set on objects read from the cluster; sent back on update for optimistic concurrency.
    pub resource_version: Option<String>,
}

impl NamespaceMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },
    #[error("timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },
    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },
    #[error("watching {what}: {message}")]
    Watch { what: String, message: String },
    #[error("kubernetes api: {0}")]
    Api(#[from] kube::Error),
}

impl ClusterError {
    /// Classify by API status code instead of by message text.
    pub fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound { kind, name: name.to_string() },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists { kind, name: name.to_string() }
            }
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict { kind, name: name.to_string() },
            _ => ClusterError::Api(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Cluster operations consumed by appliers and readiness checks.
///
/// Every wait is bounded by `timeout` and returns early with
/// [`ClusterError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError>;
    async fn get_namespace(&self, name: &str) -> Result<NamespaceMeta, ClusterError>;
    async fn update_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError>;
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// At least one pod matching the label selector is Ready.
    async fn wait_for_pod_by_selector(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;

    /// A service matching the label selector has a load balancer IP or hostname.
    async fn wait_until_service_has_load_balancer(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;

    /// The named CRD exists and is Established.
    async fn wait_for_crd(&self, cancel: &CancellationToken, name: &str, timeout: Duration) -> Result<(), ClusterError>;

    /// The named job reached Complete.
    async fn wait_for_job_completed(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;
}

/// Build a client from an explicit kubeconfig (a `:`-separated list is merged in order),
/// or fall back to the inferred in-cluster/default config.
pub async fn get_kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(raw) = kubeconfig.filter(|p| !p.as_os_str().is_empty()) else {
        return Client::try_default().await.context("inferring kubernetes client config");
    };
    let mut merged: Option<Kubeconfig> = None;
    for path in std::env::split_paths(raw.as_os_str()) {
        let next = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
        merged = Some(match merged {
            Some(prev) => prev.merge(next).context("merging kubeconfig files")?,
            None => next,
        });
    }
    let kc = merged.context("kubeconfig path list is empty")?;
    let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .context("loading kubeconfig")?;
    debug!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kubernetes client")
}

/// kube-rs backed [`Cluster`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    poll: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, poll: Duration) -> Self {
        Self { client, poll: poll.max(Duration::from_millis(100)) }
    }

    pub async fn connect(kubeconfig: Option<&Path>, poll: Duration) -> Result<Self> {
        let client = get_kube_client(kubeconfig).await?;
        info!("connected to cluster");
        Ok(Self::new(client, poll))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

fn to_namespace(meta: &NamespaceMeta) -> Namespace {
    let non_empty = |m: &BTreeMap<String, String>| if m.is_empty() { None } else { Some(m.clone()) };
    Namespace {
        metadata: ObjectMeta {
            name: Some(meta.name.clone()),
            labels: non_empty(&meta.labels),
            annotations: non_empty(&meta.annotations),
            resource_version: meta.resource_version.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Merge patch touching only labels and annotations. Every other metadata field on the
/// live object (finalizers, owner references, managed fields) is left as it is.
fn merge_patch(meta: &NamespaceMeta) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "labels": meta.labels,
        "annotations": meta.annotations,
    });
    if let Some(rv) = &meta.resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(rv.clone());
    }
    serde_json::json!({ "metadata": metadata })
}

fn from_namespace(ns: Namespace) -> NamespaceMeta {
    let m = ns.metadata;
    NamespaceMeta {
        name: m.name.unwrap_or_default(),
        labels: m.labels.unwrap_or_default(),
        annotations: m.annotations.unwrap_or_default(),
        resource_version: m.resource_version,
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError> {
        self.namespaces()
            .create(&PostParams::default(), &to_namespace(ns))
            .await
            .map_err(|e| ClusterError::from_kube("namespace", &ns.name, e))?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<NamespaceMeta, ClusterError> {
        let ns = self.namespaces().get(name).await.map_err(|e| ClusterError::from_kube("namespace", name, e))?;
        Ok(from_namespace(ns))
    }

    async fn update_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError> {
        self.namespaces()
            .patch(&ns.name, &PatchParams::default(), &Patch::Merge(&merge_patch(ns)))
            .await
            .map_err(|e| ClusterError::from_kube("namespace", &ns.name, e))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.namespaces()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::from_kube("namespace", name, e))?;
        Ok(())
    }

    async fn wait_for_pod_by_selector(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let what = format!("ready pod {}/{}", namespace, selector);
        bounded(cancel, &what, timeout, async {
            loop {
                match api.list(&lp).await {
                    Ok(pods) if pods.items.iter().any(pod_is_ready) => return Ok(()),
                    Ok(pods) => debug!(namespace, selector, seen = pods.items.len(), "no ready pod yet"),
                    Err(e) => warn!(namespace, selector, error = %e, "listing pods failed; will retry"),
                }
                tokio::time::sleep(self.poll).await;
            }
        })
        .await
    }

    async fn wait_until_service_has_load_balancer(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let what = format!("load balancer for {}/{}", namespace, selector);
        bounded(cancel, &what, timeout, async {
            loop {
                match api.list(&lp).await {
                    Ok(svcs) if svcs.items.iter().any(service_has_ingress) => return Ok(()),
                    Ok(svcs) => debug!(namespace, selector, seen = svcs.items.len(), "no load balancer ingress yet"),
                    Err(e) => warn!(namespace, selector, error = %e, "listing services failed; will retry"),
                }
                tokio::time::sleep(self.poll).await;
            }
        })
        .await
    }

    async fn wait_for_crd(&self, cancel: &CancellationToken, name: &str, timeout: Duration) -> Result<(), ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let what = format!("crd {}", name);
        bounded(cancel, &what, timeout, async {
            await_condition(api, name, conditions::is_crd_established())
                .await
                .map(|_| ())
                .map_err(|e| ClusterError::Watch { what: what.clone(), message: e.to_string() })
        })
        .await
    }

    async fn wait_for_job_completed(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("job {}/{}", namespace, name);
        bounded(cancel, &what, timeout, async {
            await_condition(api, name, conditions::is_job_completed())
                .await
                .map(|_| ())
                .map_err(|e| ClusterError::Watch { what: what.clone(), message: e.to_string() })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified_by_status() {
        assert!(ClusterError::from_kube("namespace", "x", api_err(404, "NotFound")).is_not_found());
        assert!(ClusterError::from_kube("namespace", "x", api_err(409, "AlreadyExists")).is_already_exists());
        assert!(matches!(
            ClusterError::from_kube("namespace", "x", api_err(409, "Conflict")),
            ClusterError::Conflict { .. }
        ));
        assert!(matches!(ClusterError::from_kube("namespace", "x", api_err(500, "InternalError")), ClusterError::Api(_)));
    }

    #[test]
    fn namespace_meta_round_trips_through_k8s_object() {
        let mut meta = NamespaceMeta::named("epinio");
        meta.labels.insert("a".into(), "1".into());
        meta.resource_version = Some("42".into());
        let ns = to_namespace(&meta);
        assert!(ns.metadata.annotations.is_none());
        assert_eq!(from_namespace(ns), meta);
    }

    /// JSON merge patch (RFC 7386), as the API server applies `Patch::Merge`.
    fn apply_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
        match (target.as_object_mut(), patch.as_object()) {
            (Some(t), Some(p)) => {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        apply_merge(t.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                    }
                }
            }
            _ => *target = patch.clone(),
        }
    }

    #[test]
    fn update_keeps_metadata_it_does_not_manage() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut live = Namespace::default();
        live.metadata.name = Some("epinio".into());
        live.metadata.resource_version = Some("7".into());
        live.metadata.finalizers = Some(vec!["example.io/protect".into()]);
        live.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "owner".into(),
            uid: "1234".into(),
            ..Default::default()
        }]);
        live.metadata.labels = Some(BTreeMap::from([("keep".to_string(), "yes".to_string())]));

        let mut meta = from_namespace(live.clone());
        meta.labels.insert("app.kubernetes.io/part-of".into(), "epinio".into());
        let patch = merge_patch(&meta);

        let sent = patch["metadata"].as_object().unwrap();
        let mut keys: Vec<&str> = sent.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["annotations", "labels", "resourceVersion"]);

        let mut server = serde_json::to_value(&live).unwrap();
        apply_merge(&mut server, &patch);
        let updated: Namespace = serde_json::from_value(server).unwrap();
        assert_eq!(updated.metadata.finalizers, live.metadata.finalizers);
        assert_eq!(updated.metadata.owner_references, live.metadata.owner_references);
        let labels = updated.metadata.labels.unwrap();
        assert_eq!(labels.get("keep").map(String::as_str), Some("yes"));
        assert_eq!(labels.get("app.kubernetes.io/part-of").map(String::as_str), Some("epinio"));
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));
    }
}
