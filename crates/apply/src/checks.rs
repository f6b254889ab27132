//! Readiness checks gating a component before and after it is applied.

use std::sync::Arc;
use std::time::{Duration, Instant};

use installer_core::{Check, CheckType, Component};
use installer_kubehub::Cluster;
use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;

/// Runs checks against the cluster with one shared timeout.
pub struct CheckRunner {
    cluster: Arc<dyn Cluster>,
    timeout: Duration,
}

impl CheckRunner {
    pub fn new(cluster: Arc<dyn Cluster>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, cancel: &CancellationToken, component: &Component, check: &Check) -> Result<()> {
        let ns = check.resolve_namespace(component);
        let started = Instant::now();
        debug!(component = %component.id, kind = ?check.kind, namespace = ns, selector = %check.selector, "checking");
        let res = match check.kind {
            CheckType::Pod => self.cluster.wait_for_pod_by_selector(cancel, ns, &check.selector, self.timeout).await,
            CheckType::Loadbalancer => {
                self.cluster.wait_until_service_has_load_balancer(cancel, ns, &check.selector, self.timeout).await
            }
            CheckType::Crd => self.cluster.wait_for_crd(cancel, &check.selector, self.timeout).await,
            CheckType::Job => self.cluster.wait_for_job_completed(cancel, ns, &check.selector, self.timeout).await,
        };
        histogram!("installer_check_ms", started.elapsed().as_secs_f64() * 1000.0);
        res?;
        info!(component = %component.id, kind = ?check.kind, selector = %check.selector, "check passed");
        Ok(())
    }

    /// Run `checks` one after another, stopping at the first failure.
    pub async fn run_all(&self, cancel: &CancellationToken, component: &Component, checks: &[Check]) -> Result<()> {
        for check in checks {
            self.run(cancel, component, check).await?;
        }
        Ok(())
    }
}
