use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use tokio_util::sync::CancellationToken;

use crate::ClusterError;

/// Run `fut` until it resolves, `timeout` elapses, or `cancel` fires.
pub async fn bounded<F>(cancel: &CancellationToken, what: &str, timeout: Duration, fut: F) -> Result<(), ClusterError>
where
    F: Future<Output = Result<(), ClusterError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ClusterError::Cancelled { what: what.to_string() }),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(ClusterError::Timeout { what: what.to_string(), after: timeout }),
        },
    }
}

/// Pod has condition `Ready=True`.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Service load balancer status carries at least one ingress with an IP or hostname.
pub fn service_has_ingress(svc: &Service) -> bool {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ing| {
            ing.iter().any(|i| {
                i.ip.as_deref().map_or(false, |s| !s.is_empty()) || i.hostname.as_deref().map_or(false, |s| !s.is_empty())
            })
        })
        .unwrap_or(false)
}
