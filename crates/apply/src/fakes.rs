//! In-memory stand-ins for the subprocess and cluster seams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use installer_kubehub::{Cluster, ClusterError, NamespaceMeta};
use tokio_util::sync::CancellationToken;

use crate::exec::{CommandOutput, CommandRunner};
use crate::Result;

/// Replays scripted outputs in order, then succeeds with empty output.
#[derive(Default)]
pub struct FakeRunner {
    replies: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeRunner {
    pub fn reply(self, out: CommandOutput) -> Self {
        self.replies.lock().unwrap().push_back(out);
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push((program.to_string(), args.to_vec()));
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// Namespaces in a map; waits succeed unless listed in `never_ready`.
///
/// The first `conflicts` updates fail with `Conflict`, each one after another writer
/// has added a `writer/<n>` label to the stored namespace.
#[derive(Default)]
pub struct FakeCluster {
    pub namespaces: Mutex<BTreeMap<String, NamespaceMeta>>,
    pub waits: Mutex<Vec<String>>,
    pub never_ready: Vec<String>,
    pub conflicts: AtomicU32,
    pub updates: AtomicU32,
}

impl FakeCluster {
    pub fn namespace(&self, name: &str) -> Option<NamespaceMeta> {
        self.namespaces.lock().unwrap().get(name).cloned()
    }

    pub fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> Vec<String> {
        self.waits.lock().unwrap().clone()
    }

    fn wait(&self, what: String, timeout: Duration) -> Result<(), ClusterError> {
        self.waits.lock().unwrap().push(what.clone());
        if self.never_ready.iter().any(|n| what.ends_with(n.as_str())) {
            return Err(ClusterError::Timeout { what, after: timeout });
        }
        Ok(())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError> {
        let mut map = self.namespaces.lock().unwrap();
        if map.contains_key(&ns.name) {
            return Err(ClusterError::AlreadyExists { kind: "namespace", name: ns.name.clone() });
        }
        map.insert(ns.name.clone(), ns.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<NamespaceMeta, ClusterError> {
        self.namespace(name).ok_or_else(|| ClusterError::NotFound { kind: "namespace", name: name.to_string() })
    }

    async fn update_namespace(&self, ns: &NamespaceMeta) -> Result<(), ClusterError> {
        let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        let mut map = self.namespaces.lock().unwrap();
        let conflicted =
            self.conflicts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok();
        match map.get_mut(&ns.name) {
            Some(slot) if conflicted => {
                slot.labels.insert(format!("writer/{}", n), "other".into());
                Err(ClusterError::Conflict { kind: "namespace", name: ns.name.clone() })
            }
            Some(slot) => {
                *slot = ns.clone();
                Ok(())
            }
            None => Err(ClusterError::NotFound { kind: "namespace", name: ns.name.clone() }),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        match self.namespaces.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound { kind: "namespace", name: name.to_string() }),
        }
    }

    async fn wait_for_pod_by_selector(
        &self,
        _cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.wait(format!("pod {}/{}", namespace, selector), timeout)
    }

    async fn wait_until_service_has_load_balancer(
        &self,
        _cancel: &CancellationToken,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.wait(format!("lb {}/{}", namespace, selector), timeout)
    }

    async fn wait_for_crd(&self, _cancel: &CancellationToken, name: &str, timeout: Duration) -> Result<(), ClusterError> {
        self.wait(format!("crd {}", name), timeout)
    }

    async fn wait_for_job_completed(
        &self,
        _cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.wait(format!("job {}/{}", namespace, name), timeout)
    }
}
