//! Concurrent, dependency-respecting executor.
//!
//! [`walk`] installs: a component is dispatched once everything it needs is done.
//! [`reverse_walk`] uninstalls: a component is dispatched once everything that needs it
//! is done. Independent components run concurrently, one tokio task each.
//!
//! Workers never touch scheduling state. They report back through the `JoinSet`, and the
//! coordinating loop is the only writer of the [`Scheduler`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::manifest::Component;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Dependencies first.
    Install,
    /// Dependents first.
    Uninstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Done,
}

/// Per-run state for every component: `pending -> running -> done`, never backwards.
///
/// `blockers[id]` holds what must be done before `id` may start: its needs when
/// installing, its needers when uninstalling.
#[derive(Debug)]
pub struct Scheduler {
    direction: Direction,
    order: Vec<String>,
    blockers: FxHashMap<String, Vec<String>>,
    status: FxHashMap<String, Status>,
}

impl Scheduler {
    pub fn new(components: &[Component], direction: Direction) -> Self {
        let order: Vec<String> = components.iter().map(|c| c.id.clone()).collect();
        let mut blockers: FxHashMap<String, Vec<String>> =
            order.iter().map(|id| (id.clone(), Vec::new())).collect();
        for c in components {
            for need in &c.needs {
                match direction {
                    Direction::Install => push_unique(blockers.entry(c.id.clone()).or_default(), need),
                    Direction::Uninstall => push_unique(blockers.entry(need.clone()).or_default(), &c.id),
                }
            }
        }
        let status = order.iter().map(|id| (id.clone(), Status::Pending)).collect();
        Self { direction, order, blockers, status }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pending and every blocker is done. Unknown blockers never complete.
    pub fn is_eligible(&self, id: &str) -> bool {
        if self.status.get(id) != Some(&Status::Pending) {
            return false;
        }
        self.blockers
            .get(id)
            .map(|bs| bs.iter().all(|b| self.status.get(b.as_str()) == Some(&Status::Done)))
            .unwrap_or(true)
    }

    /// Flip a pending component to running. Returns false if it was not pending, which
    /// keeps repeated scans from dispatching the same component twice.
    pub fn mark_running(&mut self, id: &str) -> bool {
        match self.status.get_mut(id) {
            Some(s) if *s == Status::Pending => {
                *s = Status::Running;
                true
            }
            _ => false,
        }
    }

    pub fn mark_done(&mut self, id: &str) {
        if let Some(s) = self.status.get_mut(id) {
            *s = Status::Done;
        }
    }

    /// Every eligible component, in manifest order, now marked running.
    pub fn claim_eligible(&mut self) -> Vec<String> {
        let eligible: Vec<String> = self.order.iter().filter(|id| self.is_eligible(id)).cloned().collect();
        eligible.into_iter().filter(|id| self.mark_running(id)).collect()
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.status.get(id) == Some(&Status::Done)
    }

    pub fn all_done(&self) -> bool {
        self.status.values().all(|s| *s == Status::Done)
    }

    /// Components not yet done, in manifest order.
    pub fn unfinished(&self) -> Vec<String> {
        self.order.iter().filter(|id| !self.is_done(id)).cloned().collect()
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}

/// Successful run: the order in which components finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub completed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("component {component} failed after {} completed: {error:#}", .completed.len())]
    Failed {
        component: String,
        completed: Vec<String>,
        error: anyhow::Error,
    },
    #[error("cancelled after {} components completed", .completed.len())]
    Cancelled { completed: Vec<String> },
    #[error("no component can make progress; unfinished: {}", .pending.join(", "))]
    Stalled { pending: Vec<String> },
}

impl WalkError {
    /// Components that finished before the walk stopped.
    pub fn completed(&self) -> &[String] {
        match self {
            WalkError::Failed { completed, .. } | WalkError::Cancelled { completed } => completed.as_slice(),
            WalkError::Stalled { .. } => &[],
        }
    }
}

/// Install every component, dependencies first.
pub async fn walk<A>(cancel: &CancellationToken, components: &[Component], action: Arc<A>) -> Result<WalkReport, WalkError>
where
    A: Action + ?Sized + 'static,
{
    drive(Direction::Install, cancel, components, action).await
}

/// Remove every component, dependents first.
pub async fn reverse_walk<A>(cancel: &CancellationToken, components: &[Component], action: Arc<A>) -> Result<WalkReport, WalkError>
where
    A: Action + ?Sized + 'static,
{
    drive(Direction::Uninstall, cancel, components, action).await
}

type Outcome = (String, anyhow::Result<()>);

async fn drive<A>(
    direction: Direction,
    cancel: &CancellationToken,
    components: &[Component],
    action: Arc<A>,
) -> Result<WalkReport, WalkError>
where
    A: Action + ?Sized + 'static,
{
    let mut sched = Scheduler::new(components, direction);
    let by_id: FxHashMap<&str, &Component> = components.iter().map(|c| (c.id.as_str(), c)).collect();
    // Cancelled on first failure so in-flight siblings stop waiting; also follows the caller.
    let workers = cancel.child_token();
    let mut tasks: JoinSet<Outcome> = JoinSet::new();
    let mut report = WalkReport::default();
    let mut failure: Option<(String, anyhow::Error)> = None;
    let mut cancelled = false;

    info!(?direction, components = components.len(), "walk started");

    loop {
        if !cancelled && cancel.is_cancelled() {
            cancelled = true;
        }
        if failure.is_none() && !cancelled {
            for id in sched.claim_eligible() {
                let Some(component) = by_id.get(id.as_str()).map(|c| (*c).clone()) else { continue };
                debug!(component = %id, ?direction, "dispatching");
                let action = Arc::clone(&action);
                let token = workers.clone();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let res = AssertUnwindSafe(action.apply(&token, &component))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("worker for {} panicked", component.id)));
                    histogram!("installer_component_ms", started.elapsed().as_secs_f64() * 1000.0);
                    (component.id, res)
                });
            }
        }

        if tasks.is_empty() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                warn!(?direction, "cancellation requested; waiting for in-flight components");
                cancelled = true;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok((id, Ok(())))) => {
                    counter!("installer_component_ok", 1u64);
                    debug!(component = %id, "done");
                    sched.mark_done(&id);
                    report.completed.push(id);
                }
                Some(Ok((id, Err(e)))) if cancel.is_cancelled() => {
                    // Fallout of the caller's cancellation, not a failure of its own.
                    debug!(component = %id, error = %format!("{:#}", e), "component stopped by cancellation");
                    cancelled = true;
                }
                Some(Ok((id, Err(e)))) => {
                    counter!("installer_component_err", 1u64);
                    error!(component = %id, error = %format!("{:#}", e), "component failed");
                    if failure.is_none() {
                        failure = Some((id, e));
                        workers.cancel();
                    }
                }
                Some(Err(join_err)) => {
                    counter!("installer_component_err", 1u64);
                    error!(error = %join_err, "worker task did not complete");
                    if failure.is_none() {
                        failure = Some(("<worker>".to_string(), anyhow::Error::new(join_err)));
                        workers.cancel();
                    }
                }
                None => {}
            },
        }
    }

    if let Some((component, error)) = failure {
        return Err(WalkError::Failed { component, completed: report.completed, error });
    }
    if cancelled {
        return Err(WalkError::Cancelled { completed: report.completed });
    }
    if !sched.all_done() {
        return Err(WalkError::Stalled { pending: sched.unfinished() });
    }
    info!(?direction, completed = report.completed.len(), "walk finished");
    Ok(report)
}
