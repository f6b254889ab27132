use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::manifest::Component;
use crate::progress::Progress;

/// Work the walk performs for one component. Install and uninstall are both actions;
/// the walk only decides *when* `apply` runs.
#[async_trait]
pub trait Action: Send + Sync {
    async fn apply(&self, cancel: &CancellationToken, component: &Component) -> anyhow::Result<()>;
}

#[async_trait]
impl<A: Action + ?Sized> Action for Arc<A> {
    async fn apply(&self, cancel: &CancellationToken, component: &Component) -> anyhow::Result<()> {
        (**self).apply(cancel, component).await
    }
}

/// Walks the graph without touching anything. Used by `--dry-run`.
pub struct DryRun {
    verb: &'static str,
    delay: Duration,
    progress: Arc<dyn Progress>,
}

impl DryRun {
    pub fn new(verb: &'static str, progress: Arc<dyn Progress>) -> Self {
        Self { verb, delay: Duration::ZERO, progress }
    }

    /// Pretend each component takes `delay`, which makes concurrency visible in the output.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Action for DryRun {
    async fn apply(&self, cancel: &CancellationToken, component: &Component) -> anyhow::Result<()> {
        self.progress.note(&format!("would {} {}", self.verb, component.id));
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => anyhow::bail!("cancelled while simulating {}", component.id),
            }
        }
        Ok(())
    }
}
