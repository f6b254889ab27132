//! Write-only progress sink. Nothing reads back from it.

use tracing::{error, info};

pub trait Progress: Send + Sync {
    fn note(&self, msg: &str);
    fn success(&self, msg: &str);
    fn failure(&self, msg: &str);
}

/// Routes progress into the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn note(&self, msg: &str) {
        info!(target: "progress", "{}", msg);
    }

    fn success(&self, msg: &str) {
        info!(target: "progress", ok = true, "{}", msg);
    }

    fn failure(&self, msg: &str) {
        error!(target: "progress", "{}", msg);
    }
}
