//! Runtime tunables, read from `EPINIO_*` environment variables.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Upper bound for a single readiness check and for `helm --wait`.
    pub check_timeout: Duration,
    /// How often cluster waits re-list pods/services.
    pub poll_interval: Duration,
    /// Fixed delay between kubectl retries.
    pub retry_delay: Duration,
    pub retry_attempts: u32,
    pub helm_bin: String,
    pub kubectl_bin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            retry_delay: Duration::from_secs(5),
            retry_attempts: 10,
            helm_bin: "helm".to_string(),
            kubectl_bin: "kubectl".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            check_timeout: env_parse::<u64>("EPINIO_CHECK_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.check_timeout),
            poll_interval: env_parse::<u64>("EPINIO_CHECK_POLL_SECS").map(Duration::from_secs).unwrap_or(d.poll_interval),
            retry_delay: env_parse::<u64>("EPINIO_RETRY_DELAY_SECS").map(Duration::from_secs).unwrap_or(d.retry_delay),
            retry_attempts: env_parse::<u32>("EPINIO_RETRY_ATTEMPTS").map(|n| n.max(1)).unwrap_or(d.retry_attempts),
            helm_bin: std::env::var("EPINIO_HELM_BIN").unwrap_or(d.helm_bin),
            kubectl_bin: std::env::var("EPINIO_KUBECTL_BIN").unwrap_or(d.kubectl_bin),
        }
    }

    /// Scale the check timeout, for slow clusters.
    pub fn with_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.check_timeout = self.check_timeout.saturating_mul(multiplier.max(1));
        self
    }
}
