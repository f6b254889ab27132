//! Helm releases: `helm upgrade --install` and `helm uninstall`.

use std::sync::Arc;
use std::time::Duration;

use installer_core::Component;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exec::{run_cancellable, CommandRunner};
use crate::{ApplyError, Result};

/// Where a chart comes from. Exactly one form is accepted per component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelmChart {
    /// Chart directory or packaged archive on disk.
    Path(String),
    /// Packaged chart at a URL.
    Url(String),
    /// Named chart in a repository.
    Repo { chart: String, url: String, version: Option<String> },
}

fn set(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

impl HelmChart {
    pub fn from_source(component: &Component) -> Result<Self> {
        let src = &component.source;
        match (set(&src.path), set(&src.chart), set(&src.url)) {
            (Some(path), None, None) => Ok(HelmChart::Path(path.to_string())),
            (None, None, Some(url)) => Ok(HelmChart::Url(url.to_string())),
            (None, Some(chart), Some(url)) => Ok(HelmChart::Repo {
                chart: chart.to_string(),
                url: url.to_string(),
                version: set(&src.version).map(str::to_string),
            }),
            _ => Err(ApplyError::config(
                &component.id,
                "helm source needs exactly one of: path, url, or chart with url",
            )),
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            HelmChart::Path(p) | HelmChart::Url(p) => args.push(p.clone()),
            HelmChart::Repo { chart, url, version } => {
                args.push(chart.clone());
                args.extend(["--repo".to_string(), url.clone()]);
                if let Some(v) = version {
                    args.extend(["--version".to_string(), v.clone()]);
                }
            }
        }
    }
}

/// Release name: `source.name` when given, else the component id.
pub fn release_name(component: &Component) -> &str {
    set(&component.source.name).unwrap_or(&component.id)
}

pub fn install_args(component: &Component, chart: &HelmChart, timeout: Duration) -> Vec<String> {
    let mut args = vec!["upgrade".to_string(), "--install".to_string(), release_name(component).to_string()];
    chart.push_args(&mut args);
    args.extend([
        "--namespace".to_string(),
        component.namespace.clone(),
        "--create-namespace".to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        format!("{}s", timeout.as_secs().max(1)),
    ]);
    for v in &component.values {
        args.push("--set".to_string());
        args.push(format!("{}={}", v.name, v.value));
    }
    args
}

pub fn uninstall_args(component: &Component) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        release_name(component).to_string(),
        "--namespace".to_string(),
        component.namespace.clone(),
        "--wait".to_string(),
    ]
}

pub struct HelmApplier {
    runner: Arc<dyn CommandRunner>,
    bin: String,
    timeout: Duration,
}

impl HelmApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>, timeout: Duration) -> Self {
        Self { runner, bin: bin.into(), timeout }
    }

    pub async fn install(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        let chart = HelmChart::from_source(component)?;
        let args = install_args(component, &chart, self.timeout);
        info!(component = %component.id, release = release_name(component), "helm upgrade --install");
        let out = run_cancellable(self.runner.as_ref(), cancel, &self.bin, &args).await?;
        if !out.success {
            return Err(ApplyError::Command {
                what: format!("installing helm release for '{}'", component.id),
                output: out.output,
            });
        }
        Ok(())
    }

    pub async fn uninstall(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        let args = uninstall_args(component);
        info!(component = %component.id, release = release_name(component), "helm uninstall");
        let out = run_cancellable(self.runner.as_ref(), cancel, &self.bin, &args).await?;
        if out.success {
            return Ok(());
        }
        if out.contains("not found") {
            debug!(component = %component.id, "release already gone");
            return Ok(());
        }
        Err(ApplyError::Command { what: format!("uninstalling helm release for '{}'", component.id), output: out.output })
    }
}
