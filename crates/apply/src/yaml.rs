//! Raw manifests through `kubectl apply|delete`, optionally templated.
//!
//! When a component carries values the file is rendered with Tera first; the values are
//! exposed as `Values`, so a manifest refers to them as `{{ Values.domain }}`. The rendered
//! copy lives in a temp file that is removed once the command has run.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use installer_core::Component;
use tempfile::NamedTempFile;
use tera::{Context as TeraContext, Tera};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exec::{run_cancellable, CommandRunner};
use crate::retry::{retry, RetryPolicy};
use crate::{ApplyError, Result};

/// Render `path` with `values` into a fresh temp file.
pub fn render_template(path: &Path, values: &HashMap<String, String>) -> Result<NamedTempFile> {
    let raw = std::fs::read_to_string(path).map_err(|source| ApplyError::Io { path: path.to_path_buf(), source })?;
    let mut ctx = TeraContext::new();
    ctx.insert("Values", values);
    let rendered = Tera::one_off(&raw, &ctx, false)
        .map_err(|source| ApplyError::Template { path: path.to_path_buf(), source })?;

    let tmp_err = |source| ApplyError::Io { path: std::env::temp_dir(), source };
    let mut file = tempfile::Builder::new()
        .prefix("epinio-installer-")
        .suffix(".yaml")
        .tempfile()
        .map_err(tmp_err)?;
    file.write_all(rendered.as_bytes()).map_err(tmp_err)?;
    file.flush().map_err(tmp_err)?;
    debug!(template = %path.display(), rendered = %file.path().display(), "template rendered");
    Ok(file)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Apply,
    Delete,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Apply => "apply",
            Verb::Delete => "delete",
        }
    }
}

pub struct YamlApplier {
    runner: Arc<dyn CommandRunner>,
    bin: String,
    policy: RetryPolicy,
}

impl YamlApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>, policy: RetryPolicy) -> Self {
        Self { runner, bin: bin.into(), policy }
    }

    pub async fn apply(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        self.run(cancel, component, Verb::Apply).await
    }

    /// Missing objects count as deleted.
    pub async fn delete(&self, cancel: &CancellationToken, component: &Component) -> Result<()> {
        self.run(cancel, component, Verb::Delete).await
    }

    async fn run(&self, cancel: &CancellationToken, component: &Component, verb: Verb) -> Result<()> {
        let source = component
            .source
            .path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ApplyError::config(&component.id, "yaml source needs a path"))?;

        // Held until the command finishes; dropping it removes the file.
        let rendered = if component.values.is_empty() {
            None
        } else {
            Some(render_template(Path::new(source), &component.values_map())?)
        };
        let file: PathBuf = match &rendered {
            Some(tmp) => tmp.path().to_path_buf(),
            None => PathBuf::from(source),
        };

        let mut args = vec![verb.as_str().to_string(), "--wait".to_string(), "--filename".to_string(), file.display().to_string()];
        if !component.namespace.is_empty() {
            args.extend(["--namespace".to_string(), component.namespace.clone()]);
        }
        info!(component = %component.id, ?args, "kubectl {}", verb.as_str());

        let what = format!("{}ing YAML for '{}' from '{}'", verb.as_str().trim_end_matches('e'), component.id, source);
        let (runner, bin, args, what_ref) = (self.runner.as_ref(), self.bin.as_str(), &args, what.as_str());
        retry(cancel, self.policy, &what, move || async move {
            let out = run_cancellable(runner, cancel, bin, args).await?;
            if out.success {
                return Ok(());
            }
            if verb == Verb::Delete && (out.contains("not found") || out.contains("no matches")) {
                debug!(what = what_ref, "nothing left to delete");
                return Ok(());
            }
            Err(ApplyError::Command { what: what_ref.to_string(), output: out.output })
        })
        .await
    }
}
