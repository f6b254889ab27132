//! Installer apply: the component appliers and the install/uninstall actions.
//!
//! Helm and YAML components shell out through a [`CommandRunner`]; namespaces and readiness
//! checks go through the [`Cluster`] trait. [`Install`] and [`Uninstall`] are the
//! [`Action`]s handed to the walk.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use installer_kubehub::ClusterError;

pub mod action;
pub mod checks;
pub mod exec;
pub mod helm;
pub mod namespace;
pub mod retry;
pub mod yaml;

#[cfg(test)]
mod fakes;

pub use action::{Appliers, Install, Uninstall};
pub use checks::CheckRunner;
pub use exec::{CommandOutput, CommandRunner, ProcessRunner};
pub use helm::{HelmApplier, HelmChart};
pub use installer_core::Action;
pub use installer_kubehub::Cluster;
pub use namespace::NamespaceApplier;
pub use retry::{is_retryable, retry, RetryPolicy};
pub use yaml::{render_template, YamlApplier};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The manifest entry cannot be applied as written. Raised before anything is spawned.
    #[error("component {component}: {message}")]
    Config { component: String, message: String },
    #[error("{what} failed:\n{output}")]
    Command { what: String, output: String },
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rendering template {}: {source}", .path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: tera::Error,
    },
    #[error("cancelled: {what}")]
    Cancelled { what: String },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl ApplyError {
    pub fn config(component: &str, message: impl Into<String>) -> Self {
        ApplyError::Config { component: component.to_string(), message: message.into() }
    }

    /// Whether another attempt might succeed. Only what the command or the API server
    /// reported is classified, never the component id or source path in `what`.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::Command { output, .. } => is_retryable(output),
            ApplyError::Cluster(e) => is_retryable(&e.to_string()),
            _ => false,
        }
    }
}

pub type Result<T, E = ApplyError> = std::result::Result<T, E>;
