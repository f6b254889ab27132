//! Installer core: manifest model, dependency plan and the concurrent component walk.
//!
//! Nothing in here talks to a cluster. Appliers live in `installer-apply` and plug in
//! through the [`Action`] trait; the walk only knows about ordering.

#![forbid(unsafe_code)]

pub mod action;
pub mod manifest;
pub mod plan;
pub mod progress;
pub mod settings;
pub mod walk;

pub use action::{Action, DryRun};
pub use manifest::{
    Check, CheckType, Component, ComponentType, Components, Manifest, ManifestError, Needs,
    Source, Value, ValueType,
};
pub use plan::{build_plan, plan_line, PlanError};
pub use progress::{LogProgress, Progress};
pub use settings::Settings;
pub use walk::{reverse_walk, walk, Direction, Scheduler, WalkError, WalkReport};

pub mod prelude {
    pub use super::{
        build_plan, reverse_walk, walk, Action, Check, CheckType, Component, ComponentType,
        Manifest, Progress, Settings, WalkError, WalkReport,
    };
    pub use tokio_util::sync::CancellationToken;
}
