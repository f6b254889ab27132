//! Declarative manifest: which components exist, how each one is materialized,
//! what it needs, and which checks gate it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::plan::{build_plan, PlanError};

/// IDs a component depends on. Almost always zero or one entry.
pub type Needs = SmallVec<[String; 2]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Helm,
    Yaml,
    Namespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Pod,
    Loadbalancer,
    Crd,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Label,
    Annotation,
}

/// A typed readiness condition. `selector` is a label selector for pods and
/// load balancers, and a resource name for CRDs and jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    #[serde(rename = "type")]
    pub kind: CheckType,
    #[serde(default)]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Check {
    /// The check's own namespace wins over the owning component's.
    pub fn resolve_namespace<'a>(&'a self, component: &'a Component) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => component.namespace.as_str(),
        }
    }
}

/// Where a component comes from.
///
/// Helm accepts exactly one of: `path` (packaged or unpacked chart), `url` (absolute chart
/// archive URL), or `chart` + `url` (repository reference, optional `version`).
/// YAML components only use `path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Helm release name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueType>,
}

impl Value {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), kind: None }
    }

    pub fn typed(name: impl Into<String>, value: impl Into<String>, kind: ValueType) -> Self {
        Self { name: name.into(), value: value.into(), kind: Some(kind) }
    }
}

/// One deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: ComponentType,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "SmallVec::is_empty")]
    pub needs: Needs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_deploy: Vec<Check>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_complete: Vec<Check>,
}

impl Component {
    pub fn new(id: impl Into<String>, kind: ComponentType) -> Self {
        Self {
            id: id.into(),
            namespace: String::new(),
            kind,
            source: Source::default(),
            values: Vec::new(),
            needs: Needs::new(),
            pre_deploy: Vec::new(),
            wait_complete: Vec::new(),
        }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn needing(mut self, id: impl Into<String>) -> Self {
        self.needs.push(id.into());
        self
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.needs.iter().any(|n| n == id)
    }

    /// Values as a lookup table. Later entries win on duplicate names.
    pub fn values_map(&self) -> HashMap<String, String> {
        self.values.iter().map(|v| (v.name.clone(), v.value.clone())).collect()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

pub type Components = Vec<Component>;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("reading manifest {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("component #{index} has an empty id")]
    EmptyId { index: usize },
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// The full, ordered component list for one installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(alias = "Components", default)]
    pub components: Components,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ManifestError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    /// Reject manifests that cannot be walked: empty ids, duplicates, dangling
    /// `needs` and cycles. Returns the planned order on success.
    pub fn validate(&self) -> Result<Components, ManifestError> {
        if let Some(index) = self.components.iter().position(|c| c.id.is_empty()) {
            return Err(ManifestError::EmptyId { index });
        }
        Ok(build_plan(&self.components)?)
    }

    /// IDs that no other component needs, i.e. the first ones an uninstall removes.
    pub fn leaves(&self) -> Vec<&str> {
        let needed: FxHashSet<&str> = self
            .components
            .iter()
            .flat_map(|c| c.needs.iter().map(String::as_str))
            .collect();
        self.components.iter().map(|c| c.id.as_str()).filter(|id| !needed.contains(id)).collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(de: D) -> Result<Needs, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(de)? {
        None => Needs::new(),
        Some(OneOrMany::One(id)) if id.is_empty() => Needs::new(),
        Some(OneOrMany::One(id)) => smallvec![id],
        Some(OneOrMany::Many(ids)) => ids.into_iter().filter(|id| !id.is_empty()).collect(),
    })
}

// Values like `true` or `3` are common in hand-written manifests.
fn scalar_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    use serde::de::Error;
    match serde_yaml::Value::deserialize(de)? {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("value must be a scalar, got {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
components:
  - id: epinio-ns
    type: namespace
    values:
      - name: linkerd.io/inject
        value: enabled
        type: annotation
      - name: app.kubernetes.io/name
        value: epinio
        type: label
  - id: cert-manager
    namespace: cert-manager
    type: helm
    source:
      name: cert-manager
      chart: cert-manager
      url: https://charts.jetstack.io
      version: v1.5.3
    values:
      - name: installCRDs
        value: true
    waitComplete:
      - type: crd
        selector: certificates.cert-manager.io
      - type: pod
        selector: app.kubernetes.io/name=webhook
  - id: cluster-issuers
    type: yaml
    needs: cert-manager
    source:
      path: assets/cluster-issuers.yaml
    preDeploy:
      - type: pod
        selector: app=webhook
        namespace: cert-manager
  - id: epinio
    namespace: epinio
    type: helm
    needs: [cluster-issuers, epinio-ns]
    source:
      name: epinio
      path: assets/epinio
"#;

    #[test]
    fn parses_on_disk_field_names() {
        let m = Manifest::from_yaml(SAMPLE).unwrap();
        assert_eq!(m.ids(), vec!["epinio-ns", "cert-manager", "cluster-issuers", "epinio"]);

        let ns = m.get("epinio-ns").unwrap();
        assert_eq!(ns.kind, ComponentType::Namespace);
        assert_eq!(ns.values[0].kind, Some(ValueType::Annotation));

        let cm = m.get("cert-manager").unwrap();
        assert_eq!(cm.source.chart.as_deref(), Some("cert-manager"));
        assert_eq!(cm.values[0].value, "true");
        assert_eq!(cm.wait_complete.len(), 2);
        assert_eq!(cm.wait_complete[0].kind, CheckType::Crd);
        assert!(cm.needs.is_empty());

        let issuers = m.get("cluster-issuers").unwrap();
        assert_eq!(issuers.needs.as_slice(), ["cert-manager".to_string()]);
        assert_eq!(issuers.pre_deploy[0].namespace.as_deref(), Some("cert-manager"));

        let epinio = m.get("epinio").unwrap();
        assert!(epinio.depends_on("cluster-issuers"));
        assert!(epinio.depends_on("epinio-ns"));
    }

    #[test]
    fn accepts_capitalized_components_key() {
        let m = Manifest::from_yaml("Components:\n  - id: a\n    type: yaml\n").unwrap();
        assert_eq!(m.ids(), vec!["a"]);
    }

    #[test]
    fn empty_needs_string_means_no_dependency() {
        let m = Manifest::from_yaml("components:\n  - id: a\n    type: yaml\n    needs: \"\"\n").unwrap();
        assert!(m.components[0].needs.is_empty());
    }

    #[test]
    fn check_namespace_falls_back_to_component() {
        let c = Component::new("x", ComponentType::Helm).in_namespace("owner");
        let own = Check { kind: CheckType::Pod, selector: "a=b".into(), namespace: None };
        let other = Check { kind: CheckType::Pod, selector: "a=b".into(), namespace: Some("elsewhere".into()) };
        let blank = Check { kind: CheckType::Pod, selector: "a=b".into(), namespace: Some(String::new()) };
        assert_eq!(own.resolve_namespace(&c), "owner");
        assert_eq!(other.resolve_namespace(&c), "elsewhere");
        assert_eq!(blank.resolve_namespace(&c), "owner");
    }

    #[test]
    fn validate_rejects_empty_id_and_cycles() {
        let m = Manifest::from_yaml("components:\n  - id: \"\"\n    type: yaml\n").unwrap();
        assert!(matches!(m.validate(), Err(ManifestError::EmptyId { index: 0 })));

        let cyclic = Manifest {
            components: vec![
                Component::new("a", ComponentType::Yaml).needing("b"),
                Component::new("b", ComponentType::Yaml).needing("a"),
            ],
        };
        assert!(matches!(cyclic.validate(), Err(ManifestError::Plan(PlanError::Cycle { .. }))));
    }

    #[test]
    fn load_reports_missing_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yml");
        let err = Manifest::load(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.yml"), "err={}", err);
    }

    #[test]
    fn leaves_are_components_nobody_needs() {
        let m = Manifest::from_yaml(SAMPLE).unwrap();
        assert_eq!(m.leaves(), vec!["epinio"]);
    }
}
