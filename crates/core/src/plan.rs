//! Topological ordering of a component set (Kahn's algorithm).
//!
//! The plan is used for validation and for the "planned order" log line only; the walk
//! re-derives eligibility on its own and never executes in plan order.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::manifest::Component;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate component id: {0}")]
    DuplicateId(String),
    #[error("component {component} needs unknown component {needs}")]
    UnknownDependency { component: String, needs: String },
    #[error("cycle: has edges {}", render_edges(.edges))]
    Cycle { edges: Vec<(String, String)> },
}

fn render_edges(edges: &[(String, String)]) -> String {
    edges.iter().map(|(from, to)| format!("{} -> {}", from, to)).collect::<Vec<_>>().join(", ")
}

/// Order `components` so every component comes after everything it needs.
///
/// Deterministic: the frontier is seeded in manifest order and drained first in, first out. Cycles
/// are reported with every edge that could not be removed (`child -> needed`).
pub fn build_plan(components: &[Component]) -> Result<Vec<Component>, PlanError> {
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, c) in components.iter().enumerate() {
        if index.insert(c.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateId(c.id.clone()));
        }
    }

    // Remaining incoming edges per node, deduplicated.
    let mut incoming: Vec<FxHashSet<&str>> = Vec::with_capacity(components.len());
    for c in components {
        let mut edges = FxHashSet::default();
        for need in &c.needs {
            if !index.contains_key(need.as_str()) {
                return Err(PlanError::UnknownDependency { component: c.id.clone(), needs: need.clone() });
            }
            edges.insert(need.as_str());
        }
        incoming.push(edges);
    }

    // Reverse adjacency: node -> the nodes that need it, in manifest order.
    let mut needers: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
    for (i, edges) in incoming.iter().enumerate() {
        for need in edges {
            needers[index[need]].push(i);
        }
    }
    for list in needers.iter_mut() {
        list.sort_unstable();
    }

    let mut frontier: VecDeque<usize> = (0..components.len()).filter(|&i| incoming[i].is_empty()).collect();
    let mut plan = Vec::with_capacity(components.len());

    while let Some(n) = frontier.pop_front() {
        let id = components[n].id.as_str();
        plan.push(components[n].clone());
        for &m in &needers[n] {
            if incoming[m].remove(id) && incoming[m].is_empty() {
                frontier.push_back(m);
            }
        }
    }

    if plan.len() < components.len() {
        let mut edges: Vec<(String, String)> = incoming
            .iter()
            .enumerate()
            .flat_map(|(i, set)| set.iter().map(move |need| (components[i].id.clone(), (*need).to_string())))
            .collect();
        edges.sort();
        return Err(PlanError::Cycle { edges });
    }

    Ok(plan)
}

/// Human readable planned order, e.g. `linkerd, traefik, cert-manager`.
pub fn plan_line(plan: &[Component]) -> String {
    plan.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(", ")
}
