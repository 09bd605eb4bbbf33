//! FeatureGraph implementation
//!
//! The graph is a plain map of features with dependency ids embedded in
//! each record. The ready set is a pure query over current statuses:
//! completing a feature never writes to its dependents, so there is no
//! cached eligibility flag to keep consistent. The scan is O(units * deps)
//! per call, fine at the tens-to-hundreds scale these graphs run at.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::domain::{Feature, FeatureStatus};

/// Errors from graph construction and mutation
///
/// All of these are fatal at load time: a graph that fails validation is
/// never scheduled.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("adding dependency {unit} -> {dep} would create a cycle")]
    Cycle { unit: String, dep: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CyclePath { path: Vec<String> },

    #[error("duplicate unit: {0}")]
    DuplicateUnit(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("unit {unit} depends on missing unit {dep}")]
    MissingDependency { unit: String, dep: String },
}

/// Dependency graph over features
///
/// Keyed by feature id in a BTreeMap so iteration order (and therefore
/// tie-breaking) is deterministic.
#[derive(Debug, Default)]
pub struct FeatureGraph {
    units: BTreeMap<String, Feature>,
}

impl FeatureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a snapshot of features, validating it whole:
    /// duplicates, missing dependencies, and cycles all fail fast here,
    /// before anything is claimed.
    pub fn from_features(features: impl IntoIterator<Item = Feature>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for feature in features {
            graph.add_unit(feature)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a unit to the graph
    pub fn add_unit(&mut self, feature: Feature) -> Result<(), GraphError> {
        if self.units.contains_key(&feature.id) {
            return Err(GraphError::DuplicateUnit(feature.id));
        }
        self.units.insert(feature.id.clone(), feature);
        Ok(())
    }

    /// Add a dependency edge `unit -> dep`
    ///
    /// The reachability check runs before insertion: if `unit` is already
    /// reachable from `dep` the edge would close a cycle, and the graph is
    /// left unchanged.
    pub fn add_dependency(&mut self, unit: &str, dep: &str) -> Result<(), GraphError> {
        if !self.units.contains_key(unit) {
            return Err(GraphError::UnknownUnit(unit.to_string()));
        }
        if !self.units.contains_key(dep) {
            return Err(GraphError::UnknownUnit(dep.to_string()));
        }
        if unit == dep || self.reaches(dep, unit) {
            return Err(GraphError::Cycle {
                unit: unit.to_string(),
                dep: dep.to_string(),
            });
        }

        // Insertion only happens once the edge is known safe
        if let Some(feature) = self.units.get_mut(unit) {
            feature.deps.push(dep.to_string());
        }
        Ok(())
    }

    /// Whether `to` is reachable from `from` along dependency edges
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(feature) = self.units.get(node) {
                for dep in &feature.deps {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    /// Validate the whole graph: every dependency resolves and no cycles
    pub fn validate(&self) -> Result<(), GraphError> {
        for feature in self.units.values() {
            for dep in &feature.deps {
                if !self.units.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        unit: feature.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for id in self.units.keys() {
            if !visited.contains(id.as_str())
                && self.has_cycle_dfs(id, &mut visited, &mut rec_stack, &mut path)
            {
                return Err(GraphError::CyclePath { path });
            }
        }
        Ok(())
    }

    fn has_cycle_dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node.to_string());

        if let Some(feature) = self.units.get(node) {
            for dep in &feature.deps {
                if !visited.contains(dep.as_str()) {
                    if self.units.contains_key(dep.as_str())
                        && self.has_cycle_dfs(dep.as_str(), visited, rec_stack, path)
                    {
                        return true;
                    }
                } else if rec_stack.contains(dep.as_str()) {
                    path.push(dep.clone());
                    return true;
                }
            }
        }

        rec_stack.remove(node);
        path.pop();
        false
    }

    /// Pending units whose every dependency is Completed, ordered by
    /// priority descending then id ascending
    ///
    /// Pure query over the snapshot; no writes anywhere.
    pub fn ready_units(&self) -> Vec<&Feature> {
        let completed: Vec<&str> = self
            .units
            .values()
            .filter(|f| f.status == FeatureStatus::Completed)
            .map(|f| f.id.as_str())
            .collect();

        let mut ready: Vec<&Feature> = self
            .units
            .values()
            .filter(|f| f.is_ready(&completed))
            .collect();

        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    /// Pending units that can never become ready because a transitive
    /// dependency is terminally Failed
    pub fn blocked_units(&self) -> Vec<&Feature> {
        self.units
            .values()
            .filter(|f| f.status == FeatureStatus::Pending && self.has_failed_ancestor(&f.id))
            .collect()
    }

    fn has_failed_ancestor(&self, id: &str) -> bool {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(feature) = self.units.get(node) {
                if feature.status == FeatureStatus::Failed {
                    return true;
                }
                for dep in &feature.deps {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.units.get(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &Feature> {
        self.units.values()
    }

    /// All units are Completed or Failed
    pub fn all_terminal(&self) -> bool {
        self.units.values().all(|f| f.is_terminal())
    }
}
