//! Plan manifest loading
//!
//! The graph-construction step (an external collaborator) emits a YAML
//! manifest of features. Loading instantiates Feature records under a
//! project id and validates the dependency graph before anything runs.

use std::collections::HashMap;
use std::path::Path;

use eyre::{Context, Result};
use serde::Deserialize;

use crate::domain::{Criterion, Feature, Priority, Tier};
use crate::graph::{FeatureGraph, GraphError};

/// A plan manifest as produced by the planning step
#[derive(Debug, Deserialize)]
pub struct Manifest {
    /// Project name (defaults to the manifest file stem)
    pub project: Option<String>,

    pub features: Vec<ManifestFeature>,
}

/// One feature entry in a manifest
#[derive(Debug, Deserialize)]
pub struct ManifestFeature {
    /// Unique name within the manifest; dependencies refer to it
    pub name: String,

    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    /// Names of features that must complete first
    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub criteria: Vec<ManifestCriterion>,
}

/// One acceptance criterion in a manifest
#[derive(Debug, Deserialize)]
pub struct ManifestCriterion {
    pub text: String,

    #[serde(default)]
    pub tier: Tier,
}

/// Load a manifest from a YAML file
pub fn load(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).context(format!("Failed to read manifest {}", path.display()))?;
    let manifest: Manifest =
        serde_yaml::from_str(&content).context(format!("Failed to parse manifest {}", path.display()))?;
    if manifest.features.is_empty() {
        eyre::bail!("manifest {} declares no features", path.display());
    }
    Ok(manifest)
}

impl Manifest {
    /// Instantiate Feature records under a project id
    ///
    /// Resolves name-based dependencies to feature ids and validates the
    /// resulting graph (duplicates, unknown deps, cycles) so a bad plan is
    /// rejected here, before any record is persisted.
    pub fn instantiate(&self, project_id: &str) -> Result<Vec<Feature>, GraphError> {
        let mut by_name: HashMap<&str, String> = HashMap::new();
        for entry in &self.features {
            if by_name.contains_key(entry.name.as_str()) {
                return Err(GraphError::DuplicateUnit(entry.name.clone()));
            }
            let feature = Feature::new(project_id, &entry.name, "");
            by_name.insert(entry.name.as_str(), feature.id);
        }

        let mut features = Vec::with_capacity(self.features.len());
        for entry in &self.features {
            let mut feature = Feature::new(project_id, &entry.name, &entry.description);
            feature.id = by_name[entry.name.as_str()].clone();
            feature.priority = entry.priority;
            for criterion in &entry.criteria {
                feature.add_criterion(Criterion::new(&criterion.text, criterion.tier));
            }
            for dep_name in &entry.deps {
                let dep_id = by_name.get(dep_name.as_str()).ok_or_else(|| GraphError::MissingDependency {
                    unit: entry.name.clone(),
                    dep: dep_name.clone(),
                })?;
                feature.add_dependency(dep_id.clone());
            }
            features.push(feature);
        }

        // Whole-graph validation (cycles included) before anything persists
        FeatureGraph::from_features(features.clone())?;
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "
project: breakout
features:
  - name: paddle
    description: Player paddle with keyboard movement
    priority: high
    criteria:
      - text: paddle moves left and right
        tier: behavior
      - text: paddle stays inside the field
  - name: ball
    description: Ball physics and wall bounces
    deps: [paddle]
    criteria:
      - text: ball bounces off walls
        tier: logic
      - text: ball render looks smooth
        tier: appearance
";

    #[test]
    fn test_parse_manifest() {
        let manifest: Manifest = serde_yaml::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.project.as_deref(), Some("breakout"));
        assert_eq!(manifest.features.len(), 2);
        assert_eq!(manifest.features[0].priority, Priority::High);
        // Untagged criteria default to the logic tier
        assert_eq!(manifest.features[0].criteria[1].tier, Tier::Logic);
        assert_eq!(manifest.features[1].criteria[1].tier, Tier::Appearance);
    }

    #[test]
    fn test_instantiate_resolves_deps() {
        let manifest: Manifest = serde_yaml::from_str(MANIFEST).unwrap();
        let features = manifest.instantiate("proj-1").unwrap();
        assert_eq!(features.len(), 2);

        let paddle = features.iter().find(|f| f.name == "paddle").unwrap();
        let ball = features.iter().find(|f| f.name == "ball").unwrap();
        assert_eq!(ball.deps, vec![paddle.id.clone()]);
        assert_eq!(paddle.project, "proj-1");
        assert_eq!(paddle.criteria.len(), 2);
    }

    #[test]
    fn test_instantiate_rejects_unknown_dep() {
        let yaml = "
features:
  - name: a
    description: thing
    deps: [ghost]
";
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let result = manifest.instantiate("proj");
        assert!(matches!(result, Err(GraphError::MissingDependency { .. })));
    }

    #[test]
    fn test_instantiate_rejects_duplicate_names() {
        let yaml = "
features:
  - name: a
    description: first
  - name: a
    description: second
";
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let result = manifest.instantiate("proj");
        assert!(matches!(result, Err(GraphError::DuplicateUnit(_))));
    }

    #[test]
    fn test_instantiate_rejects_cycle() {
        let yaml = "
features:
  - name: a
    description: x
    deps: [b]
  - name: b
    description: y
    deps: [a]
";
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        let result = manifest.instantiate("proj");
        assert!(matches!(result, Err(GraphError::CyclePath { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load(Path::new("/nonexistent/plan.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_empty_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(&path, "features: []\n").unwrap();
        assert!(load(&path).is_err());
    }
}
