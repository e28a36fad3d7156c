//! Non-failing dependency graph analysis.

use gantry_core::PluginMetadata;
use std::collections::{BTreeMap, HashMap};

/// Forward and reverse dependency views over a plugin set.
///
/// Unlike [`resolve`](crate::resolve), analysis never fails: unknown
/// dependencies simply appear as edges with no node of their own.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `name -> plugins it depends on`.
    pub forward: BTreeMap<String, Vec<String>>,
    /// `name -> plugins depending on it`.
    pub reverse: BTreeMap<String, Vec<String>>,
    /// Plugins with no dependencies.
    pub roots: Vec<String>,
    /// Plugins no other plugin depends on.
    pub leaves: Vec<String>,
}

/// Build forward/reverse graphs plus roots and leaves.
#[must_use]
pub fn analyze(plugins: &HashMap<String, PluginMetadata>) -> DependencyGraph {
    let mut graph = DependencyGraph::default();

    for (name, meta) in plugins {
        let mut deps = meta.dependencies.clone();
        deps.sort();
        graph.reverse.entry(name.clone()).or_default();
        for dep in &deps {
            graph.reverse.entry(dep.clone()).or_default().push(name.clone());
        }
        graph.forward.insert(name.clone(), deps);
    }
    for dependents in graph.reverse.values_mut() {
        dependents.sort();
    }

    graph.roots = graph
        .forward
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    graph.leaves = graph
        .reverse
        .iter()
        .filter(|(name, dependents)| dependents.is_empty() && plugins.contains_key(*name))
        .map(|(name, _)| name.clone())
        .collect();

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Version;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn meta(name: &str, deps: &[&str]) -> PluginMetadata {
        PluginMetadata {
            name: name.to_string(),
            version: Version::parse("1.0").unwrap(),
            description: None,
            author: None,
            main: name.to_string(),
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            extension_points: Vec::new(),
            extensions: Vec::new(),
            source: PathBuf::new(),
        }
    }

    #[test]
    fn roots_and_leaves() {
        let plugins: HashMap<String, PluginMetadata> = [
            ("core".to_string(), meta("core", &[])),
            ("db".to_string(), meta("db", &["core"])),
            ("app".to_string(), meta("app", &["db"])),
        ]
        .into();

        let graph = analyze(&plugins);
        assert_eq!(graph.roots, vec!["core"]);
        assert_eq!(graph.leaves, vec!["app"]);
        assert_eq!(graph.forward["app"], vec!["db"]);
        assert_eq!(graph.reverse["core"], vec!["db"]);
    }

    #[test]
    fn unknown_dependency_does_not_fail() {
        let plugins: HashMap<String, PluginMetadata> =
            [("a".to_string(), meta("a", &["ghost"]))].into();
        let graph = analyze(&plugins);
        assert_eq!(graph.forward["a"], vec!["ghost"]);
        // ghost is an edge target, not a plugin, so it is not a leaf
        assert_eq!(graph.leaves, vec!["a"]);
    }
}
