//! Depth-first topological ordering with cycle detection.

use gantry_core::{Error, PluginMetadata, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Order plugins so every name appears after all of its transitive
/// dependencies.
///
/// Validation runs first: a dependency absent from `plugins` fails with
/// [`Error::MissingDependency`] before any ordering work. A cycle fails
/// with [`Error::CircularDependency`] carrying the cycle path. Peers at
/// equal depth are visited in ascending name order for determinism.
pub fn resolve(plugins: &HashMap<String, PluginMetadata>) -> Result<Vec<String>> {
    validate(plugins)?;

    let mut resolved = Vec::with_capacity(plugins.len());
    let mut resolving = Vec::new();
    let mut visited = HashSet::new();

    let mut names: Vec<&String> = plugins.keys().collect();
    names.sort();

    for name in names {
        if !visited.contains(name.as_str()) {
            visit(name, plugins, &mut resolved, &mut resolving, &mut visited)?;
        }
    }

    debug!(count = resolved.len(), "dependency order resolved");
    Ok(resolved)
}

fn validate(plugins: &HashMap<String, PluginMetadata>) -> Result<()> {
    for (name, meta) in plugins {
        for dep in &meta.dependencies {
            if !plugins.contains_key(dep) {
                return Err(Error::MissingDependency {
                    plugin: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn visit(
    name: &str,
    plugins: &HashMap<String, PluginMetadata>,
    resolved: &mut Vec<String>,
    resolving: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> Result<()> {
    if let Some(start) = resolving.iter().position(|n| n == name) {
        let mut cycle: Vec<String> = resolving[start..].to_vec();
        cycle.push(name.to_string());
        return Err(Error::CircularDependency { cycle });
    }
    if visited.contains(name) {
        return Ok(());
    }

    resolving.push(name.to_string());

    let mut deps = plugins[name].dependencies.clone();
    deps.sort();
    for dep in &deps {
        visit(dep, plugins, resolved, resolving, visited)?;
    }

    resolving.pop();
    visited.insert(name.to_string());
    resolved.push(name.to_string());
    Ok(())
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
            version: Version::parse("1.0.0").unwrap(),
            description: None,
            author: None,
            main: format!("{name}.Main"),
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            extension_points: Vec::new(),
            extensions: Vec::new(),
            source: PathBuf::from(format!("/plugins/{name}.gpk")),
        }
    }

    fn plugin_map(specs: &[(&str, &[&str])]) -> HashMap<String, PluginMetadata> {
        specs
            .iter()
            .map(|(name, deps)| ((*name).to_string(), meta(name, deps)))
            .collect()
    }

    #[test]
    fn empty_input_empty_output() {
        assert_eq!(resolve(&HashMap::new()).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn linear_chain() {
        let plugins = plugin_map(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(resolve(&plugins).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let plugins = plugin_map(&[
            ("app", &["db", "net"]),
            ("db", &["core"]),
            ("net", &["core"]),
            ("core", &[]),
        ]);
        let order = resolve(&plugins).unwrap();
        assert_eq!(order.len(), plugins.len());

        let index =
            |n: &str| order.iter().position(|x| x == n).unwrap_or_else(|| panic!("{n} missing"));
        for (name, meta) in &plugins {
            for dep in &meta.dependencies {
                assert!(index(dep) < index(name), "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn deterministic_tie_break() {
        let plugins = plugin_map(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        assert_eq!(resolve(&plugins).unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn missing_dependency() {
        let plugins = plugin_map(&[("a", &["ghost"])]);
        match resolve(&plugins).unwrap_err() {
            Error::MissingDependency { plugin, dependency } => {
                assert_eq!(plugin, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn three_cycle() {
        let plugins = plugin_map(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        match resolve(&plugins).unwrap_err() {
            Error::CircularDependency { cycle } => {
                assert_eq!(cycle.len(), 4);
                assert_eq!(cycle.first(), cycle.last());
                for name in &cycle {
                    assert!(plugins.contains_key(name));
                }
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_cycle() {
        let plugins = plugin_map(&[("a", &["a"])]);
        match resolve(&plugins).unwrap_err() {
            Error::CircularDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn diamond_has_each_name_once() {
        let plugins = plugin_map(&[
            ("top", &["left", "right"]),
            ("left", &["base"]),
            ("right", &["base"]),
            ("base", &[]),
        ]);
        let order = resolve(&plugins).unwrap();
        assert_eq!(order.len(), 4);
        let unique: std::collections::HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), 4);
    }
}
