//! Plugin metadata.

use crate::error::{Error, Result};
use crate::manifest;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Immutable description of a plugin, read from its bundle manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin identifier.
    pub name: String,
    /// Bundle version.
    pub version: Version,
    /// Human-readable description.
    pub description: Option<String>,
    /// Author string.
    pub author: Option<String>,
    /// Entry identifier inside the bundle.
    pub main: String,
    /// Names of plugins that must be loaded first.
    pub dependencies: Vec<String>,
    /// Extension point identifiers this bundle declares.
    pub extension_points: Vec<String>,
    /// Extension entry identifiers this bundle provides.
    pub extensions: Vec<String>,
    /// Path to the bundle on disk.
    pub source: PathBuf,
}

impl PluginMetadata {
    /// Parse metadata from manifest text.
    ///
    /// Required keys: `name`, `version`, `main`. Dependencies and
    /// extension lists default to empty.
    pub fn from_manifest(text: &str, source: &Path) -> Result<Self> {
        let values: HashMap<String, String> = manifest::parse_properties(text).into_iter().collect();

        let required = |key: &str| -> Result<String> {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::metadata(source, format!("missing required field '{key}'")))
        };

        let version = Version::parse(&required("version")?)
            .map_err(|e| Error::metadata(source, e.to_string()))?;

        Ok(Self {
            name: required("name")?,
            version,
            description: values.get("description").cloned(),
            author: values.get("author").cloned(),
            main: required("main")?,
            dependencies: manifest::split_list(values.get("dependencies")),
            extension_points: manifest::split_list(values.get("extension-points")),
            extensions: manifest::split_list(values.get("extensions")),
            source: source.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = "\
name=greeter
version=1.2.0
main=greeter.Main
description=Says hello
author=someone
dependencies=logging, storage
extensions=greeter.HelloCommand
";

    #[test]
    fn full_manifest() {
        let meta = PluginMetadata::from_manifest(MANIFEST, Path::new("/p/greeter.gpk")).unwrap();
        assert_eq!(meta.name, "greeter");
        assert_eq!(meta.version.as_str(), "1.2.0");
        assert_eq!(meta.main, "greeter.Main");
        assert_eq!(meta.dependencies, vec!["logging", "storage"]);
        assert_eq!(meta.extensions, vec!["greeter.HelloCommand"]);
        assert!(meta.extension_points.is_empty());
        assert_eq!(meta.source, PathBuf::from("/p/greeter.gpk"));
    }

    #[test]
    fn missing_required_field() {
        let err = PluginMetadata::from_manifest("name=x\nversion=1.0\n", Path::new("/x.gpk"))
            .unwrap_err();
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn bad_version() {
        let err =
            PluginMetadata::from_manifest("name=x\nversion=one\nmain=m\n", Path::new("/x.gpk"))
                .unwrap_err();
        assert!(matches!(err, Error::Metadata { .. }));
    }

    #[test]
    fn dependencies_default_empty() {
        let meta =
            PluginMetadata::from_manifest("name=x\nversion=1.0\nmain=m\n", Path::new("/x.gpk"))
                .unwrap();
        assert!(meta.dependencies.is_empty());
    }
}
