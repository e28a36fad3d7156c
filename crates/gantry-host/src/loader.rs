//! Plugin loading with staged copies.
//!
//! Bundles are never opened for execution in place: the loader copies
//! each bundle into a host-owned staging directory (so the source file
//! stays replaceable), extracts any native payload next to it, and
//! builds an isolated [`PluginNamespace`] rooted at the staged copy.
//! Teardown deletes the staged files and drops the namespace handle.

use crate::api::Plugin;
use crate::extensions::{Extension, ExtensionManager};
use crate::namespace::{BuiltinFactories, DESCRIPTOR_SYMBOL, DescriptorFn, PluginNamespace};
use dashmap::DashMap;
use gantry_core::{BUNDLE_EXTENSION, Bundle, Error, PluginMetadata, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Staging directory statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempStats {
    /// Files currently staged.
    pub files: usize,
    /// Total staged bytes.
    pub bytes: u64,
    /// The staging directory.
    pub dir: PathBuf,
}

struct StagingEntry {
    namespace: Arc<PluginNamespace>,
    staged_files: Vec<PathBuf>,
    created_at: SystemTime,
}

/// Loads plugins from bundles into isolated namespaces.
///
/// Owns the staging directory and every namespace handle.
pub struct PluginLoader {
    staging_dir: PathBuf,
    table: DashMap<String, StagingEntry>,
    counter: AtomicU64,
    builtins: Arc<BuiltinFactories>,
    extensions: Arc<ExtensionManager>,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("staging_dir", &self.staging_dir)
            .field("staged", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// Create a loader staging into `staging_dir`.
    #[must_use]
    pub fn new(staging_dir: impl Into<PathBuf>, extensions: Arc<ExtensionManager>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            table: DashMap::new(),
            counter: AtomicU64::new(0),
            builtins: Arc::new(BuiltinFactories::default()),
            extensions,
        }
    }

    /// Register an embedded plugin constructor, used when a bundle has
    /// no native payload.
    pub fn register_builtin_plugin(
        &self,
        entry: &str,
        factory: impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    ) {
        self.builtins.register_plugin(entry, factory);
    }

    /// Register an embedded extension constructor.
    pub fn register_builtin_extension(
        &self,
        entry: &str,
        factory: impl Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    ) {
        self.builtins.register_extension(entry, factory);
    }

    /// Read a bundle's metadata without linking its code into a
    /// long-lived namespace.
    ///
    /// Prefers the manifest; falls back to the descriptor symbol of the
    /// native payload, probed in a throwaway namespace that is closed
    /// immediately.
    pub fn load_metadata(&self, bundle_path: &Path) -> Result<PluginMetadata> {
        let mut bundle = Bundle::open(bundle_path)?;
        if let Some(metadata) = bundle.metadata()? {
            return Ok(metadata);
        }
        self.probe_descriptor(&mut bundle, bundle_path)
    }

    /// Load a plugin: stage the bundle, build its namespace, construct
    /// the entry instance, and register declared extensions.
    pub fn load_plugin(
        &self,
        bundle_path: &Path,
        metadata: &PluginMetadata,
    ) -> Result<(Arc<dyn Plugin>, Arc<PluginNamespace>)> {
        // A stale staging for the same name would pin the old code.
        self.cleanup(&metadata.name);

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| Error::io(&self.staging_dir, e))?;

        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let staged_bundle = self
            .staging_dir
            .join(format!("{}_{serial}.{BUNDLE_EXTENSION}", metadata.name));
        std::fs::copy(bundle_path, &staged_bundle).map_err(|e| Error::io(&staged_bundle, e))?;
        let mut staged_files = vec![staged_bundle.clone()];

        let namespace = match self.build_namespace(
            &staged_bundle,
            &metadata.name,
            serial,
            &mut staged_files,
        ) {
            Ok(namespace) => Arc::new(namespace),
            Err(e) => {
                remove_files(&staged_files);
                return Err(e);
            }
        };

        let instance: Arc<dyn Plugin> = match namespace.instantiate(&metadata.main) {
            Ok(instance) => Arc::from(instance),
            Err(e) => {
                drop(namespace);
                remove_files(&staged_files);
                return Err(e);
            }
        };

        for point in &metadata.extension_points {
            if let Err(e) = self.extensions.register_extension_point(point) {
                warn!(plugin = %metadata.name, point, error = %e, "cannot register extension point");
            }
        }
        self.extensions
            .register_extensions(&metadata.name, &namespace, &metadata.extensions);

        self.table.insert(
            metadata.name.clone(),
            StagingEntry {
                namespace: Arc::clone(&namespace),
                staged_files,
                created_at: SystemTime::now(),
            },
        );
        info!(
            plugin = %metadata.name,
            version = %metadata.version,
            staged = %staged_bundle.display(),
            native = namespace.is_native(),
            "plugin loaded"
        );
        Ok((instance, namespace))
    }

    /// Namespace handle for a loaded plugin.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<Arc<PluginNamespace>> {
        self.table.get(name).map(|entry| Arc::clone(&entry.namespace))
    }

    /// Tear down a plugin's staging: close the namespace and delete the
    /// staged files. Safe when the name is absent.
    pub fn cleanup(&self, name: &str) {
        let Some((_, entry)) = self.table.remove(name) else {
            return;
        };
        // Drop the namespace handle before deleting files so the native
        // library releases its file handle first.
        drop(entry.namespace);
        remove_files(&entry.staged_files);
        debug!(plugin = name, "staging cleaned up");
    }

    /// Tear down every plugin and remove the staging directory.
    pub fn cleanup_all(&self) {
        let names: Vec<String> = self.table.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.cleanup(&name);
        }
        if self.staging_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.staging_dir)
        {
            warn!(dir = %self.staging_dir.display(), error = %e, "cannot remove staging directory");
        }
    }

    /// Tear down stagings older than `age`. Returns how many were
    /// removed.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let cutoff = SystemTime::now() - age;
        let stale: Vec<String> = self
            .table
            .iter()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for name in stale {
            self.cleanup(&name);
        }
        count
    }

    /// File count and byte total of the staging directory.
    #[must_use]
    pub fn temp_stats(&self) -> TempStats {
        let mut stats = TempStats {
            files: 0,
            bytes: 0,
            dir: self.staging_dir.clone(),
        };
        if let Ok(entries) = std::fs::read_dir(&self.staging_dir) {
            for entry in entries.filter_map(std::result::Result::ok) {
                if let Ok(meta) = entry.metadata()
                    && meta.is_file()
                {
                    stats.files += 1;
                    stats.bytes += meta.len();
                }
            }
        }
        stats
    }

    fn build_namespace(
        &self,
        staged_bundle: &Path,
        name: &str,
        serial: u64,
        staged_files: &mut Vec<PathBuf>,
    ) -> Result<PluginNamespace> {
        let mut bundle = Bundle::open(staged_bundle)?;
        match bundle.dylib_entry() {
            Some(entry) => {
                let dylib_path = self.staging_dir.join(format!(
                    "{name}_{serial}.{}",
                    std::env::consts::DLL_EXTENSION
                ));
                bundle.extract_entry(&entry, &dylib_path)?;
                staged_files.push(dylib_path.clone());
                // Library handles are private to the namespace:
                // child-first resolution, no symbol leaks across plugins.
                let library = unsafe { libloading::Library::new(&dylib_path) }.map_err(|e| {
                    Error::load(staged_bundle, format!("cannot open native payload: {e}"))
                })?;
                Ok(PluginNamespace::native(library, staged_bundle.to_path_buf()))
            }
            None => Ok(PluginNamespace::builtin(
                Arc::clone(&self.builtins),
                staged_bundle.to_path_buf(),
            )),
        }
    }

    fn probe_descriptor(
        &self,
        bundle: &mut Bundle,
        bundle_path: &Path,
    ) -> Result<PluginMetadata> {
        let Some(entry) = bundle.dylib_entry() else {
            return Err(Error::metadata(
                bundle_path,
                "bundle has no manifest and no native payload to probe",
            ));
        };

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| Error::io(&self.staging_dir, e))?;
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let probe_path = self.staging_dir.join(format!(
            ".probe_{serial}.{}",
            std::env::consts::DLL_EXTENSION
        ));
        bundle.extract_entry(&entry, &probe_path)?;

        let result = unsafe {
            libloading::Library::new(&probe_path)
                .map_err(|e| {
                    Error::metadata(bundle_path, format!("cannot open native payload: {e}"))
                })
                .and_then(|library| {
                    let descriptor = library.get::<DescriptorFn>(DESCRIPTOR_SYMBOL).map_err(|e| {
                        Error::metadata(bundle_path, format!("no descriptor symbol: {e}"))
                    })?;
                    let raw = descriptor();
                    if raw.is_null() {
                        return Err(Error::metadata(bundle_path, "descriptor returned null"));
                    }
                    let mut metadata = *Box::from_raw(raw);
                    metadata.source = bundle_path.to_path_buf();
                    Ok(metadata)
                    // The throwaway library closes here, before the
                    // probe file is deleted.
                })
        };
        if let Err(e) = std::fs::remove_file(&probe_path) {
            warn!(file = %probe_path.display(), error = %e, "cannot remove probe file");
        }
        result
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

fn remove_files(files: &[PathBuf]) {
    for file in files {
        if file.exists()
            && let Err(e) = std::fs::remove_file(file)
        {
            warn!(file = %file.display(), error = %e, "cannot remove staged file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    struct NoopPlugin;
    impl Plugin for NoopPlugin {}

    fn write_bundle(dir: &Path, file: &str, manifest: &str) -> PathBuf {
        let path = dir.join(file);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("plugin.ini", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        writer.finish().unwrap();
        path
    }

    fn loader(root: &Path) -> PluginLoader {
        PluginLoader::new(root.join("staging"), Arc::new(ExtensionManager::new()))
    }

    #[test]
    fn metadata_from_manifest() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=demo.Main\n",
        );

        let loader = loader(dir.path());
        let meta = loader.load_metadata(&bundle).unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.source, bundle);
    }

    #[test]
    fn metadata_missing_everywhere_fails() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(dir.path(), "raw.gpk", "");
        // Empty manifest text still parses but misses required fields.
        let loader = loader(dir.path());
        assert!(matches!(
            loader.load_metadata(&bundle),
            Err(Error::Metadata { .. })
        ));
    }

    #[test]
    fn load_stages_and_cleanup_removes() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=demo.Main\n",
        );

        let loader = loader(dir.path());
        loader.register_builtin_plugin("demo.Main", || Box::new(NoopPlugin));

        let meta = loader.load_metadata(&bundle).unwrap();
        let (_instance, namespace) = loader.load_plugin(&bundle, &meta).unwrap();
        assert!(!namespace.is_native());
        assert!(namespace.root().exists());
        assert_eq!(loader.temp_stats().files, 1);

        loader.cleanup("demo");
        assert_eq!(loader.temp_stats().files, 0);
        assert!(!namespace.root().exists());
        assert!(loader.namespace("demo").is_none());

        // Absent name is safe.
        loader.cleanup("demo");
    }

    #[test]
    fn reload_replaces_staging() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=demo.Main\n",
        );

        let loader = loader(dir.path());
        loader.register_builtin_plugin("demo.Main", || Box::new(NoopPlugin));
        let meta = loader.load_metadata(&bundle).unwrap();

        let (_a, ns_a) = loader.load_plugin(&bundle, &meta).unwrap();
        let (_b, ns_b) = loader.load_plugin(&bundle, &meta).unwrap();
        assert_ne!(ns_a.root(), ns_b.root());
        // Only the second staging remains.
        assert_eq!(loader.temp_stats().files, 1);
    }

    #[test]
    fn unknown_entry_cleans_staging() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=ghost.Main\n",
        );

        let loader = loader(dir.path());
        let meta = loader.load_metadata(&bundle).unwrap();
        assert!(loader.load_plugin(&bundle, &meta).is_err());
        assert_eq!(loader.temp_stats().files, 0);
        assert!(loader.namespace("demo").is_none());
    }

    #[test]
    fn cleanup_older_than_age() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=demo.Main\n",
        );

        let loader = loader(dir.path());
        loader.register_builtin_plugin("demo.Main", || Box::new(NoopPlugin));
        let meta = loader.load_metadata(&bundle).unwrap();
        loader.load_plugin(&bundle, &meta).unwrap();

        assert_eq!(loader.cleanup_older_than(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(loader.cleanup_older_than(Duration::from_millis(1)), 1);
        assert_eq!(loader.temp_stats().files, 0);
    }

    #[test]
    fn cleanup_all_removes_staging_dir() {
        let dir = TempDir::new().unwrap();
        let bundle = write_bundle(
            dir.path(),
            "demo.gpk",
            "name=demo\nversion=1.0\nmain=demo.Main\n",
        );

        let loader = loader(dir.path());
        loader.register_builtin_plugin("demo.Main", || Box::new(NoopPlugin));
        let meta = loader.load_metadata(&bundle).unwrap();
        loader.load_plugin(&bundle, &meta).unwrap();

        loader.cleanup_all();
        assert!(!dir.path().join("staging").exists());
    }
}
