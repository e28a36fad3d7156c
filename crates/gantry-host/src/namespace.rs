//! Isolated plugin namespaces.
//!
//! Each loaded plugin owns a namespace through which its entry
//! identifiers resolve to code. Two backings exist:
//!
//! - **Native**: a dynamic library handle opened on the staged dylib
//!   extracted from the bundle. The handle is private to the namespace
//!   (child-first: plugin symbols never leak into the host), and
//!   dropping the namespace closes it, invalidating the plugin's code
//!   once live instances are gone.
//! - **Builtin**: a factory table for embedded and test plugins with no
//!   native payload.

use crate::api::Plugin;
use crate::extensions::Extension;
use gantry_core::{Error, PluginMetadata, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Symbol signature for plugin constructors exported by native bundles.
pub type PluginCtor = unsafe extern "C" fn() -> *mut dyn Plugin;

/// Symbol signature for extension constructors.
pub type ExtensionCtor = unsafe extern "C" fn() -> *mut dyn Extension;

/// Symbol signature for the metadata descriptor fallback.
pub type DescriptorFn = unsafe extern "C" fn() -> *mut PluginMetadata;

/// Exported symbol consulted when a bundle carries no manifest.
pub const DESCRIPTOR_SYMBOL: &[u8] = b"gantry_plugin_descriptor";

type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;
type ExtensionFactory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// Factory table backing builtin (non-native) namespaces.
#[derive(Default)]
pub struct BuiltinFactories {
    plugins: RwLock<HashMap<String, PluginFactory>>,
    extensions: RwLock<HashMap<String, ExtensionFactory>>,
}

impl std::fmt::Debug for BuiltinFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinFactories")
            .field("plugins", &self.plugins.read().len())
            .field("extensions", &self.extensions.read().len())
            .finish()
    }
}

impl BuiltinFactories {
    /// Register a zero-arg plugin constructor for an entry identifier.
    pub fn register_plugin(
        &self,
        entry: &str,
        factory: impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    ) {
        self.plugins
            .write()
            .insert(entry.to_string(), Arc::new(factory));
    }

    /// Register a zero-arg extension constructor for an entry identifier.
    pub fn register_extension(
        &self,
        entry: &str,
        factory: impl Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    ) {
        self.extensions
            .write()
            .insert(entry.to_string(), Arc::new(factory));
    }
}

enum Backing {
    Native(libloading::Library),
    Builtin(Arc<BuiltinFactories>),
}

/// A plugin's private code-resolution scope.
pub struct PluginNamespace {
    backing: Backing,
    root: PathBuf,
}

impl std::fmt::Debug for PluginNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginNamespace")
            .field("root", &self.root)
            .field("native", &self.is_native())
            .finish()
    }
}

impl PluginNamespace {
    /// Wrap a freshly opened dynamic library rooted at `root`.
    pub(crate) fn native(library: libloading::Library, root: PathBuf) -> Self {
        Self {
            backing: Backing::Native(library),
            root,
        }
    }

    /// Create a builtin namespace over a factory table.
    pub(crate) fn builtin(factories: Arc<BuiltinFactories>, root: PathBuf) -> Self {
        Self {
            backing: Backing::Builtin(factories),
            root,
        }
    }

    /// The staged file this namespace is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the namespace holds a native library handle.
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.backing, Backing::Native(_))
    }

    /// Resolve an entry identifier and construct the plugin via its
    /// zero-arg constructor.
    pub fn instantiate(&self, entry: &str) -> Result<Box<dyn Plugin>> {
        trace!(entry, root = %self.root.display(), "instantiating plugin entry");
        match &self.backing {
            Backing::Builtin(factories) => factories
                .plugins
                .read()
                .get(entry)
                .map(|factory| factory())
                .ok_or_else(|| {
                    Error::load(&self.root, format!("no constructor for entry '{entry}'"))
                }),
            Backing::Native(library) => unsafe {
                let symbol = symbol_name(entry);
                let ctor = library.get::<PluginCtor>(&symbol).map_err(|e| {
                    Error::load(&self.root, format!("cannot resolve entry '{entry}': {e}"))
                })?;
                let raw = ctor();
                if raw.is_null() {
                    return Err(Error::load(
                        &self.root,
                        format!("entry '{entry}' constructor returned null"),
                    ));
                }
                Ok(Box::from_raw(raw))
            },
        }
    }

    /// Resolve an extension entry identifier and construct it.
    pub fn instantiate_extension(&self, entry: &str) -> Result<Arc<dyn Extension>> {
        match &self.backing {
            Backing::Builtin(factories) => factories
                .extensions
                .read()
                .get(entry)
                .map(|factory| factory())
                .ok_or_else(|| {
                    Error::load(
                        &self.root,
                        format!("no extension constructor for entry '{entry}'"),
                    )
                }),
            Backing::Native(library) => unsafe {
                let symbol = symbol_name(entry);
                let ctor = library.get::<ExtensionCtor>(&symbol).map_err(|e| {
                    Error::load(
                        &self.root,
                        format!("cannot resolve extension '{entry}': {e}"),
                    )
                })?;
                let raw = ctor();
                if raw.is_null() {
                    return Err(Error::load(
                        &self.root,
                        format!("extension '{entry}' constructor returned null"),
                    ));
                }
                Ok(Arc::from(Box::from_raw(raw)))
            },
        }
    }
}

/// Map an entry identifier to its exported symbol name: non-alphanumeric
/// characters become underscores.
fn symbol_name(entry: &str) -> Vec<u8> {
    entry
        .bytes()
        .map(|b| if b.is_ascii_alphanumeric() { b } else { b'_' })
        .collect()
}

#[cfg(test)]
impl PluginNamespace {
    pub(crate) fn builtin_for_tests() -> Self {
        Self::builtin(Arc::new(BuiltinFactories::default()), PathBuf::new())
    }

    pub(crate) fn register_extension_factory(
        &self,
        entry: &str,
        factory: impl Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    ) {
        if let Backing::Builtin(factories) = &self.backing {
            factories.register_extension(entry, factory);
        }
    }
}
