//! Bundle archive access.
//!
//! A bundle is a zip archive (`.gpk`) carrying plugin code and a
//! [`MANIFEST_NAME`](crate::MANIFEST_NAME) manifest at the archive root.
//! Native bundles additionally contain a dynamic library entry.

use crate::error::{Error, Result};
use crate::manifest::MANIFEST_NAME;
use crate::metadata::PluginMetadata;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::ZipArchive;
use zip::result::ZipError;

/// Default bundle file extension.
pub const BUNDLE_EXTENSION: &str = "gpk";

/// An open bundle archive.
pub struct Bundle {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish()
    }
}

impl Bundle {
    /// Open a bundle archive.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let archive = ZipArchive::new(file)
            .map_err(|e| Error::metadata(path, format!("unreadable bundle archive: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    /// Whether a path looks like a bundle file.
    #[must_use]
    pub fn is_bundle(path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(BUNDLE_EXTENSION))
    }

    /// Bundle path on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry names in archive order.
    #[must_use]
    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(String::from).collect()
    }

    /// Read the manifest text, or `None` when the bundle has no manifest.
    pub fn manifest_text(&mut self) -> Result<Option<String>> {
        let mut entry = match self.archive.by_name(MANIFEST_NAME) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => {
                return Err(Error::metadata(
                    &self.path,
                    format!("cannot read {MANIFEST_NAME}: {e}"),
                ));
            }
        };
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .map_err(|e| Error::metadata(&self.path, format!("cannot read {MANIFEST_NAME}: {e}")))?;
        Ok(Some(text))
    }

    /// Parse plugin metadata from the manifest, or `None` when absent
    /// (callers may fall back to a descriptor probe).
    pub fn metadata(&mut self) -> Result<Option<PluginMetadata>> {
        let path = self.path.clone();
        match self.manifest_text()? {
            Some(text) => PluginMetadata::from_manifest(&text, &path).map(Some),
            None => Ok(None),
        }
    }

    /// First entry carrying the platform dynamic-library extension.
    #[must_use]
    pub fn dylib_entry(&self) -> Option<String> {
        let suffix = format!(".{}", std::env::consts::DLL_EXTENSION);
        self.archive
            .file_names()
            .find(|name| name.ends_with(&suffix))
            .map(String::from)
    }

    /// Extract a single entry to `dest`.
    pub fn extract_entry(&mut self, name: &str, dest: &Path) -> Result<()> {
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|e| Error::load(&self.path, format!("missing bundle entry '{name}': {e}")))?;
        let mut out = File::create(dest).map_err(|e| Error::io(dest, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| Error::io(dest, e))?;
        Ok(())
    }

    /// Convenience: open a bundle and read its manifest metadata.
    pub fn read_metadata(path: &Path) -> Result<Option<PluginMetadata>> {
        Self::open(path)?.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_bundle(dir: &Path, file: &str, manifest: Option<&str>) -> PathBuf {
        let path = dir.join(file);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        if let Some(text) = manifest {
            writer
                .start_file(MANIFEST_NAME, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(text.as_bytes()).unwrap();
        }
        writer
            .start_file("payload.bin", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"data").unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn reads_manifest_metadata() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(
            dir.path(),
            "demo.gpk",
            Some("name=demo\nversion=0.3\nmain=demo.Entry\n"),
        );

        let meta = Bundle::read_metadata(&path).unwrap().unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.version.as_str(), "0.3");
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path(), "raw.gpk", None);
        assert!(Bundle::read_metadata(&path).unwrap().is_none());
    }

    #[test]
    fn extension_filter() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path(), "demo.gpk", None);
        assert!(Bundle::is_bundle(&path));
        assert!(!Bundle::is_bundle(&dir.path().join("absent.gpk")));
        assert!(!Bundle::is_bundle(dir.path()));
    }

    #[test]
    fn extract_entry_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path(), "demo.gpk", None);
        let dest = dir.path().join("out.bin");

        let mut bundle = Bundle::open(&path).unwrap();
        bundle.extract_entry("payload.bin", &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");

        assert!(bundle.extract_entry("nope", &dest).is_err());
    }

    #[test]
    fn unreadable_archive_is_metadata_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.gpk");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(
            Bundle::open(&path).unwrap_err(),
            Error::Metadata { .. }
        ));
    }
}
