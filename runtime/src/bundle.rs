//! Per-build working state.
//!
//! A bundle owns an exclusive directory under the configured temp dir:
//!
//! ```text
//! stratum-bundle-<uuid>/
//! ├── rootfs/          staging root filesystem
//! └── metadata.json    written on demand for debugging
//! ```
//!
//! The directory is removed when the bundle is dropped unless it was marked
//! to be kept.

use std::collections::BTreeMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::error::{BuildError, Result};
use stratum_core::IdMapping;

use crate::oci::ImageConfig;

/// Build metadata accumulated while packing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Source URI the build was started from
    pub source: String,

    /// Manifest digest, when the source has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,

    /// Layer digests in the order they were applied
    #[serde(default)]
    pub layers: Vec<String>,

    /// Environment entries (`KEY=value`) from the image config
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default)]
    pub exposed_ports: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Ownership mapping applied to the tree
    #[serde(default)]
    pub id_mapping: IdMapping,

    /// Non-fatal problems met during the build
    #[serde(default)]
    pub warnings: Vec<String>,

    pub created: DateTime<Utc>,
}

impl BundleMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            manifest_digest: None,
            layers: Vec::new(),
            env: Vec::new(),
            entrypoint: None,
            cmd: None,
            working_dir: None,
            user: None,
            exposed_ports: Vec::new(),
            labels: BTreeMap::new(),
            id_mapping: IdMapping::default(),
            warnings: Vec::new(),
            created: Utc::now(),
        }
    }

    /// Copy the runtime fields of an image config verbatim.
    pub fn apply_image_config(&mut self, config: &ImageConfig) {
        self.env = config.env.clone();
        self.entrypoint = config.entrypoint.clone();
        self.cmd = config.cmd.clone();
        self.working_dir = config.working_dir.clone();
        self.user = config.user.clone();
        self.exposed_ports = config.exposed_ports.clone();
        self.labels = config.labels.clone();
    }

    /// Entrypoint followed by cmd.
    pub fn command_line(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .flatten()
            .chain(self.cmd.iter().flatten())
            .cloned()
            .collect()
    }
}

/// Working directory of one build.
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    rootfs: PathBuf,
    metadata: BundleMetadata,
    keep: bool,
}

impl Bundle {
    /// Create a fresh bundle directory under `parent`.
    pub fn create(parent: &Path, source: &str) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::from_io(parent, e))?;

        let path = parent.join(format!("stratum-bundle-{}", uuid::Uuid::new_v4()));
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| BuildError::from_io(&path, e))?;

        let rootfs = path.join("rootfs");
        let bundle = Self {
            path,
            rootfs,
            metadata: BundleMetadata::new(source),
            keep: false,
        };
        std::fs::DirBuilder::new()
            .mode(0o755)
            .create(&bundle.rootfs)
            .map_err(|e| BuildError::from_io(&bundle.rootfs, e))?;

        tracing::debug!(path = %bundle.path.display(), source, "Created bundle");
        Ok(bundle)
    }

    /// Bundle directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging root filesystem.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BundleMetadata {
        &mut self.metadata
    }

    /// Record a non-fatal problem.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(bundle = %self.path.display(), "{}", message);
        self.metadata.warnings.push(message);
    }

    /// Keep the directory on drop.
    pub fn set_keep(&mut self, keep: bool) {
        self.keep = keep;
    }

    /// Write `metadata.json` next to the rootfs.
    pub fn write_metadata(&self) -> Result<PathBuf> {
        let path = self.path.join("metadata.json");
        let json = serde_json::to_vec_pretty(&self.metadata)?;
        std::fs::write(&path, json).map_err(|e| BuildError::from_io(&path, e))?;
        Ok(path)
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!(path = %self.path.display(), "Keeping bundle");
            return;
        }
        if let Err(e) = crate::fs::remove_node(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove bundle"
            );
        } else {
            tracing::debug!(path = %self.path.display(), "Removed bundle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_create_layout() {
        let tmp = TempDir::new().unwrap();
        let bundle = Bundle::create(tmp.path(), "scratch://").unwrap();

        assert!(bundle.path().starts_with(tmp.path()));
        assert!(bundle.rootfs().is_dir());
        assert_eq!(bundle.metadata().source, "scratch://");
        let mode = std::fs::metadata(bundle.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_drop_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let bundle = Bundle::create(tmp.path(), "scratch://").unwrap();
        let path = bundle.path().to_path_buf();

        // A read-only directory must not block cleanup.
        let locked = bundle.rootfs().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("file"), "x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        drop(bundle);
        assert!(!path.exists());
    }

    #[test]
    fn test_keep_retains_directory() {
        let tmp = TempDir::new().unwrap();
        let mut bundle = Bundle::create(tmp.path(), "scratch://").unwrap();
        bundle.set_keep(true);
        let path = bundle.path().to_path_buf();

        drop(bundle);
        assert!(path.join("rootfs").is_dir());
    }

    #[test]
    fn test_bundles_are_distinct() {
        let tmp = TempDir::new().unwrap();
        let a = Bundle::create(tmp.path(), "scratch://").unwrap();
        let b = Bundle::create(tmp.path(), "scratch://").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_warn_and_write_metadata() {
        let tmp = TempDir::new().unwrap();
        let mut bundle = Bundle::create(tmp.path(), "docker://alpine").unwrap();
        bundle.warn("skipped char device dev/null");

        let path = bundle.write_metadata().unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(json["source"], "docker://alpine");
        assert_eq!(json["warnings"][0], "skipped char device dev/null");
        assert_eq!(json["id_mapping"]["mode"], "preserve");
    }

    #[test]
    fn test_command_line() {
        let mut meta = BundleMetadata::new("scratch://");
        assert!(meta.command_line().is_empty());

        meta.entrypoint = Some(vec!["/bin/app".to_string()]);
        meta.cmd = Some(vec!["--port".to_string(), "80".to_string()]);
        assert_eq!(meta.command_line(), vec!["/bin/app", "--port", "80"]);
    }
}
