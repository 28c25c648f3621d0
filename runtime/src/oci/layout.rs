//! On-disk OCI image layout reader.
//!
//! ```text
//! image/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/<hex>
//! ```

use std::path::{Path, PathBuf};

use oci_spec::image::{ImageIndex, ImageManifest};
use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;

/// Annotation carrying the tag of a manifest inside `index.json`.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Manifest entry selected from an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    pub digest: Digest,
    pub size: u64,
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open a layout, checking the marker file, index and blob directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for (name, what) in [
            ("oci-layout", "oci-layout file"),
            ("index.json", "index.json"),
            ("blobs", "blobs directory"),
        ] {
            if !root.join(name).exists() {
                return Err(BuildError::NotFound {
                    source_uri: format!("oci://{}", root.display()),
                    message: format!("Not an OCI layout: missing {}", what),
                });
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse `index.json`.
    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.root.join("index.json");
        let content = std::fs::read(&path).map_err(|e| BuildError::from_io(&path, e))?;
        serde_json::from_slice(&content)
            .map_err(|e| BuildError::ManifestParse(format!("Failed to parse index.json: {}", e)))
    }

    /// Pick the manifest tagged `tag`, or the first manifest when no tag is
    /// given.
    pub fn select_manifest(&self, tag: Option<&str>) -> Result<ManifestRef> {
        let index = self.index()?;
        let manifests = index.manifests();

        let descriptor = match tag {
            Some(tag) => manifests.iter().find(|m| {
                m.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map(|name| name == tag)
                    .unwrap_or(false)
            }),
            None => manifests.first(),
        }
        .ok_or_else(|| BuildError::NotFound {
            source_uri: format!("oci://{}", self.root.display()),
            message: match tag {
                Some(tag) => format!("No manifest tagged '{}' in index.json", tag),
                None => "No manifests in index.json".to_string(),
            },
        })?;

        Ok(ManifestRef {
            digest: Digest::parse(descriptor.digest())?,
            size: descriptor.size().max(0) as u64,
        })
    }

    /// Path of a blob inside the layout.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }
}

/// Parse a manifest blob.
pub fn parse_manifest(data: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(data)
        .map_err(|e| BuildError::ManifestParse(format!("Failed to parse manifest: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_index(root: &Path, entries: &[(&Digest, Option<&str>)]) {
        let manifests: Vec<serde_json::Value> = entries
            .iter()
            .map(|(digest, tag)| {
                let mut m = serde_json::json!({
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": digest.to_string(),
                    "size": 10
                });
                if let Some(tag) = tag {
                    m["annotations"] = serde_json::json!({ REF_NAME_ANNOTATION: tag });
                }
                m
            })
            .collect();
        fs::write(
            root.join("index.json"),
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "manifests": manifests
            }))
            .unwrap(),
        )
        .unwrap();
    }

    fn skeleton(root: &Path) {
        fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        fs::create_dir_all(root.join("blobs/sha256")).unwrap();
    }

    #[test]
    fn test_open_missing_marker() {
        let tmp = TempDir::new().unwrap();
        let err = OciLayout::open(tmp.path()).unwrap_err();
        assert!(matches!(err, BuildError::NotFound { .. }));
        assert!(err.to_string().contains("oci-layout"));
    }

    #[test]
    fn test_open_missing_index() {
        let tmp = TempDir::new().unwrap();
        skeleton(tmp.path());
        let err = OciLayout::open(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("index.json"));
    }

    #[test]
    fn test_select_first_manifest() {
        let tmp = TempDir::new().unwrap();
        skeleton(tmp.path());
        let a = Digest::of_bytes(b"a");
        let b = Digest::of_bytes(b"b");
        write_index(tmp.path(), &[(&a, Some("v1")), (&b, Some("v2"))]);

        let layout = OciLayout::open(tmp.path()).unwrap();
        assert_eq!(layout.select_manifest(None).unwrap().digest, a);
        assert_eq!(layout.select_manifest(Some("v2")).unwrap().digest, b);
    }

    #[test]
    fn test_select_unknown_tag() {
        let tmp = TempDir::new().unwrap();
        skeleton(tmp.path());
        let a = Digest::of_bytes(b"a");
        write_index(tmp.path(), &[(&a, None)]);

        let layout = OciLayout::open(tmp.path()).unwrap();
        let err = layout.select_manifest(Some("missing")).unwrap_err();
        assert!(matches!(err, BuildError::NotFound { .. }));
    }

    #[test]
    fn test_empty_index() {
        let tmp = TempDir::new().unwrap();
        skeleton(tmp.path());
        write_index(tmp.path(), &[]);

        let layout = OciLayout::open(tmp.path()).unwrap();
        assert!(layout.select_manifest(None).is_err());
    }

    #[test]
    fn test_blob_path() {
        let layout = OciLayout {
            root: PathBuf::from("/images/app"),
        };
        let digest = Digest::of_bytes(b"x");
        assert_eq!(
            layout.blob_path(&digest),
            PathBuf::from(format!("/images/app/blobs/sha256/{}", digest.hex()))
        );
    }
}
