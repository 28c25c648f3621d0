//! OCI layout conveyor (`oci://<dir>[:tag]`).
//!
//! Blobs are imported from the layout into the cache through the same
//! verifying store path as network blobs, so a corrupted layout fails with
//! `DigestMismatch` instead of producing a broken rootfs.

use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;

use super::{is_foreign_media_type, ConveyorState, GetContext, StagedImage, StagedLayer};
use crate::cache::CacheKind;
use crate::oci::layout::parse_manifest;
use crate::oci::{ImageConfig, OciLayout};

pub struct OciLayoutConveyor {
    path: PathBuf,
    tag: Option<String>,
    pub(crate) state: ConveyorState,
}

impl OciLayoutConveyor {
    pub fn new(path: impl Into<PathBuf>, tag: Option<String>) -> Self {
        Self {
            path: path.into(),
            tag,
            state: ConveyorState::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn fetch(&self, ctx: &GetContext) -> Result<StagedImage> {
        let layout = OciLayout::open(&self.path)?;
        let manifest_ref = layout.select_manifest(self.tag.as_deref())?;
        tracing::info!(
            layout = %self.path.display(),
            tag = self.tag.as_deref().unwrap_or("<first>"),
            digest = %manifest_ref.digest,
            "Importing OCI layout"
        );

        self.import(ctx, &layout, CacheKind::OciLayout, &manifest_ref.digest)
            .await?;
        let manifest = parse_manifest(
            &ctx.cache
                .read(CacheKind::OciLayout, &manifest_ref.digest)
                .await?,
        )?;

        let config_digest = Digest::parse(manifest.config().digest())?;
        self.import(ctx, &layout, CacheKind::Blob, &config_digest)
            .await?;
        let config =
            ImageConfig::from_json(&ctx.cache.read(CacheKind::Blob, &config_digest).await?)?;

        let mut layers = Vec::with_capacity(manifest.layers().len());
        for descriptor in manifest.layers() {
            let digest = Digest::parse(descriptor.digest())?;
            let media_type = descriptor.media_type().to_string();
            let path = if is_foreign_media_type(&media_type) {
                ctx.cache.entry_path(CacheKind::Blob, &digest)
            } else {
                self.import(ctx, &layout, CacheKind::Blob, &digest).await?
            };
            layers.push(StagedLayer {
                digest,
                media_type,
                path,
                size: descriptor.size().max(0) as u64,
            });
        }

        Ok(StagedImage {
            layers,
            config,
            manifest_digest: Some(manifest_ref.digest),
        })
    }

    async fn import(
        &self,
        ctx: &GetContext,
        layout: &OciLayout,
        kind: CacheKind,
        digest: &Digest,
    ) -> Result<PathBuf> {
        if ctx.cache.exists(kind, digest) {
            ctx.blob_cached(kind, digest);
            return Ok(ctx.cache.entry_path(kind, digest));
        }

        let source = layout.blob_path(digest);
        let file = tokio::fs::File::open(&source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::NotFound {
                    source_uri: format!("oci://{}", self.path.display()),
                    message: format!("Missing blob {}", digest),
                }
            } else {
                BuildError::from_io(&source, e)
            }
        })?;

        let path = ctx.cache.store(kind, digest, file, &ctx.cancel).await?;
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        ctx.blob_fetched(kind, digest, size);
        Ok(path)
    }
}
