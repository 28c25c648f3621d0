//! Packer: turns staged layers into a bundle rootfs.
//!
//! Layer application, metadata materialization and ownership normalization
//! run on the blocking pool; the cancellation token is polled between tar
//! members.

pub mod layer;
pub mod metadata;
pub mod ownership;

use std::path::PathBuf;

use stratum_core::error::Result;
use stratum_core::{IdMapping, PipelineConfig, SpecialFilePolicy};
use tokio_util::sync::CancellationToken;

use crate::bundle::{Bundle, BundleMetadata};
use crate::source::StagedImage;

pub use layer::{LayerApplier, LayerCompression};
pub use metadata::METADATA_DIR;
pub use ownership::{apply_id_mapping, OwnershipReport};

/// Applies a staged image onto a bundle.
#[derive(Debug, Clone, Default)]
pub struct Packer {
    special_files: SpecialFilePolicy,
    id_mapping: IdMapping,
}

impl Packer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            special_files: config.special_files,
            id_mapping: config.id_mapping,
        }
    }

    pub fn with_special_files(mut self, policy: SpecialFilePolicy) -> Self {
        self.special_files = policy;
        self
    }

    pub fn with_id_mapping(mut self, mapping: IdMapping) -> Self {
        self.id_mapping = mapping;
        self
    }

    /// Apply every staged layer in manifest order, then record the image
    /// config in bundle metadata.
    pub async fn pack(
        &self,
        staged: &StagedImage,
        bundle: &mut Bundle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        {
            let meta = bundle.metadata_mut();
            meta.apply_image_config(&staged.config);
            meta.manifest_digest = staged.manifest_digest.as_ref().map(|d| d.to_string());
            meta.layers = staged.layers.iter().map(|l| l.digest.to_string()).collect();
            meta.id_mapping = self.id_mapping;
        }

        let job = PackJob {
            root: bundle.rootfs().to_path_buf(),
            staged: staged.clone(),
            metadata: bundle.metadata().clone(),
            special_files: self.special_files,
            id_mapping: self.id_mapping,
            cancel: cancel.clone(),
        };
        tracing::info!(
            rootfs = %job.root.display(),
            layers = staged.layers.len(),
            "Packing rootfs"
        );

        let warnings = crate::run_blocking(move || job.run()).await?;
        for warning in warnings {
            bundle.warn(warning);
        }
        Ok(())
    }
}

struct PackJob {
    root: PathBuf,
    staged: StagedImage,
    metadata: BundleMetadata,
    special_files: SpecialFilePolicy,
    id_mapping: IdMapping,
    cancel: CancellationToken,
}

impl PackJob {
    fn run(self) -> Result<Vec<String>> {
        let mut applier = LayerApplier::new(&self.root, self.special_files);
        for layer in &self.staged.layers {
            applier.apply(layer, &self.cancel)?;
        }
        if self.cancel.is_cancelled() {
            return Err(stratum_core::BuildError::Cancelled);
        }

        metadata::materialize(&self.root, &self.metadata)?;
        applier.finish()?;

        let report = apply_id_mapping(&self.root, &self.id_mapping)?;
        let mut warnings = applier.into_warnings();
        warnings.extend(report.refused);
        Ok(warnings)
    }
}
