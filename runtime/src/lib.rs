//! Stratum Runtime - image build pipeline.
//!
//! Content-addressed blob cache, per-source conveyor/packer pairs, layer
//! application, sandbox and packed-image assemblers, and the orchestrator
//! that runs them in sequence.

#![allow(clippy::result_large_err)]

pub mod assemble;
pub mod bundle;
pub mod cache;
pub mod fs;
pub mod oci;
pub mod pack;
pub mod pipeline;
pub mod source;

use stratum_core::error::{BuildError, Result};

// Re-export common types
pub use assemble::{Assembler, OutputFormat, PackedImage};
pub use bundle::{Bundle, BundleMetadata};
pub use cache::{CacheEntry, CacheKind, CleanPolicy, CleanReport, ImageCache};
pub use oci::{ImageConfig, ImageReference, OciRegistryTransport, RegistryAuth, RegistryTransport};
pub use pack::Packer;
pub use pipeline::{Artifact, BuildRequest, Pipeline};
pub use source::{ConveyorPacker, GetContext, HubClient, ImageSource, StagedImage, StagedLayer};

/// Stratum runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run filesystem-bound work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        BuildError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Blocking task failed: {}", e),
        ))
    })?
}
