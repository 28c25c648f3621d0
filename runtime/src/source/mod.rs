//! Image sources and their conveyor/packer pairs.
//!
//! A source URI selects one [`ConveyorPacker`] variant by scheme:
//!
//! | scheme                    | conveyor                       |
//! |---------------------------|--------------------------------|
//! | `docker://`, `registry://`| [`RegistryConveyor`]           |
//! | `oci://`                  | [`OciLayoutConveyor`]          |
//! | `shub://`                 | [`HubConveyor`]                |
//! | `scratch://`              | [`ScratchConveyor`]            |
//!
//! `get` fetches everything into the cache and keeps the staged layer list
//! in memory; `pack` hands that list to the [`Packer`].

pub mod hub;
pub mod oci_layout;
pub mod registry;
pub mod scratch;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stratum_core::error::{BuildError, Result};
use stratum_core::event::{events, BuildEvent};
use stratum_core::{Digest, EventEmitter};
use tokio_util::sync::CancellationToken;

use crate::bundle::Bundle;
use crate::cache::{CacheKind, ImageCache};
use crate::oci::{ImageConfig, ImageReference, RegistryTransport};
use crate::pack::Packer;

pub use hub::{HubClient, HubConveyor, HubReference};
pub use oci_layout::OciLayoutConveyor;
pub use registry::RegistryConveyor;
pub use scratch::ScratchConveyor;

/// Parsed source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// `docker://` or `registry://`
    Registry(ImageReference),
    /// `oci://<dir>[:tag]`
    OciLayout { path: PathBuf, tag: Option<String> },
    /// `shub://[host/]collection/name[:tag]`
    Hub(HubReference),
    /// `scratch://`
    Scratch,
}

impl ImageSource {
    /// Parse a source URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            BuildError::ManifestParse(format!(
                "Invalid source '{}': expected <scheme>://<reference>",
                uri
            ))
        })?;

        match scheme {
            "docker" | "registry" => Ok(Self::Registry(ImageReference::parse(rest)?)),
            "oci" => {
                let (path, tag) = split_layout_tag(rest);
                if path.is_empty() {
                    return Err(BuildError::ManifestParse(format!(
                        "Invalid source '{}': missing layout directory",
                        uri
                    )));
                }
                Ok(Self::OciLayout {
                    path: PathBuf::from(path),
                    tag: tag.map(String::from),
                })
            }
            "shub" => Ok(Self::Hub(HubReference::parse(rest)?)),
            "scratch" => Ok(Self::Scratch),
            other => Err(BuildError::ManifestParse(format!(
                "Unsupported source scheme '{}' in '{}'",
                other, uri
            ))),
        }
    }

    /// Canonical scheme of this source.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Registry(_) => "docker",
            Self::OciLayout { .. } => "oci",
            Self::Hub(_) => "shub",
            Self::Scratch => "scratch",
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(r) => write!(f, "docker://{}", r),
            Self::OciLayout { path, tag: Some(tag) } => {
                write!(f, "oci://{}:{}", path.display(), tag)
            }
            Self::OciLayout { path, tag: None } => write!(f, "oci://{}", path.display()),
            Self::Hub(r) => write!(f, "shub://{}", r),
            Self::Scratch => f.write_str("scratch://"),
        }
    }
}

impl std::str::FromStr for ImageSource {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// `dir:tag`, where the tag colon must come after the last `/`.
fn split_layout_tag(rest: &str) -> (&str, Option<&str>) {
    let last_segment_start = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
    match rest[last_segment_start..].rfind(':') {
        Some(colon) if colon > 0 => {
            let split = last_segment_start + colon;
            let tag = &rest[split + 1..];
            if tag.is_empty() {
                (&rest[..split], None)
            } else {
                (&rest[..split], Some(tag))
            }
        }
        _ => (rest, None),
    }
}

/// One layer ready to be applied, backed by a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLayer {
    pub digest: Digest,
    pub media_type: String,
    pub path: PathBuf,
    pub size: u64,
}

impl StagedLayer {
    /// Foreign and non-distributable layers are never fetched.
    pub fn is_foreign(&self) -> bool {
        is_foreign_media_type(&self.media_type)
    }
}

pub(crate) fn is_foreign_media_type(media_type: &str) -> bool {
    media_type.contains("foreign") || media_type.contains("nondistributable")
}

/// Output of a successful `get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedImage {
    /// Layers in manifest order, bottom first
    pub layers: Vec<StagedLayer>,
    pub config: ImageConfig,
    pub manifest_digest: Option<Digest>,
}

/// Conveyor lifecycle.
#[derive(Debug, Default)]
pub enum ConveyorState {
    #[default]
    Unstarted,
    Fetching,
    Ready(StagedImage),
    Failed,
}

impl ConveyorState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Fetching => "fetching",
            Self::Ready(_) => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Shared state handed to every `get`.
#[derive(Clone)]
pub struct GetContext {
    pub cache: Arc<ImageCache>,
    pub cancel: CancellationToken,
    /// Deadline applied to each network operation
    pub network_timeout: Option<Duration>,
    pub events: EventEmitter,
}

impl GetContext {
    pub fn new(cache: Arc<ImageCache>) -> Self {
        Self {
            cache,
            cancel: CancellationToken::new(),
            network_timeout: None,
            events: EventEmitter::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Run a network operation under the deadline and cancellation token.
    ///
    /// Cancellation drops `fut`, which discards any uncommitted cache write
    /// it owns.
    pub async fn guard<T, F>(&self, source_uri: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.network_timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                    BuildError::Network {
                        source_uri: source_uri.to_string(),
                        message: format!("Timed out after {}s", limit.as_secs()),
                    }
                })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
            result = bounded => result,
        }
    }

    pub(crate) fn blob_cached(&self, kind: CacheKind, digest: &Digest) {
        tracing::debug!(kind = %kind, digest = %digest, "Blob already cached");
        self.emit_blob(events::BLOB_CACHED, kind, digest, None);
    }

    pub(crate) fn blob_fetched(&self, kind: CacheKind, digest: &Digest, size: u64) {
        tracing::info!(kind = %kind, digest = %digest, size_bytes = size, "Fetched blob");
        self.emit_blob(events::BLOB_FETCHED, kind, digest, Some(size));
    }

    fn emit_blob(&self, key: &str, kind: CacheKind, digest: &Digest, size: Option<u64>) {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(kind.dir_name()));
        map.insert("digest".to_string(), serde_json::json!(digest.to_string()));
        if let Some(size) = size {
            map.insert("size_bytes".to_string(), serde_json::json!(size));
        }
        self.events.emit(BuildEvent::with_map(key, map));
    }
}

/// Network clients the conveyors are built with.
#[derive(Clone)]
pub struct SourceClients {
    pub registry: Arc<dyn RegistryTransport>,
    pub hub: HubClient,
}

/// Closed set of conveyor/packer pairs.
pub enum ConveyorPacker {
    Registry(RegistryConveyor),
    OciLayout(OciLayoutConveyor),
    Hub(HubConveyor),
    Scratch(ScratchConveyor),
}

impl ConveyorPacker {
    /// Select the pair for `source`.
    pub fn for_source(source: ImageSource, clients: &SourceClients) -> Self {
        match source {
            ImageSource::Registry(reference) => {
                Self::Registry(RegistryConveyor::new(reference, Arc::clone(&clients.registry)))
            }
            ImageSource::OciLayout { path, tag } => {
                Self::OciLayout(OciLayoutConveyor::new(path, tag))
            }
            ImageSource::Hub(reference) => {
                Self::Hub(HubConveyor::new(reference, clients.hub.clone()))
            }
            ImageSource::Scratch => Self::Scratch(ScratchConveyor::default()),
        }
    }

    pub fn state(&self) -> &ConveyorState {
        match self {
            Self::Registry(c) => &c.state,
            Self::OciLayout(c) => &c.state,
            Self::Hub(c) => &c.state,
            Self::Scratch(c) => &c.state,
        }
    }

    fn state_mut(&mut self) -> &mut ConveyorState {
        match self {
            Self::Registry(c) => &mut c.state,
            Self::OciLayout(c) => &mut c.state,
            Self::Hub(c) => &mut c.state,
            Self::Scratch(c) => &mut c.state,
        }
    }

    /// Staged layers, once `get` has succeeded.
    pub fn staged(&self) -> Option<&StagedImage> {
        match self.state() {
            ConveyorState::Ready(staged) => Some(staged),
            _ => None,
        }
    }

    /// Fetch the source into the cache.
    ///
    /// Allowed from `Unstarted`, or from `Failed` for a caller-level retry.
    pub async fn get(&mut self, ctx: &GetContext) -> Result<()> {
        match self.state() {
            ConveyorState::Unstarted | ConveyorState::Failed => {}
            other => {
                return Err(BuildError::Config(format!(
                    "Cannot get: conveyor is {}",
                    other.name()
                )))
            }
        }
        *self.state_mut() = ConveyorState::Fetching;

        let result = match self {
            Self::Registry(c) => c.fetch(ctx).await,
            Self::OciLayout(c) => c.fetch(ctx).await,
            Self::Hub(c) => c.fetch(ctx).await,
            Self::Scratch(c) => c.fetch(ctx).await,
        };

        match result {
            Ok(staged) => {
                tracing::debug!(layers = staged.layers.len(), "Conveyor ready");
                *self.state_mut() = ConveyorState::Ready(staged);
                Ok(())
            }
            Err(e) => {
                *self.state_mut() = ConveyorState::Failed;
                Err(e)
            }
        }
    }

    /// Apply the staged layers onto `bundle`.
    pub async fn pack(
        &self,
        packer: &Packer,
        bundle: &mut Bundle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let staged = match self.state() {
            ConveyorState::Ready(staged) => staged,
            other => {
                return Err(BuildError::Unpack(format!(
                    "Cannot pack: conveyor is {}",
                    other.name()
                )))
            }
        };

        if let Self::Hub(c) = self {
            bundle
                .metadata_mut()
                .labels
                .insert(hub::HUB_SOURCE_LABEL.to_string(), c.reference().to_string());
        }

        packer.pack(staged, bundle, cancel).await
    }
}
