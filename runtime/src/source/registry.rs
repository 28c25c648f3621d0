//! Registry conveyor (`docker://`, `registry://`).

use std::path::PathBuf;
use std::sync::Arc;

use oci_distribution::manifest::OciDescriptor;
use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;

use super::{is_foreign_media_type, ConveyorState, GetContext, StagedImage, StagedLayer};
use crate::cache::CacheKind;
use crate::oci::{ImageConfig, ImageReference, RegistryTransport};

pub struct RegistryConveyor {
    reference: ImageReference,
    transport: Arc<dyn RegistryTransport>,
    pub(crate) state: ConveyorState,
}

impl RegistryConveyor {
    pub fn new(reference: ImageReference, transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            reference,
            transport,
            state: ConveyorState::default(),
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn source_uri(&self) -> String {
        format!("docker://{}", self.reference)
    }

    pub(crate) async fn fetch(&self, ctx: &GetContext) -> Result<StagedImage> {
        let uri = self.source_uri();
        tracing::info!(reference = %self.reference, "Pulling image manifest");

        let (manifest, manifest_digest) = ctx
            .guard(&uri, self.transport.pull_manifest(&self.reference))
            .await?;
        let manifest_digest = Digest::parse(&manifest_digest)?;

        if let Some(pinned) = &self.reference.digest {
            if pinned != &manifest_digest {
                return Err(BuildError::DigestMismatch {
                    kind: "manifest".to_string(),
                    expected: pinned.to_string(),
                    actual: manifest_digest.to_string(),
                });
            }
        }

        let (config_digest, _) = self.ensure_blob(ctx, &uri, &manifest.config).await?;
        let config = ImageConfig::from_json(&ctx.cache.read(CacheKind::Blob, &config_digest).await?)?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let digest = Digest::parse(&descriptor.digest)?;
            let path = if is_foreign_media_type(&descriptor.media_type) {
                tracing::warn!(
                    digest = %digest,
                    media_type = %descriptor.media_type,
                    "Not fetching foreign layer"
                );
                ctx.cache.entry_path(CacheKind::Blob, &digest)
            } else {
                self.ensure_blob(ctx, &uri, descriptor).await?.1
            };

            layers.push(StagedLayer {
                digest,
                media_type: descriptor.media_type.clone(),
                path,
                size: descriptor.size.max(0) as u64,
            });
        }

        tracing::info!(
            reference = %self.reference,
            digest = %manifest_digest,
            layers = layers.len(),
            "Image fetched"
        );

        Ok(StagedImage {
            layers,
            config,
            manifest_digest: Some(manifest_digest),
        })
    }

    /// Return the cache path of a blob, pulling it first if absent.
    async fn ensure_blob(
        &self,
        ctx: &GetContext,
        uri: &str,
        descriptor: &OciDescriptor,
    ) -> Result<(Digest, PathBuf)> {
        let digest = Digest::parse(&descriptor.digest)?;
        if ctx.cache.exists(CacheKind::Blob, &digest) {
            ctx.blob_cached(CacheKind::Blob, &digest);
            return Ok((digest.clone(), ctx.cache.entry_path(CacheKind::Blob, &digest)));
        }

        let mut pending = ctx.cache.begin(CacheKind::Blob, &digest).await?;
        ctx.guard(
            uri,
            self.transport
                .pull_blob(&self.reference, descriptor, &mut pending),
        )
        .await?;
        let size = pending.written();
        let path = pending.commit().await?;
        ctx.blob_fetched(CacheKind::Blob, &digest, size);

        Ok((digest, path))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use async_trait::async_trait;
    use oci_distribution::manifest::OciImageManifest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use stratum_core::CacheConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    /// Registry serving one manifest and a fixed set of blobs from memory.
    pub(crate) struct MemoryRegistry {
        pub manifest: OciImageManifest,
        pub manifest_digest: String,
        pub blobs: HashMap<String, Vec<u8>>,
        pub blob_pulls: AtomicUsize,
        pub pulled: Mutex<Vec<String>>,
    }

    impl MemoryRegistry {
        pub fn new(config: &[u8], layers: &[Vec<u8>]) -> Self {
            let descriptor = |media_type: &str, data: &[u8]| OciDescriptor {
                media_type: media_type.to_string(),
                digest: Digest::of_bytes(data).to_string(),
                size: data.len() as i64,
                ..Default::default()
            };

            let mut blobs = HashMap::new();
            blobs.insert(Digest::of_bytes(config).to_string(), config.to_vec());
            for layer in layers {
                blobs.insert(Digest::of_bytes(layer).to_string(), layer.clone());
            }

            let manifest = OciImageManifest {
                config: descriptor("application/vnd.oci.image.config.v1+json", config),
                layers: layers
                    .iter()
                    .map(|l| descriptor("application/vnd.oci.image.layer.v1.tar+gzip", l))
                    .collect(),
                ..Default::default()
            };
            let manifest_digest =
                Digest::of_bytes(&serde_json::to_vec(&manifest).unwrap()).to_string();

            Self {
                manifest,
                manifest_digest,
                blobs,
                blob_pulls: AtomicUsize::new(0),
                pulled: Mutex::new(Vec::new()),
            }
        }

        pub fn pulls(&self) -> usize {
            self.blob_pulls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryTransport for MemoryRegistry {
        async fn pull_manifest(
            &self,
            reference: &ImageReference,
        ) -> Result<(OciImageManifest, String)> {
            if reference.repository.ends_with("missing") {
                return Err(BuildError::NotFound {
                    source_uri: reference.to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
            Ok((self.manifest.clone(), self.manifest_digest.clone()))
        }

        async fn pull_blob(
            &self,
            _reference: &ImageReference,
            descriptor: &OciDescriptor,
            out: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<()> {
            self.blob_pulls.fetch_add(1, Ordering::SeqCst);
            self.pulled.lock().unwrap().push(descriptor.digest.clone());
            let data = self.blobs.get(&descriptor.digest).ok_or_else(|| {
                BuildError::NotFound {
                    source_uri: descriptor.digest.clone(),
                    message: "blob unknown".to_string(),
                }
            })?;
            out.write_all(data).await?;
            Ok(())
        }
    }

    pub(crate) const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux","config":{"Env":["PATH=/bin"],"Cmd":["/bin/sh"]},"rootfs":{"type":"layers","diff_ids":[]},"history":[]}"#;

    fn setup() -> (TempDir, GetContext) {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ImageCache::open(&CacheConfig::at(tmp.path().join("cache"))).unwrap());
        (tmp, GetContext::new(cache))
    }

    #[tokio::test]
    async fn test_fetch_two_layers_into_empty_cache() {
        let (_tmp, ctx) = setup();
        let layers = vec![b"layer one".to_vec(), b"layer two".to_vec()];
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &layers));
        let conveyor = RegistryConveyor::new(
            ImageReference::parse("alpine:3.19").unwrap(),
            registry.clone(),
        );

        let staged = conveyor.fetch(&ctx).await.unwrap();

        assert_eq!(staged.layers.len(), 2);
        for (layer, data) in staged.layers.iter().zip(&layers) {
            assert_eq!(layer.digest, Digest::of_bytes(data));
            assert!(ctx.cache.exists(CacheKind::Blob, &layer.digest));
            assert_eq!(std::fs::read(&layer.path).unwrap(), *data);
        }
        // config + two layers
        assert_eq!(registry.pulls(), 3);
        assert_eq!(staged.config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(
            staged.manifest_digest.unwrap().to_string(),
            registry.manifest_digest
        );
    }

    #[tokio::test]
    async fn test_fetch_reuses_cached_blobs() {
        let (_tmp, ctx) = setup();
        let layers = vec![b"shared base".to_vec()];
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &layers));
        let conveyor = RegistryConveyor::new(
            ImageReference::parse("alpine").unwrap(),
            registry.clone(),
        );

        conveyor.fetch(&ctx).await.unwrap();
        conveyor.fetch(&ctx).await.unwrap();
        assert_eq!(registry.pulls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_emits_blob_events() {
        let (_tmp, ctx) = setup();
        let mut rx = ctx.events.subscribe();
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &[b"l".to_vec()]));
        let conveyor =
            RegistryConveyor::new(ImageReference::parse("alpine").unwrap(), registry);

        conveyor.fetch(&ctx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, stratum_core::event::events::BLOB_FETCHED);
    }

    #[tokio::test]
    async fn test_fetch_corrupted_blob() {
        let (_tmp, ctx) = setup();
        let layers = vec![b"good bytes".to_vec()];
        let mut registry = MemoryRegistry::new(CONFIG, &layers);
        let layer_digest = Digest::of_bytes(&layers[0]);
        registry
            .blobs
            .insert(layer_digest.to_string(), b"evil bytes".to_vec());
        let conveyor = RegistryConveyor::new(
            ImageReference::parse("alpine").unwrap(),
            Arc::new(registry),
        );

        let err = conveyor.fetch(&ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::DigestMismatch { .. }));
        assert!(!ctx.cache.exists(CacheKind::Blob, &layer_digest));
        // The config blob fetched before the failure stays valid.
        assert!(ctx
            .cache
            .exists(CacheKind::Blob, &Digest::of_bytes(CONFIG)));
    }

    #[tokio::test]
    async fn test_fetch_pinned_digest_mismatch() {
        let (_tmp, ctx) = setup();
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &[]));
        let other = Digest::of_bytes(b"some other manifest");
        let conveyor = RegistryConveyor::new(
            ImageReference::parse(&format!("alpine@{}", other)).unwrap(),
            registry,
        );

        let err = conveyor.fetch(&ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::DigestMismatch { ref kind, .. } if kind == "manifest"));
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let (_tmp, ctx) = setup();
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &[]));
        let conveyor = RegistryConveyor::new(
            ImageReference::parse("team/missing").unwrap(),
            registry,
        );

        let err = conveyor.fetch(&ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_commits_nothing() {
        let (_tmp, ctx) = setup();
        ctx.cancel.cancel();
        let registry = Arc::new(MemoryRegistry::new(CONFIG, &[b"l".to_vec()]));
        let conveyor =
            RegistryConveyor::new(ImageReference::parse("alpine").unwrap(), registry);

        let err = conveyor.fetch(&ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(ctx.cache.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_layer_is_staged_but_not_pulled() {
        let (_tmp, ctx) = setup();
        let mut registry = MemoryRegistry::new(CONFIG, &[b"windows base".to_vec()]);
        registry.manifest.layers[0].media_type =
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip".to_string();
        let registry = Arc::new(registry);
        let conveyor =
            RegistryConveyor::new(ImageReference::parse("alpine").unwrap(), registry.clone());

        let staged = conveyor.fetch(&ctx).await.unwrap();
        assert_eq!(staged.layers.len(), 1);
        assert!(staged.layers[0].is_foreign());
        assert_eq!(registry.pulls(), 1);
    }
}
