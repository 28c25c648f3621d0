//! Build orchestrator: Bundle, then Get, Pack and Assemble in sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use stratum_core::error::{BuildError, BuildStage, Result};
use stratum_core::event::{events, BuildEvent};
use stratum_core::{EventEmitter, PipelineConfig};
use tokio_util::sync::CancellationToken;

use crate::assemble::{Assembler, OutputFormat};
use crate::bundle::Bundle;
use crate::cache::ImageCache;
use crate::oci::{OciRegistryTransport, RegistryAuth, RegistryTransport};
use crate::pack::Packer;
use crate::source::{ConveyorPacker, GetContext, HubClient, ImageSource, SourceClients};

/// One build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Source URI (`docker://`, `oci://`, `shub://`, `scratch://`)
    pub source: String,
    pub destination: PathBuf,
    pub format: OutputFormat,
    /// Replace an existing destination
    pub overwrite: bool,
}

impl BuildRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            format: OutputFormat::default(),
            overwrite: false,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub source: String,
    pub size_bytes: u64,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub warnings: Vec<String>,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Runs builds against one shared cache.
pub struct Pipeline {
    cache: Arc<ImageCache>,
    config: PipelineConfig,
    clients: SourceClients,
    events: EventEmitter,
}

impl Pipeline {
    /// Pipeline with HTTPS registry access using credentials from the
    /// environment.
    pub fn new(cache: Arc<ImageCache>, config: PipelineConfig) -> Self {
        Self {
            cache,
            config,
            clients: SourceClients {
                registry: Arc::new(OciRegistryTransport::new(RegistryAuth::from_env())),
                hub: HubClient::new(),
            },
            events: EventEmitter::default(),
        }
    }

    pub fn with_registry_transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.clients.registry = transport;
        self
    }

    pub fn with_hub_client(mut self, client: HubClient) -> Self {
        self.clients.hub = client;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run one build. The bundle is removed on every exit path unless
    /// `keep_bundle` is set; failures carry the stage they came from.
    pub async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<Artifact> {
        let started = Instant::now();
        self.emit(events::BUILD_STARTED, &[
            ("source", request.source.clone()),
            ("destination", request.destination.display().to_string()),
            ("format", request.format.to_string()),
        ]);
        tracing::info!(
            source = %request.source,
            dest = %request.destination.display(),
            format = %request.format,
            "Starting build"
        );

        match self.run(request, cancel, started).await {
            Ok(artifact) => {
                self.emit(events::BUILD_COMPLETED, &[
                    ("path", artifact.path.display().to_string()),
                    ("size_bytes", artifact.size_bytes.to_string()),
                    ("elapsed_ms", artifact.elapsed.as_millis().to_string()),
                ]);
                tracing::info!(
                    path = %artifact.path.display(),
                    size_bytes = artifact.size_bytes,
                    elapsed_ms = artifact.elapsed.as_millis() as u64,
                    warnings = artifact.warnings.len(),
                    "Build completed"
                );
                Ok(artifact)
            }
            Err(e) => {
                let stage = e.stage().map(|s| s.to_string()).unwrap_or_default();
                self.emit(events::BUILD_FAILED, &[
                    ("stage", stage.clone()),
                    ("error", e.to_string()),
                ]);
                tracing::error!(source = %request.source, stage = %stage, error = %e, "Build failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Artifact> {
        let source =
            ImageSource::parse(&request.source).map_err(|e| e.in_stage(BuildStage::Get))?;
        let assembler = Assembler::for_format(request.format, request.overwrite);

        let mut bundle = Bundle::create(&self.config.resolve_tmp_dir(), &request.source)
            .map_err(|e| e.in_stage(BuildStage::Bundle))?;
        bundle.set_keep(self.config.keep_bundle);

        let mut conveyor = ConveyorPacker::for_source(source, &self.clients);
        let ctx = GetContext::new(Arc::clone(&self.cache))
            .with_cancel(cancel.clone())
            .with_network_timeout(self.config.network_timeout())
            .with_events(self.events.clone());

        self.stage(BuildStage::Get, conveyor.get(&ctx)).await?;

        let packer = Packer::new(&self.config);
        let warnings_before = bundle.metadata().warnings.len();
        self.stage(BuildStage::Pack, conveyor.pack(&packer, &mut bundle, cancel))
            .await?;
        for warning in &bundle.metadata().warnings[warnings_before..] {
            self.events
                .emit(BuildEvent::with_string(events::PACK_WARNING, warning.clone()));
        }

        if self.config.keep_bundle {
            bundle
                .write_metadata()
                .map_err(|e| e.in_stage(BuildStage::Pack))?;
        }

        let path = self
            .stage(
                BuildStage::Assemble,
                assembler.assemble(&bundle, &request.destination, cancel),
            )
            .await?;

        let size_bytes = crate::fs::dir_size(&path).unwrap_or(0);
        Ok(Artifact {
            path,
            format: request.format,
            source: request.source.clone(),
            size_bytes,
            elapsed: started.elapsed(),
            warnings: bundle.metadata().warnings.clone(),
        })
    }

    /// Run one stage, emitting start/completion events and tagging failures.
    async fn stage<T>(
        &self,
        stage: BuildStage,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let name = stage.to_string();
        self.emit(events::STAGE_STARTED, &[("stage", name.clone())]);
        tracing::debug!(stage = %name, "Stage started");
        let started = Instant::now();

        let value = fut.await.map_err(|e| e.in_stage(stage))?;

        self.emit(events::STAGE_COMPLETED, &[
            ("stage", name.clone()),
            ("elapsed_ms", started.elapsed().as_millis().to_string()),
        ]);
        tracing::debug!(stage = %name, elapsed_ms = started.elapsed().as_millis() as u64, "Stage completed");
        Ok(value)
    }

    fn emit(&self, key: &str, fields: &[(&str, String)]) {
        let map: HashMap<String, serde_json::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
            .collect();
        self.events.emit(BuildEvent::with_map(key, map));
    }
}

/// Whether `err` came from the given stage.
pub fn failed_in(err: &BuildError, stage: BuildStage) -> bool {
    err.stage() == Some(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::CacheConfig;
    use tempfile::TempDir;

    fn pipeline(tmp: &TempDir) -> Pipeline {
        let cache = Arc::new(ImageCache::open(&CacheConfig::at(tmp.path().join("cache"))).unwrap());
        let config = PipelineConfig {
            tmp_dir: Some(tmp.path().join("bundles")),
            ..Default::default()
        };
        Pipeline::new(cache, config)
    }

    fn bundle_count(tmp: &TempDir) -> usize {
        std::fs::read_dir(tmp.path().join("bundles"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_scratch_sandbox_build() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(&tmp);
        let mut rx = pipeline.events().subscribe();
        let dest = tmp.path().join("out");

        let artifact = pipeline
            .build(
                &BuildRequest::new("scratch://", &dest).with_format(OutputFormat::Sandbox),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(artifact.path, dest);
        assert!(dest.join(".stratum.d/runscript").exists());
        assert_eq!(bundle_count(&tmp), 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, events::BUILD_STARTED);
    }

    #[tokio::test]
    async fn test_unknown_scheme_tagged_get() {
        let tmp = TempDir::new().unwrap();
        let err = pipeline(&tmp)
            .build(
                &BuildRequest::new("ftp://nowhere/image", tmp.path().join("out")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(failed_in(&err, BuildStage::Get));
        assert!(matches!(err.root(), BuildError::ManifestParse(_)));
    }

    #[tokio::test]
    async fn test_existing_destination_tagged_assemble() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("keep"), "x").unwrap();

        let err = pipeline(&tmp)
            .build(
                &BuildRequest::new("scratch://", &dest).with_format(OutputFormat::Sandbox),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(failed_in(&err, BuildStage::Assemble));
        assert!(matches!(err.root(), BuildError::Exists(_)));
        assert!(dest.join("keep").exists());
        assert_eq!(bundle_count(&tmp), 0);
    }

    #[tokio::test]
    async fn test_keep_bundle() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ImageCache::open(&CacheConfig::at(tmp.path().join("cache"))).unwrap());
        let config = PipelineConfig {
            tmp_dir: Some(tmp.path().join("bundles")),
            keep_bundle: true,
            ..Default::default()
        };

        Pipeline::new(cache, config)
            .build(
                &BuildRequest::new("scratch://", tmp.path().join("img")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bundle_count(&tmp), 1);
        let bundle = std::fs::read_dir(tmp.path().join("bundles"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert!(bundle.join("metadata.json").exists());
    }
}
