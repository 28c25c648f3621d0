//! Legacy hub registry conveyor (`shub://`).
//!
//! The hub API answers `GET /api/container/<collection>/<name>:<tag>` with a
//! JSON record naming the image download URL and its sha256 `version`. The
//! image itself is a single (optionally gzip-compressed) root filesystem
//! tarball and is staged as one layer.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;
use tokio::io::AsyncWriteExt;

use super::{ConveyorState, GetContext, StagedImage, StagedLayer};
use crate::cache::{CacheKind, PendingBlob};

/// Host used when the URI names none.
pub const DEFAULT_HUB_HOST: &str = "singularity-hub.org";

/// Media type recorded for hub images.
pub const HUB_IMAGE_MEDIA_TYPE: &str = "application/vnd.stratum.hub.image.tar";

/// Label recording the hub reference an image came from.
pub const HUB_SOURCE_LABEL: &str = "org.stratum.hub.source";

/// Parsed `[host/]collection/name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubReference {
    pub host: String,
    pub collection: String,
    pub name: String,
    pub tag: String,
}

impl HubReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim().trim_start_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();

        let (host, collection, name_tag) = match parts.as_slice() {
            [collection, name_tag] => (DEFAULT_HUB_HOST, *collection, *name_tag),
            [host, collection, name_tag] => (*host, *collection, *name_tag),
            _ => {
                return Err(BuildError::ManifestParse(format!(
                    "Invalid hub reference '{}': expected [host/]collection/name[:tag]",
                    reference
                )))
            }
        };

        let (name, tag) = match name_tag.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (name_tag, "latest"),
        };

        if host.is_empty() || collection.is_empty() || name.is_empty() || tag.is_empty() {
            return Err(BuildError::ManifestParse(format!(
                "Invalid hub reference '{}': empty component",
                reference
            )));
        }

        Ok(Self {
            host: host.to_string(),
            collection: collection.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// API path for this image.
    pub fn api_path(&self) -> String {
        format!(
            "/api/container/{}/{}:{}",
            self.collection, self.name, self.tag
        )
    }
}

impl std::fmt::Display for HubReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.host, self.collection, self.name, self.tag
        )
    }
}

/// Hub API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubManifest {
    /// Download URL of the image
    pub image: String,
    /// sha256 hex of the image file
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// HTTP client for hub registries.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    scheme: &'static str,
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    /// HTTPS client.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            scheme: "https",
        }
    }

    /// Plain HTTP client with a direct connection, for local hub mirrors.
    pub fn insecure() -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            scheme: "http",
        }
    }

    fn api_url(&self, reference: &HubReference) -> String {
        format!("{}://{}{}", self.scheme, reference.host, reference.api_path())
    }

    fn image_url(&self, reference: &HubReference, image: &str) -> String {
        if image.starts_with('/') {
            format!("{}://{}{}", self.scheme, reference.host, image)
        } else {
            image.to_string()
        }
    }

    /// Query the API; returns the parsed record and the raw response.
    async fn manifest(&self, reference: &HubReference) -> Result<(HubManifest, Vec<u8>)> {
        let uri = format!("shub://{}", reference);
        let url = self.api_url(reference);
        tracing::debug!(url = %url, "Querying hub API");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| network_error(&uri, e))?;
        check_status(&uri, response.status())?;

        let body = response.bytes().await.map_err(|e| network_error(&uri, e))?;
        let manifest: HubManifest = serde_json::from_slice(&body).map_err(|e| {
            BuildError::ManifestParse(format!("Invalid hub API response for {}: {}", uri, e))
        })?;
        Ok((manifest, body.to_vec()))
    }

    /// Stream the image into `out`.
    async fn download(&self, uri: &str, url: &str, out: &mut PendingBlob) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(uri, e))?;
        check_status(uri, response.status())?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| network_error(uri, e))?;
            out.write_all(&chunk).await?;
        }
        Ok(())
    }
}

fn network_error(uri: &str, err: reqwest::Error) -> BuildError {
    BuildError::Network {
        source_uri: uri.to_string(),
        message: err.to_string(),
    }
}

fn check_status(uri: &str, status: reqwest::StatusCode) -> Result<()> {
    let source_uri = uri.to_string();
    match status.as_u16() {
        200..=299 => Ok(()),
        401 | 403 => Err(BuildError::Auth {
            source_uri,
            message: format!("Hub returned {}", status),
        }),
        404 => Err(BuildError::NotFound {
            source_uri,
            message: format!("Hub returned {}", status),
        }),
        _ => Err(BuildError::Network {
            source_uri,
            message: format!("Hub returned {}", status),
        }),
    }
}

pub struct HubConveyor {
    reference: HubReference,
    client: HubClient,
    pub(crate) state: ConveyorState,
}

impl HubConveyor {
    pub fn new(reference: HubReference, client: HubClient) -> Self {
        Self {
            reference,
            client,
            state: ConveyorState::default(),
        }
    }

    pub fn reference(&self) -> &HubReference {
        &self.reference
    }

    pub(crate) async fn fetch(&self, ctx: &GetContext) -> Result<StagedImage> {
        let uri = format!("shub://{}", self.reference);
        tracing::info!(reference = %self.reference, "Querying hub");

        let (manifest, raw) = ctx.guard(&uri, self.client.manifest(&self.reference)).await?;
        let digest = Digest::from_hex(&manifest.version).map_err(|_| {
            BuildError::ManifestParse(format!(
                "Hub version '{}' for {} is not a sha256 digest",
                manifest.version, uri
            ))
        })?;

        let record = Digest::of_bytes(&raw);
        if !ctx.cache.exists(CacheKind::Metadata, &record) {
            ctx.cache
                .store(CacheKind::Metadata, &record, &raw[..], &ctx.cancel)
                .await?;
        }

        let path = if ctx.cache.exists(CacheKind::Hub, &digest) {
            ctx.blob_cached(CacheKind::Hub, &digest);
            ctx.cache.entry_path(CacheKind::Hub, &digest)
        } else {
            let url = self.client.image_url(&self.reference, &manifest.image);
            let mut pending = ctx.cache.begin(CacheKind::Hub, &digest).await?;
            ctx.guard(&uri, self.client.download(&uri, &url, &mut pending))
                .await?;
            let size = pending.written();
            let path = pending.commit().await?;
            ctx.blob_fetched(CacheKind::Hub, &digest, size);
            path
        };

        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(StagedImage {
            layers: vec![StagedLayer {
                digest,
                media_type: HUB_IMAGE_MEDIA_TYPE.to_string(),
                path,
                size,
            }],
            config: Default::default(),
            manifest_digest: None,
        })
    }
}
