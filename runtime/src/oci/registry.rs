//! Registry access for the registry conveyor.
//!
//! [`RegistryTransport`] is the seam between the conveyor and the network.
//! The production implementation wraps an `oci-distribution` client; tests
//! substitute an in-memory registry.

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use stratum_core::error::{BuildError, Result};
use tokio::io::AsyncWrite;

use super::reference::ImageReference;

/// Environment variable holding the registry username.
pub const ENV_REGISTRY_USERNAME: &str = "REGISTRY_USERNAME";

/// Environment variable holding the registry password.
pub const ENV_REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";

/// Registry credentials.
#[derive(Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Basic credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`,
    /// anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var(ENV_REGISTRY_USERNAME),
            std::env::var(ENV_REGISTRY_PASSWORD),
        ) {
            (Ok(user), Ok(pass)) if !user.is_empty() => Self::basic(user, pass),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Network operations the registry conveyor needs.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Fetch the platform-resolved image manifest and its digest.
    async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(OciImageManifest, String)>;

    /// Stream one blob into `out`.
    async fn pull_blob(
        &self,
        reference: &ImageReference,
        descriptor: &OciDescriptor,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;
}

/// [`RegistryTransport`] backed by `oci-distribution`.
pub struct OciRegistryTransport {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistryTransport {
    /// HTTPS client resolving multi-arch indexes to linux/host-arch.
    pub fn new(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Https)
    }

    /// Client with an explicit protocol (plain HTTP for local registries).
    pub fn with_protocol(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }
}

impl std::fmt::Debug for OciRegistryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRegistryTransport")
            .field("auth", &self.auth)
            .finish()
    }
}

#[async_trait]
impl RegistryTransport for OciRegistryTransport {
    async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(OciImageManifest, String)> {
        let oci_ref = to_oci_reference(reference)?;
        self.client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| map_registry_error(reference, "pull manifest", e))
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        descriptor: &OciDescriptor,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        // Relies on the pull token stored by the preceding manifest pull.
        let oci_ref = to_oci_reference(reference)?;
        self.client
            .pull_blob(&oci_ref, descriptor, out)
            .await
            .map_err(|e| {
                map_registry_error(reference, &format!("pull blob {}", descriptor.digest), e)
            })
    }
}

/// Convert to an `oci-distribution` reference.
pub fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.pull_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        BuildError::ManifestParse(format!("Invalid registry reference '{}': {}", ref_str, e))
    })
}

/// Classify a client error as auth, not-found or network failure.
fn map_registry_error(
    reference: &ImageReference,
    action: &str,
    err: OciDistributionError,
) -> BuildError {
    let source_uri = format!("docker://{}", reference);
    let message = format!("Failed to {}: {}", action, err);
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => {
            BuildError::Auth { source_uri, message }
        }
        OciDistributionError::ImageManifestNotFoundError(_) => {
            BuildError::NotFound { source_uri, message }
        }
        OciDistributionError::ServerError { code: 401 | 403, .. } => {
            BuildError::Auth { source_uri, message }
        }
        OciDistributionError::ServerError { code: 404, .. } => {
            BuildError::NotFound { source_uri, message }
        }
        _ => BuildError::Network { source_uri, message },
    }
}

/// Selects the linux image for the host CPU from a multi-arch index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map(|p| p.os == "linux" && p.architecture == arch)
                .unwrap_or(false)
        })
        .map(|entry| entry.digest.clone())
}

/// Host CPU in OCI platform naming.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
