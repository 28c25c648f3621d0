use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    /// Creating the bundle working directory
    Bundle,
    /// Conveyor fetch
    Get,
    /// Packer unpack
    Pack,
    /// Assembler output
    Assemble,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bundle => write!(f, "bundle"),
            Self::Get => write!(f, "get"),
            Self::Pack => write!(f, "pack"),
            Self::Assemble => write!(f, "assemble"),
        }
    }
}

/// Stratum error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Cache directory or configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote source unreachable or returned an unexpected response
    #[error("Network error: {source_uri} - {message}")]
    Network { source_uri: String, message: String },

    /// Remote source denied access
    #[error("Authentication failed: {source_uri} - {message}")]
    Auth { source_uri: String, message: String },

    /// Remote object does not exist
    #[error("Not found: {source_uri} - {message}")]
    NotFound { source_uri: String, message: String },

    /// Malformed manifest, config, digest or source URI
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    /// Fetched bytes do not hash to the claimed digest
    #[error("Digest mismatch for {kind} blob: expected {expected}, got {actual}")]
    DigestMismatch {
        kind: String,
        expected: String,
        actual: String,
    },

    /// Malformed layer contents
    #[error("Unpack error: {0}")]
    Unpack(String),

    /// Layer format the packer cannot apply
    #[error("Unsupported layer: {0}")]
    UnsupportedLayer(String),

    /// Destination already exists and overwrite was not requested
    #[error("Destination already exists: {}", .0.display())]
    Exists(PathBuf),

    /// Local filesystem refused an operation
    #[error("Permission denied: {} - {message}", path.display())]
    Permission { path: PathBuf, message: String },

    /// Packed image file failed validation
    #[error("Invalid packed image: {0}")]
    PackedFormat(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// Failure tagged with the pipeline stage it came from
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: BuildStage,
        #[source]
        source: Box<BuildError>,
    },
}

impl BuildError {
    /// Tag this error with the stage it occurred in.
    ///
    /// An error that is already tagged keeps its original stage.
    pub fn in_stage(self, stage: BuildStage) -> Self {
        match self {
            tagged @ BuildError::Stage { .. } => tagged,
            other => BuildError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error is tagged with, if any.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            BuildError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage tag removed.
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a caller-level retry of the whole operation makes sense.
    ///
    /// Cache writes are idempotent by content address, so retrying after a
    /// transient failure never duplicates work already committed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            BuildError::Network { .. } | BuildError::Cancelled | BuildError::Io(_)
        )
    }

    /// Map an I/O error on `path` to `Permission` when the OS refused it.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            BuildError::Permission {
                path: path.into(),
                message: err.to_string(),
            }
        } else {
            BuildError::Io(err)
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, BuildError>;
