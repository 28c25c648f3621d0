use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Environment variable overriding the cache parent directory.
pub const ENV_CACHE_DIR: &str = "STRATUM_CACHEDIR";

/// Environment variable disabling the persistent cache (`1`/`true`).
pub const ENV_DISABLE_CACHE: &str = "STRATUM_DISABLE_CACHE";

/// Top-level stratum configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    /// Blob cache configuration
    pub cache: CacheConfig,

    /// Build pipeline configuration
    pub build: PipelineConfig,
}

impl StratumConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: StratumConfig = serde_yaml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `STRATUM_*` environment overrides in place.
    pub fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(ENV_CACHE_DIR) {
            if !dir.is_empty() {
                self.cache.dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(value) = std::env::var(ENV_DISABLE_CACHE) {
            self.cache.disabled = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }
}

/// Blob cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Parent directory for the cache layout (default: `<user cache dir>/stratum`)
    pub dir: Option<PathBuf>,

    /// Use a throwaway cache removed when the handle is dropped
    pub disabled: bool,
}

impl CacheConfig {
    /// Cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            disabled: false,
        }
    }

    /// Resolve the parent directory the cache lives under.
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|d| d.join("stratum"))
            .ok_or_else(|| BuildError::Config("Cannot determine cache directory".to_string()))
    }
}

/// Build pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent directory for bundle working directories (default: system temp dir)
    pub tmp_dir: Option<PathBuf>,

    /// Keep the bundle directory after the build for debugging
    pub keep_bundle: bool,

    /// Deadline for each network operation, in seconds (0 = none)
    pub network_timeout_secs: u64,

    /// Handling of device nodes and FIFOs found in layers
    pub special_files: SpecialFilePolicy,

    /// Ownership normalization applied after unpacking
    pub id_mapping: IdMapping,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tmp_dir: None,
            keep_bundle: false,
            network_timeout_secs: 300,
            special_files: SpecialFilePolicy::default(),
            id_mapping: IdMapping::default(),
        }
    }
}

impl PipelineConfig {
    /// Network deadline as a duration, `None` when disabled.
    pub fn network_timeout(&self) -> Option<std::time::Duration> {
        (self.network_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.network_timeout_secs))
    }

    /// Directory bundles are created under.
    pub fn resolve_tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// What to do with one class of special file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialFileAction {
    /// Try to create the node; skip with a warning if the host refuses
    Create,
    /// Never create the node; record a warning
    Skip,
}

/// Policy for special files encountered while unpacking layers.
///
/// Sandboxed builds commonly lack the privilege to create device nodes, so a
/// refused `mknod` always degrades to a recorded warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialFilePolicy {
    pub char_devices: SpecialFileAction,
    pub block_devices: SpecialFileAction,
    pub fifos: SpecialFileAction,
}

impl Default for SpecialFilePolicy {
    fn default() -> Self {
        Self {
            char_devices: SpecialFileAction::Create,
            block_devices: SpecialFileAction::Create,
            fifos: SpecialFileAction::Create,
        }
    }
}

impl SpecialFilePolicy {
    /// Skip every special file.
    pub fn skip_all() -> Self {
        Self {
            char_devices: SpecialFileAction::Skip,
            block_devices: SpecialFileAction::Skip,
            fifos: SpecialFileAction::Skip,
        }
    }
}

/// Ownership mapping applied uniformly across the unpacked tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum IdMapping {
    /// Keep the ids recorded in the layers
    #[default]
    Preserve,
    /// Map every id to a single uid/gid
    Squash { uid: u32, gid: u32 },
    /// Map `[container, container + size)` onto `[host, host + size)`;
    /// ids outside the range become the overflow id 65534
    Shift { container: u32, host: u32, size: u32 },
}

/// Id assigned to ids that fall outside a shifted range.
pub const OVERFLOW_ID: u32 = 65534;

impl IdMapping {
    /// Map a single uid.
    pub fn map_uid(&self, id: u32) -> u32 {
        match *self {
            IdMapping::Preserve => id,
            IdMapping::Squash { uid, .. } => uid,
            IdMapping::Shift { .. } => self.shift(id),
        }
    }

    /// Map a single gid.
    pub fn map_gid(&self, id: u32) -> u32 {
        match *self {
            IdMapping::Preserve => id,
            IdMapping::Squash { gid, .. } => gid,
            IdMapping::Shift { .. } => self.shift(id),
        }
    }

    fn shift(&self, id: u32) -> u32 {
        match *self {
            IdMapping::Shift {
                container,
                host,
                size,
            } if id >= container && id - container < size => {
                host.checked_add(id - container).unwrap_or(OVERFLOW_ID)
            }
            IdMapping::Shift { .. } => OVERFLOW_ID,
            _ => id,
        }
    }
}
