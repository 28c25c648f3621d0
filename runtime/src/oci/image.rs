//! Image configuration parsing.

use std::collections::BTreeMap;

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use stratum_core::error::{BuildError, Result};

/// Runtime-relevant part of an OCI image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// Environment entries exactly as recorded (`KEY=value`)
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// Parse a config blob.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: ImageConfiguration = serde_json::from_slice(data)
            .map_err(|e| BuildError::ManifestParse(format!("Failed to parse image config: {}", e)))?;
        Ok(Self::from_oci_config(&config))
    }

    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let Some(config) = oci_config.config() else {
            return Self::default();
        };

        let mut exposed_ports: Vec<String> = config.exposed_ports().clone().unwrap_or_default();
        exposed_ports.sort();

        Self {
            entrypoint: config.entrypoint().clone(),
            cmd: config.cmd().clone(),
            env: config.env().clone().unwrap_or_default(),
            working_dir: config.working_dir().clone().filter(|w| !w.is_empty()),
            user: config.user().clone().filter(|u| !u.is_empty()),
            exposed_ports,
            labels: config
                .labels()
                .clone()
                .map(|l| l.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    /// Environment split into key/value pairs; malformed entries are dropped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|e| e.split_once('='))
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
