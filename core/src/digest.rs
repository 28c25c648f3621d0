//! Content digests.
//!
//! A [`Digest`] identifies a blob by the SHA-256 of its bytes, written as
//! `sha256:<64 lowercase hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{BuildError, Result};

const ALGORITHM: &str = "sha256";
const HEX_LEN: usize = 64;

/// A validated `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse a digest string.
    ///
    /// Only `sha256` digests with exactly 64 hex characters are accepted.
    /// Upper-case hex is normalized to lower case.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            BuildError::ManifestParse(format!("Invalid digest '{}': expected algorithm:hex", s))
        })?;

        if algorithm != ALGORITHM {
            return Err(BuildError::ManifestParse(format!(
                "Unsupported digest algorithm '{}' in '{}'",
                algorithm, s
            )));
        }

        Self::from_hex(hex).map_err(|_| {
            BuildError::ManifestParse(format!(
                "Invalid digest '{}': expected {} hex characters",
                s, HEX_LEN
            ))
        })
    }

    /// Build a digest from a bare hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BuildError::ManifestParse(format!(
                "Invalid sha256 hex '{}'",
                hex
            )));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish a running SHA-256 hasher into a digest.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Hash algorithm name.
    pub fn algorithm(&self) -> &str {
        ALGORITHM
    }

    /// Bare lowercase hex, used as the on-disk file name.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Shortened form for log output.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.hex)
    }
}

impl FromStr for Digest {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}
