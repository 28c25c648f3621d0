//! Assemblers: write a packed bundle to its final output format.

pub mod packed;
pub mod sandbox;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stratum_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::bundle::Bundle;

pub use packed::{PackedAssembler, PackedImage, SectionDescriptor, SectionType};
pub use sandbox::SandboxAssembler;

/// Output format of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Writable directory tree
    Sandbox,
    /// Single-file packed image
    #[default]
    Packed,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Packed => "packed",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" | "dir" => Ok(Self::Sandbox),
            "packed" | "image" => Ok(Self::Packed),
            other => Err(BuildError::Config(format!(
                "Unknown output format '{}' (expected sandbox or packed)",
                other
            ))),
        }
    }
}

/// Closed set of output drivers.
#[derive(Debug, Clone)]
pub enum Assembler {
    Sandbox(SandboxAssembler),
    Packed(PackedAssembler),
}

impl Assembler {
    pub fn for_format(format: OutputFormat, overwrite: bool) -> Self {
        match format {
            OutputFormat::Sandbox => Self::Sandbox(SandboxAssembler::new(overwrite)),
            OutputFormat::Packed => Self::Packed(PackedAssembler::new(overwrite)),
        }
    }

    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Sandbox(_) => OutputFormat::Sandbox,
            Self::Packed(_) => OutputFormat::Packed,
        }
    }

    /// Write `bundle` to `dest`. The bundle is left untouched and a failure
    /// leaves no partial output at `dest`.
    pub async fn assemble(
        &self,
        bundle: &Bundle,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        match self {
            Self::Sandbox(a) => a.assemble(bundle, dest, cancel).await,
            Self::Packed(a) => a.assemble(bundle, dest, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("sandbox".parse::<OutputFormat>().unwrap(), OutputFormat::Sandbox);
        assert_eq!("DIR".parse::<OutputFormat>().unwrap(), OutputFormat::Sandbox);
        assert_eq!("packed".parse::<OutputFormat>().unwrap(), OutputFormat::Packed);
        assert!("squashfs".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default().to_string(), "packed");
    }

    #[test]
    fn test_for_format() {
        assert_eq!(
            Assembler::for_format(OutputFormat::Sandbox, false).format(),
            OutputFormat::Sandbox
        );
        assert_eq!(
            Assembler::for_format(OutputFormat::Packed, true).format(),
            OutputFormat::Packed
        );
    }
}
