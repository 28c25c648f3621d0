//! Stratum Core - Foundational Types
//!
//! Error taxonomy, configuration, content digests and build events shared by
//! the stratum build pipeline and its front ends.

pub mod config;
pub mod digest;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{
    CacheConfig, IdMapping, PipelineConfig, SpecialFileAction, SpecialFilePolicy, StratumConfig,
};
pub use digest::Digest;
pub use error::{BuildError, BuildStage, Result};
pub use event::{BuildEvent, EventEmitter};

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
