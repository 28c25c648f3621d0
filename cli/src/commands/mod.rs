//! CLI command definitions and dispatch.

mod build;
mod cache;
mod inspect;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use stratum_core::StratumConfig;
use stratum_runtime::ImageCache;

/// Stratum - container image build pipeline.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Log filter implied by `-v`.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a source URI
    Build(build::BuildArgs),
    /// Inspect or clean the blob cache
    #[command(subcommand)]
    Cache(cache::CacheCommand),
    /// Show the sections and metadata of a packed image
    Inspect(inspect::InspectArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load configuration from `--config`, or defaults plus environment.
pub(crate) fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StratumConfig> {
    match path {
        Some(path) => StratumConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(StratumConfig::from_env()),
    }
}

/// Open the shared blob cache.
pub(crate) fn open_cache(config: &StratumConfig) -> anyhow::Result<Arc<ImageCache>> {
    let cache = ImageCache::open(&config.cache).context("opening blob cache")?;
    Ok(Arc::new(cache))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    tracing::debug!(
        config = ?cli.config,
        cache_dir = ?config.cache.dir,
        cache_disabled = config.cache.disabled,
        "Loaded configuration"
    );
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Cache(cmd) => cache::execute(cmd, config).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        let cli = Cli::parse_from(["stratum", "version"]);
        assert_eq!(cli.log_level(), "warn");
        let cli = Cli::parse_from(["stratum", "-v", "version"]);
        assert_eq!(cli.log_level(), "info");
        let cli = Cli::parse_from(["stratum", "version", "-vvv"]);
        assert_eq!(cli.log_level(), "debug");
    }

    #[test]
    fn test_cache_subcommands_parse() {
        let cli = Cli::parse_from(["stratum", "cache", "clean", "--kind", "blob", "--older-than", "7d"]);
        assert!(matches!(cli.command, Command::Cache(cache::CacheCommand::Clean(_))));
        assert!(Cli::try_parse_from(["stratum", "cache", "list", "--kind", "nope"]).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stratum.yaml");
        std::fs::write(&path, "build:\n  keep_bundle: true\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert!(config.build.keep_bundle);
        assert!(load_config(Some(&tmp.path().join("missing.yaml"))).is_err());
    }
}
