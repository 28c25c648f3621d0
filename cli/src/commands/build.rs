//! `stratum build` command.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stratum_core::event::{events, BuildEvent, EventPayload};
use stratum_core::{SpecialFilePolicy, StratumConfig};
use stratum_runtime::{BuildRequest, OutputFormat, Pipeline};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct BuildArgs {
    /// Source URI (docker://, oci://, shub://, scratch://)
    pub source: String,

    /// Output path
    pub destination: PathBuf,

    /// Output format: packed or sandbox
    #[arg(short, long, default_value_t = OutputFormat::Packed)]
    pub format: OutputFormat,

    /// Replace an existing destination
    #[arg(long)]
    pub force: bool,

    /// Keep the bundle directory after the build
    #[arg(long)]
    pub keep_bundle: bool,

    /// Parent directory for bundle working directories
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Use a throwaway cache for this build
    #[arg(long)]
    pub no_cache: bool,

    /// Per-operation network deadline in seconds (0 disables)
    #[arg(long)]
    pub network_timeout: Option<u64>,

    /// Never create device nodes or FIFOs from layers
    #[arg(long)]
    pub skip_special_files: bool,

    /// Print the build result as JSON
    #[arg(long)]
    pub json: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl BuildArgs {
    fn apply(&self, config: &mut StratumConfig) {
        if self.keep_bundle {
            config.build.keep_bundle = true;
        }
        if let Some(dir) = &self.tmp_dir {
            config.build.tmp_dir = Some(dir.clone());
        }
        if self.no_cache {
            config.cache.disabled = true;
        }
        if let Some(secs) = self.network_timeout {
            config.build.network_timeout_secs = secs;
        }
        if self.skip_special_files {
            config.build.special_files = SpecialFilePolicy::skip_all();
        }
    }
}

pub async fn execute(args: BuildArgs, mut config: StratumConfig) -> anyhow::Result<()> {
    args.apply(&mut config);
    let cache = super::open_cache(&config)?;
    let pipeline = Pipeline::new(cache, config.build.clone());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cleaning up...");
            on_interrupt.cancel();
        }
    });

    let progress = (!args.quiet && !args.json).then(|| {
        let mut rx = pipeline.events().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(line) = describe(&event) {
                            eprintln!("{line}");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let request = BuildRequest::new(&args.source, &args.destination)
        .with_format(args.format)
        .with_overwrite(args.force);
    let result = pipeline.build(&request, &cancel).await;

    drop(pipeline);
    if let Some(task) = progress {
        let _ = task.await;
    }

    let artifact = result.with_context(|| format!("building {}", args.source))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(());
    }
    for warning in &artifact.warnings {
        eprintln!("WARNING: {warning}");
    }
    if !args.quiet {
        println!(
            "Built {} ({}, {}) in {:.1}s",
            artifact.path.display(),
            artifact.format,
            output::format_bytes(artifact.size_bytes),
            artifact.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

/// Progress line for events worth showing on a terminal.
fn describe(event: &BuildEvent) -> Option<String> {
    let field = |name: &str| match &event.payload {
        EventPayload::Map(map) => map.get(name).and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    };
    match event.key.as_str() {
        events::STAGE_STARTED => field("stage").map(|stage| format!("==> {stage}")),
        events::BLOB_FETCHED => field("digest").map(|digest| format!("    fetched {digest}")),
        events::BLOB_CACHED => field("digest").map(|digest| format!("    cached {digest}")),
        _ => None,
    }
}
