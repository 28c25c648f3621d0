//! `stratum cache` commands.

use clap::{Args, Subcommand};
use stratum_core::StratumConfig;
use stratum_runtime::{CacheEntry, CacheKind, CleanPolicy};

use crate::output;

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached entries
    List(ListArgs),
    /// Remove cached entries
    Clean(CleanArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show entries of this kind (blob, oci-layout, hub, metadata)
    #[arg(long, value_parser = parse_kind)]
    pub kind: Option<CacheKind>,

    /// Only show digests (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Kinds to remove; repeatable, default every kind
    #[arg(long, value_parser = parse_kind)]
    pub kind: Vec<CacheKind>,

    /// Only remove entries older than this (e.g. "12h", "7d")
    #[arg(long, value_parser = output::parse_age)]
    pub older_than: Option<chrono::Duration>,

    /// Show what would be removed without removing it
    #[arg(long)]
    pub dry_run: bool,
}

fn parse_kind(s: &str) -> Result<CacheKind, String> {
    CacheKind::from_name(s).ok_or_else(|| {
        let names: Vec<_> = CacheKind::ALL.iter().map(|k| k.dir_name()).collect();
        format!("unknown cache kind '{s}' (expected one of: {})", names.join(", "))
    })
}

pub async fn execute(cmd: CacheCommand, config: StratumConfig) -> anyhow::Result<()> {
    match cmd {
        CacheCommand::List(args) => list(args, &config),
        CacheCommand::Clean(args) => clean(args, &config),
    }
}

fn list(args: ListArgs, config: &StratumConfig) -> anyhow::Result<()> {
    let cache = super::open_cache(config)?;
    let entries = cache.list(args.kind)?;

    if args.quiet {
        for entry in &entries {
            println!("{}", entry.digest);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["KIND", "DIGEST", "SIZE", "MODIFIED"]);
    for entry in &entries {
        table.add_row(row(entry));
    }
    println!("{table}");

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!(
        "\n{} entries, {} in {}",
        entries.len(),
        output::format_bytes(total),
        cache.root().display()
    );
    Ok(())
}

fn row(entry: &CacheEntry) -> Vec<String> {
    vec![
        entry.kind.to_string(),
        format!("{}:{}", entry.digest.algorithm(), entry.digest.short()),
        output::format_bytes(entry.size_bytes),
        output::format_ago(&entry.modified),
    ]
}

fn clean(args: CleanArgs, config: &StratumConfig) -> anyhow::Result<()> {
    let cache = super::open_cache(config)?;
    let policy = CleanPolicy {
        kinds: args.kind,
        older_than: args.older_than,
    };

    if args.dry_run {
        let now = chrono::Utc::now();
        let matching: Vec<_> = cache
            .list(None)?
            .into_iter()
            .filter(|e| policy.matches(e, now))
            .collect();
        for entry in &matching {
            println!("would remove {} {}", entry.kind, entry.digest);
        }
        let bytes: u64 = matching.iter().map(|e| e.size_bytes).sum();
        println!(
            "{} entries, {} would be freed",
            matching.len(),
            output::format_bytes(bytes)
        );
        return Ok(());
    }

    let report = cache.clean_with_policy(&policy)?;
    println!(
        "Removed {} entries ({} freed)",
        report.entries_removed,
        output::format_bytes(report.bytes_freed)
    );
    if report.temp_files_removed > 0 {
        println!("Removed {} stale temporary files", report.temp_files_removed);
    }
    Ok(())
}
