//! `stratum version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> anyhow::Result<()> {
    println!("stratum version {}", stratum_core::VERSION);
    println!("runtime {}", stratum_runtime::VERSION);
    Ok(())
}
