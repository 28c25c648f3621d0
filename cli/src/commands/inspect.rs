//! `stratum inspect` command.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stratum_runtime::assemble::SectionDescriptor;
use stratum_runtime::PackedImage;

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Packed image file
    pub image: PathBuf,

    /// Print the embedded metadata as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InspectArgs) -> anyhow::Result<()> {
    let path = args.image.clone();
    let image = tokio::task::spawn_blocking(move || PackedImage::open(&path))
        .await?
        .with_context(|| format!("opening {}", args.image.display()))?;
    let metadata = image.read_metadata()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("Image:    {}", image.path().display());
    println!("Size:     {}", output::format_bytes(image.len()));
    println!("Source:   {}", metadata.source);
    if let Some(digest) = &metadata.manifest_digest {
        println!("Manifest: {digest}");
    }
    println!("Created:  {}", metadata.created.to_rfc3339());
    println!("Layers:   {}", metadata.layers.len());
    let command = metadata.command_line();
    if !command.is_empty() {
        println!("Command:  {}", command.join(" "));
    }
    if let Some(dir) = &metadata.working_dir {
        println!("Workdir:  {dir}");
    }
    for warning in &metadata.warnings {
        println!("Warning:  {warning}");
    }

    println!();
    let mut table = output::new_table(&["SECTION", "OFFSET", "LENGTH", "FLAGS"]);
    for section in image.sections() {
        table.add_row(section_row(section));
    }
    println!("{table}");
    Ok(())
}

fn section_row(section: &SectionDescriptor) -> Vec<String> {
    let name = match section.kind() {
        Some(kind) => format!("{kind:?}").to_lowercase(),
        None => format!("unknown({})", section.section_type),
    };
    let flags = if section.is_gzip() { "gzip" } else { "-" };
    vec![
        name,
        section.offset.to_string(),
        output::format_bytes(section.length),
        flags.to_string(),
    ]
}
