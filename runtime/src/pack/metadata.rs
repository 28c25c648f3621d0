//! Image metadata materialized inside the rootfs.
//!
//! ```text
//! /.stratum.d/
//! ├── env/10-image.sh   exported image environment
//! ├── labels.json       image labels
//! └── runscript         execs entrypoint + cmd
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use stratum_core::error::{BuildError, Result};

use crate::bundle::BundleMetadata;

/// Directory holding the materialized metadata, relative to the rootfs.
pub const METADATA_DIR: &str = ".stratum.d";

/// Base directories every rootfs gets.
const BASE_DIRS: &[(&str, u32)] = &[
    ("dev", 0o755),
    ("proc", 0o555),
    ("sys", 0o555),
    ("tmp", 0o1777),
    ("etc", 0o755),
];

/// Write the metadata files and ensure base directories exist.
pub fn materialize(root: &Path, metadata: &BundleMetadata) -> Result<()> {
    for (dir, mode) in BASE_DIRS {
        let path = root.join(dir);
        match std::fs::symlink_metadata(&path) {
            // Layers may ship these, possibly as symlinks; leave them alone.
            Ok(_) => {}
            Err(_) => {
                std::fs::create_dir(&path).map_err(|e| BuildError::from_io(&path, e))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(*mode))
                    .map_err(|e| BuildError::from_io(&path, e))?;
            }
        }
    }

    let base = root.join(METADATA_DIR);
    let env_dir = base.join("env");
    // Packer-owned; anything a layer shipped here is replaced wholesale.
    crate::fs::remove_node(&base).map_err(|e| BuildError::from_io(&base, e))?;
    std::fs::create_dir_all(&env_dir).map_err(|e| BuildError::from_io(&env_dir, e))?;

    write_file(&env_dir.join("10-image.sh"), env_script(&metadata.env).as_bytes(), 0o644)?;
    write_file(
        &base.join("labels.json"),
        &serde_json::to_vec_pretty(&metadata.labels)?,
        0o644,
    )?;
    write_file(&base.join("runscript"), runscript(metadata).as_bytes(), 0o755)?;

    tracing::debug!(root = %root.display(), env = metadata.env.len(), "Wrote image metadata");
    Ok(())
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| BuildError::from_io(path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| BuildError::from_io(path, e))
}

/// `export KEY='value'` lines for every well-formed `KEY=value` entry.
pub fn env_script(env: &[String]) -> String {
    let mut out = String::from("#!/bin/sh\n");
    for entry in env {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if !is_shell_name(key) {
            tracing::debug!(entry = %entry, "Skipping env entry with invalid name");
            continue;
        }
        out.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    out
}

/// Runscript that sources the env files and execs the image command.
pub fn runscript(metadata: &BundleMetadata) -> String {
    let mut out = String::from("#!/bin/sh\n");
    out.push_str(&format!(
        "for f in /{}/env/*.sh; do [ -r \"$f\" ] && . \"$f\"; done\n",
        METADATA_DIR
    ));
    if let Some(dir) = metadata.working_dir.as_deref().filter(|d| !d.is_empty()) {
        out.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }

    let command = metadata.command_line();
    if command.is_empty() {
        out.push_str("exec /bin/sh \"$@\"\n");
    } else {
        let quoted: Vec<String> = command.iter().map(|a| shell_quote(a)).collect();
        out.push_str(&format!("exec {} \"$@\"\n", quoted.join(" ")));
    }
    out
}

fn is_shell_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Single-quote `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
