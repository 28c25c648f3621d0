//! Layer application onto a staging rootfs.
//!
//! Layers are applied in manifest order. Each entry path is normalized and
//! resolved inside the root, so neither `..` members nor symlinks planted by
//! earlier entries can direct a write outside the rootfs.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use stratum_core::error::{BuildError, Result};
use stratum_core::{SpecialFileAction, SpecialFilePolicy};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use xz2::read::XzDecoder;

use crate::fs::{self as rootfs_fs, DeviceKind, FileTime};
use crate::source::StagedLayer;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Compression of a layer blob, detected from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl LayerCompression {
    /// Detect the compression of a blob from its first block.
    ///
    /// A plain tar must carry a ustar magic or start with a zero block.
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(&[0x1f, 0x8b]) {
            return Some(Self::Gzip);
        }
        if head.starts_with(b"BZh") {
            return Some(Self::Bzip2);
        }
        if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            return Some(Self::Xz);
        }
        if head.is_empty() {
            return Some(Self::None);
        }
        if head.len() >= 262 && &head[257..262] == b"ustar" {
            return Some(Self::None);
        }
        if head.len() == 512 && head.iter().all(|b| *b == 0) {
            return Some(Self::None);
        }
        None
    }
}

/// Applies layers onto one root and remembers what must be finalized.
pub struct LayerApplier {
    root: PathBuf,
    policy: SpecialFilePolicy,
    ids: (u32, u32),
    /// Final mode and mtime of every directory, applied by [`finish`]
    ///
    /// [`finish`]: LayerApplier::finish
    dirs: HashMap<PathBuf, (u32, i64)>,
    warnings: Vec<String>,
    chown_refused: bool,
}

impl LayerApplier {
    pub fn new(root: impl Into<PathBuf>, policy: SpecialFilePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            ids: rootfs_fs::effective_ids(),
            dirs: HashMap::new(),
            warnings: Vec::new(),
            chown_refused: false,
        }
    }

    /// Non-fatal problems recorded so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(root = %self.root.display(), "{}", message);
        self.warnings.push(message);
    }

    /// Apply one staged layer.
    pub fn apply(&mut self, layer: &StagedLayer, cancel: &CancellationToken) -> Result<()> {
        if layer.is_foreign() {
            return Err(BuildError::UnsupportedLayer(format!(
                "{} has foreign media type {}",
                layer.digest, layer.media_type
            )));
        }
        let reader = open_layer(&layer.path, &layer.digest.to_string())?;
        let entries = self.apply_archive(reader, cancel).map_err(|e| match e {
            BuildError::Io(io) => {
                BuildError::Unpack(format!("Layer {}: {}", layer.digest.short(), io))
            }
            other => other,
        })?;

        tracing::debug!(
            digest = %layer.digest,
            entries,
            root = %self.root.display(),
            "Applied layer"
        );
        Ok(())
    }

    /// Apply every member of a tar stream, returning the number of members.
    pub fn apply_archive<R: Read>(&mut self, reader: R, cancel: &CancellationToken) -> Result<usize> {
        let mut archive = Archive::new(reader);
        let mut created: HashSet<PathBuf> = HashSet::new();
        let mut count = 0;

        for entry in archive.entries()? {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let mut entry = entry?;
            count += 1;

            let raw = entry.path()?.into_owned();
            let rel = rootfs_fs::normalize_relative(&raw).ok_or_else(|| {
                BuildError::Unpack(format!("Entry {} escapes the rootfs", raw.display()))
            })?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let full = rootfs_fs::resolve_in_root(&self.root, &rel)
                .map_err(|e| BuildError::Unpack(format!("Resolve {}: {}", rel.display(), e)))?;
            let parent = full.parent().unwrap_or(&self.root).to_path_buf();
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if name == OPAQUE_WHITEOUT {
                self.clear_directory(&parent, &created)?;
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                self.remove(&parent.join(hidden))?;
                continue;
            }

            std::fs::create_dir_all(&parent).map_err(|e| {
                BuildError::Unpack(format!("Create parent of {}: {}", rel.display(), e))
            })?;

            let header = entry.header();
            let entry_type = header.entry_type();
            let mode = header.mode().unwrap_or(0o644);
            let mtime = header.mtime().unwrap_or(0) as i64;
            let uid = header.uid().unwrap_or(0) as u32;
            let gid = header.gid().unwrap_or(0) as u32;
            let major = header.device_major().ok().flatten().unwrap_or(0);
            let minor = header.device_minor().ok().flatten().unwrap_or(0);

            let existing = std::fs::symlink_metadata(&full).ok();
            let keep_existing_dir =
                entry_type == EntryType::Directory && existing.as_ref().is_some_and(|m| m.is_dir());
            if existing.is_some() && !keep_existing_dir {
                self.remove(&full)?;
            }

            let materialized = match entry_type {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    entry.set_preserve_permissions(true);
                    entry.set_preserve_mtime(true);
                    entry.unpack(&full)?;
                    true
                }
                EntryType::Directory => {
                    if !keep_existing_dir {
                        std::fs::create_dir(&full).map_err(|e| BuildError::from_io(&full, e))?;
                    }
                    // Stay writable until finish().
                    std::fs::set_permissions(&full, std::fs::Permissions::from_mode(0o755))
                        .map_err(|e| BuildError::from_io(&full, e))?;
                    self.dirs.insert(full.clone(), (mode & 0o7777, mtime));
                    true
                }
                EntryType::Symlink => {
                    let target = entry.link_name()?.ok_or_else(|| {
                        BuildError::Unpack(format!("Symlink {} has no target", rel.display()))
                    })?;
                    std::os::unix::fs::symlink(&target, &full)
                        .map_err(|e| BuildError::from_io(&full, e))?;
                    let _ = rootfs_fs::set_times(
                        &full,
                        FileTime::from_secs(mtime),
                        FileTime::from_secs(mtime),
                    );
                    true
                }
                EntryType::Link => {
                    let target = entry.link_name()?.ok_or_else(|| {
                        BuildError::Unpack(format!("Hard link {} has no target", rel.display()))
                    })?;
                    self.hard_link(&rel, &target, &full)?;
                    true
                }
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    self.special_file(&rel, &full, entry_type, mode, major, minor)?
                }
                other => {
                    tracing::debug!(path = %rel.display(), entry_type = ?other, "Skipping tar member");
                    false
                }
            };

            if materialized {
                self.chown(&full, uid, gid, entry_type, mode)?;
                created.insert(full.clone());
                let mut ancestor = full.parent();
                while let Some(dir) = ancestor {
                    if dir == self.root || !created.insert(dir.to_path_buf()) {
                        break;
                    }
                    ancestor = dir.parent();
                }
            }
        }

        Ok(count)
    }

    /// Remove a node and forget any directory modes recorded beneath it.
    fn remove(&mut self, path: &Path) -> Result<()> {
        rootfs_fs::remove_node(path).map_err(|e| BuildError::from_io(path, e))?;
        self.dirs.retain(|dir, _| !dir.starts_with(path));
        Ok(())
    }

    /// Remove everything below `dir` that the current layer did not create.
    ///
    /// Directories the layer created (or wrote into) are kept but cleared
    /// recursively, so no earlier-layer node survives under `dir`.
    fn clear_directory(&mut self, dir: &Path, created: &HashSet<PathBuf>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BuildError::from_io(dir, e)),
        };
        let mut children = Vec::new();
        for child in entries {
            children.push(child?.path());
        }
        for child in children {
            if !created.contains(&child) {
                self.remove(&child)?;
            } else if std::fs::symlink_metadata(&child).is_ok_and(|m| m.is_dir()) {
                self.clear_directory(&child, created)?;
            }
        }
        Ok(())
    }

    fn hard_link(&mut self, rel: &Path, target: &Path, full: &Path) -> Result<()> {
        let target_rel = rootfs_fs::normalize_relative(target).ok_or_else(|| {
            BuildError::Unpack(format!(
                "Hard link {} -> {} escapes the rootfs",
                rel.display(),
                target.display()
            ))
        })?;
        let source = rootfs_fs::resolve_in_root(&self.root, &target_rel)
            .map_err(|e| BuildError::Unpack(format!("Resolve {}: {}", target.display(), e)))?;
        match std::fs::symlink_metadata(&source) {
            Ok(meta) if !meta.is_dir() => {}
            _ => {
                return Err(BuildError::Unpack(format!(
                    "Hard link {} -> {}: target does not exist",
                    rel.display(),
                    target.display()
                )))
            }
        }
        std::fs::hard_link(&source, full).map_err(|e| BuildError::from_io(full, e))
    }

    /// Create a device node or FIFO per policy; returns whether it exists.
    fn special_file(
        &mut self,
        rel: &Path,
        full: &Path,
        entry_type: EntryType,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<bool> {
        let (action, label) = match entry_type {
            EntryType::Char => (self.policy.char_devices, "char device"),
            EntryType::Block => (self.policy.block_devices, "block device"),
            _ => (self.policy.fifos, "fifo"),
        };
        if action == SpecialFileAction::Skip {
            self.warn(format!("Skipped {} {}", label, rel.display()));
            return Ok(false);
        }

        let result = match entry_type {
            EntryType::Char => rootfs_fs::mknod(full, DeviceKind::Char, mode, major, minor),
            EntryType::Block => rootfs_fs::mknod(full, DeviceKind::Block, mode, major, minor),
            _ => rootfs_fs::mkfifo(full, mode),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if rootfs_fs::is_permission_error(&e) => {
                self.warn(format!("Skipped {} {}: {}", label, rel.display(), e));
                Ok(false)
            }
            Err(e) => Err(BuildError::from_io(full, e)),
        }
    }

    fn chown(&mut self, full: &Path, uid: u32, gid: u32, entry_type: EntryType, mode: u32) -> Result<()> {
        if (uid, gid) == self.ids || self.chown_refused {
            return Ok(());
        }
        match rootfs_fs::lchown(full, uid, gid) {
            Ok(()) => {
                // chown clears setuid/setgid on regular files.
                if entry_type.is_file() && mode & 0o6000 != 0 {
                    std::fs::set_permissions(full, std::fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(|e| BuildError::from_io(full, e))?;
                }
                Ok(())
            }
            Err(e) if rootfs_fs::is_permission_error(&e) => {
                self.chown_refused = true;
                self.warn(format!(
                    "Ownership from layers not preserved: host refused lchown ({})",
                    e
                ));
                Ok(())
            }
            Err(e) => Err(BuildError::from_io(full, e)),
        }
    }

    /// Apply deferred directory modes and mtimes, deepest first.
    pub fn finish(&mut self) -> Result<()> {
        let mut dirs: Vec<(PathBuf, (u32, i64))> = self.dirs.drain().collect();
        dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));

        for (path, (mode, mtime)) in dirs {
            // set_permissions follows symlinks; only touch real directories.
            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BuildError::from_io(&path, e)),
            }
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| BuildError::from_io(&path, e))?;
            let time = FileTime::from_secs(mtime);
            if let Err(e) = rootfs_fs::set_times(&path, time, time) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to set directory mtime");
            }
        }
        Ok(())
    }
}

/// Open a layer blob behind the decompressor its magic bytes call for.
pub fn open_layer(path: &Path, label: &str) -> Result<Box<dyn Read>> {
    let mut head = Vec::with_capacity(512);
    File::open(path)
        .and_then(|f| f.take(512).read_to_end(&mut head))
        .map_err(|e| BuildError::from_io(path, e))?;

    let compression = LayerCompression::detect(&head).ok_or_else(|| {
        BuildError::UnsupportedLayer(format!(
            "{}: not a tar archive or a gzip, bzip2 or xz stream",
            label
        ))
    })?;

    let file = File::open(path).map_err(|e| BuildError::from_io(path, e))?;
    Ok(match compression {
        LayerCompression::None => Box::new(file),
        LayerCompression::Gzip => Box::new(GzDecoder::new(file)),
        LayerCompression::Bzip2 => Box::new(BzDecoder::new(file)),
        LayerCompression::Xz => Box::new(XzDecoder::new(file)),
    })
}
