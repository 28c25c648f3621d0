//! Sandbox assembler: a writable directory tree.
//!
//! The rootfs is copied into a hidden staging directory next to the
//! destination and renamed into place, so the destination is either absent,
//! untouched, or complete.

use std::collections::HashMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::bundle::Bundle;
use crate::fs::{self as rootfs_fs, FileTime};

/// Copies a bundle rootfs to a directory.
#[derive(Debug, Clone, Default)]
pub struct SandboxAssembler {
    overwrite: bool,
}

impl SandboxAssembler {
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }

    pub async fn assemble(
        &self,
        bundle: &Bundle,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let rootfs = bundle.rootfs().to_path_buf();
        let dest = dest.to_path_buf();
        let overwrite = self.overwrite;
        let cancel = cancel.clone();
        crate::run_blocking(move || assemble_tree(&rootfs, &dest, overwrite, &cancel)).await
    }
}

/// Hidden sibling of `dest` used while writing.
pub(crate) fn staging_path(dest: &Path) -> Result<PathBuf> {
    let name = dest.file_name().ok_or_else(|| {
        BuildError::Config(format!("Invalid destination {}", dest.display()))
    })?;
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!(
        ".{}.stratum-{}",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    )))
}

/// Fail with `Exists` unless `dest` is free or may be replaced.
pub(crate) fn check_destination(dest: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && std::fs::symlink_metadata(dest).is_ok() {
        return Err(BuildError::Exists(dest.to_path_buf()));
    }
    Ok(())
}

/// Move a finished staging node onto `dest`.
pub(crate) fn commit_staging(staging: &Path, dest: &Path, overwrite: bool) -> Result<()> {
    if let Err(e) = check_destination(dest, overwrite) {
        let _ = rootfs_fs::remove_node(staging);
        return Err(e);
    }
    if overwrite {
        if let Err(e) = rootfs_fs::remove_node(dest) {
            let _ = rootfs_fs::remove_node(staging);
            return Err(BuildError::from_io(dest, e));
        }
    }
    std::fs::rename(staging, dest).map_err(|e| {
        let _ = rootfs_fs::remove_node(staging);
        BuildError::from_io(dest, e)
    })
}

fn assemble_tree(
    rootfs: &Path,
    dest: &Path,
    overwrite: bool,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    check_destination(dest, overwrite)?;
    let staging = staging_path(dest)?;
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::from_io(parent, e))?;
    }

    tracing::info!(
        rootfs = %rootfs.display(),
        dest = %dest.display(),
        staging = %staging.display(),
        "Assembling sandbox"
    );

    let mut copier = TreeCopier::new(cancel);
    if let Err(e) = copier.copy_node(rootfs, &staging) {
        if let Err(cleanup) = rootfs_fs::remove_node(&staging) {
            tracing::warn!(
                staging = %staging.display(),
                error = %cleanup,
                "Failed to remove sandbox staging directory"
            );
        }
        return Err(e);
    }
    if copier.chown_refused {
        tracing::warn!(dest = %dest.display(), "Ownership not preserved in sandbox: host refused lchown");
    }
    if copier.skipped > 0 {
        tracing::warn!(
            dest = %dest.display(),
            skipped = copier.skipped,
            "Some special files or extended attributes were not copied"
        );
    }

    commit_staging(&staging, dest, overwrite)?;
    tracing::info!(dest = %dest.display(), nodes = copier.nodes, "Sandbox assembled");
    Ok(dest.to_path_buf())
}

/// Fidelity-preserving recursive copy.
struct TreeCopier<'a> {
    cancel: &'a CancellationToken,
    ids: (u32, u32),
    /// Source (dev, ino) of multiply-linked files already copied
    links: HashMap<(u64, u64), PathBuf>,
    chown_refused: bool,
    skipped: usize,
    nodes: usize,
}

impl<'a> TreeCopier<'a> {
    fn new(cancel: &'a CancellationToken) -> Self {
        Self {
            cancel,
            ids: rootfs_fs::effective_ids(),
            links: HashMap::new(),
            chown_refused: false,
            skipped: 0,
            nodes: 0,
        }
    }

    fn copy_node(&mut self, src: &Path, dst: &Path) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let meta = std::fs::symlink_metadata(src).map_err(|e| BuildError::from_io(src, e))?;
        let file_type = meta.file_type();
        let mode = meta.mode() & 0o7777;
        self.nodes += 1;

        if file_type.is_dir() {
            std::fs::create_dir(dst).map_err(|e| BuildError::from_io(dst, e))?;
            // The owner must always be able to traverse and remove the tree.
            let dir_mode = mode | 0o700;
            std::fs::set_permissions(dst, std::fs::Permissions::from_mode(dir_mode))
                .map_err(|e| BuildError::from_io(dst, e))?;

            let mut children: Vec<_> = std::fs::read_dir(src)
                .map_err(|e| BuildError::from_io(src, e))?
                .collect::<std::io::Result<_>>()?;
            children.sort_by_key(|c| c.file_name());
            for child in children {
                self.copy_node(&child.path(), &dst.join(child.file_name()))?;
            }
            self.finish_node(src, dst, &meta, Some(dir_mode))?;
            return Ok(());
        }

        if file_type.is_symlink() {
            let target = std::fs::read_link(src).map_err(|e| BuildError::from_io(src, e))?;
            std::os::unix::fs::symlink(&target, dst).map_err(|e| BuildError::from_io(dst, e))?;
            return self.finish_node(src, dst, &meta, None);
        }

        if file_type.is_file() {
            if meta.nlink() > 1 {
                if let Some(first) = self.links.get(&(meta.dev(), meta.ino())) {
                    std::fs::hard_link(first, dst).map_err(|e| BuildError::from_io(dst, e))?;
                    return Ok(());
                }
                self.links.insert((meta.dev(), meta.ino()), dst.to_path_buf());
            }
            std::fs::copy(src, dst).map_err(|e| BuildError::from_io(dst, e))?;
            return self.finish_node(src, dst, &meta, Some(mode));
        }

        let special = if file_type.is_char_device() {
            Some(libc::S_IFCHR)
        } else if file_type.is_block_device() {
            Some(libc::S_IFBLK)
        } else if file_type.is_fifo() {
            Some(libc::S_IFIFO)
        } else {
            None
        };
        let Some(kind) = special else {
            tracing::debug!(path = %src.display(), "Skipping socket");
            self.skipped += 1;
            return Ok(());
        };
        match rootfs_fs::mknod_raw(dst, kind, mode, meta.rdev()) {
            Ok(()) => self.finish_node(src, dst, &meta, Some(mode)),
            Err(e) if rootfs_fs::is_permission_error(&e) => {
                tracing::debug!(path = %src.display(), error = %e, "Skipping special file");
                self.skipped += 1;
                Ok(())
            }
            Err(e) => Err(BuildError::from_io(dst, e)),
        }
    }

    /// Ownership, xattrs and timestamps; `mode` is re-applied after chown.
    fn finish_node(
        &mut self,
        src: &Path,
        dst: &Path,
        meta: &std::fs::Metadata,
        mode: Option<u32>,
    ) -> Result<()> {
        let owner = (meta.uid(), meta.gid());
        if owner != self.ids && !self.chown_refused {
            match rootfs_fs::lchown(dst, owner.0, owner.1) {
                Ok(()) => {
                    if let Some(mode) = mode.filter(|m| m & 0o6000 != 0) {
                        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))
                            .map_err(|e| BuildError::from_io(dst, e))?;
                    }
                }
                Err(e) if rootfs_fs::is_permission_error(&e) => self.chown_refused = true,
                Err(e) => return Err(BuildError::from_io(dst, e)),
            }
        }

        match rootfs_fs::copy_xattrs(src, dst) {
            Ok(skipped) => self.skipped += skipped,
            Err(e) => tracing::debug!(path = %dst.display(), error = %e, "Failed to copy xattrs"),
        }

        let atime = FileTime {
            secs: meta.atime(),
            nanos: meta.atime_nsec(),
        };
        let mtime = FileTime {
            secs: meta.mtime(),
            nanos: meta.mtime_nsec(),
        };
        rootfs_fs::set_times(dst, atime, mtime).map_err(|e| BuildError::from_io(dst, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle_with_tree(tmp: &TempDir) -> Bundle {
        let bundle = Bundle::create(tmp.path(), "scratch://").unwrap();
        let root = bundle.rootfs();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/hostname"), "box\n").unwrap();
        std::fs::set_permissions(
            root.join("etc/hostname"),
            std::fs::Permissions::from_mode(0o640),
        )
        .unwrap();
        std::os::unix::fs::symlink("hostname", root.join("etc/alias")).unwrap();
        std::fs::write(root.join("bin"), "elf").unwrap();
        std::fs::hard_link(root.join("bin"), root.join("bin2")).unwrap();
        std::fs::create_dir(root.join("locked")).unwrap();
        std::fs::set_permissions(root.join("locked"), std::fs::Permissions::from_mode(0o500))
            .unwrap();
        rootfs_fs::set_times(
            &root.join("etc/hostname"),
            FileTime::from_secs(1_600_000_000),
            FileTime::from_secs(1_600_000_000),
        )
        .unwrap();
        bundle
    }

    #[tokio::test]
    async fn test_assemble_sandbox() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle_with_tree(&tmp);
        let dest = tmp.path().join("out/sandbox");

        let path = SandboxAssembler::new(false)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(dest.join("etc/hostname")).unwrap(), b"box\n");
        let meta = std::fs::metadata(dest.join("etc/hostname")).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o640);
        assert_eq!(meta.mtime(), 1_600_000_000);
        assert_eq!(
            std::fs::read_link(dest.join("etc/alias")).unwrap(),
            PathBuf::from("hostname")
        );
        assert_eq!(
            std::fs::metadata(dest.join("bin")).unwrap().ino(),
            std::fs::metadata(dest.join("bin2")).unwrap().ino()
        );
        let locked = std::fs::metadata(dest.join("locked")).unwrap().mode();
        assert_eq!(locked & 0o700, 0o700);

        // No staging leftovers next to the destination.
        let siblings: Vec<_> = std::fs::read_dir(tmp.path().join("out")).unwrap().collect();
        assert_eq!(siblings.len(), 1);
        // The bundle is untouched.
        assert!(bundle.rootfs().join("etc/hostname").exists());
    }

    #[tokio::test]
    async fn test_existing_destination_without_overwrite() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle_with_tree(&tmp);
        let dest = tmp.path().join("existing");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("keep.txt"), "mine").unwrap();

        let err = SandboxAssembler::new(false)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Exists(ref p) if p == &dest));
        assert_eq!(std::fs::read_to_string(dest.join("keep.txt")).unwrap(), "mine");
        assert!(!dest.join("etc").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_destination() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle_with_tree(&tmp);
        let dest = tmp.path().join("existing");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        SandboxAssembler::new(true)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!dest.join("stale.txt").exists());
        assert!(dest.join("etc/hostname").exists());
    }

    #[tokio::test]
    async fn test_failed_assemble_leaves_no_destination() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle_with_tree(&tmp);
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let dest = out.join("sandbox");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = SandboxAssembler::new(false)
            .assemble(&bundle, &dest, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Cancelled));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        // Re-invoking after the failure succeeds.
        SandboxAssembler::new(false)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(dest.join("etc/hostname").exists());
    }

    #[test]
    fn test_staging_path_is_hidden_sibling() {
        let staging = staging_path(Path::new("/srv/images/app")).unwrap();
        assert_eq!(staging.parent(), Some(Path::new("/srv/images")));
        let name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".app.stratum-"));

        let relative = staging_path(Path::new("app")).unwrap();
        assert_eq!(relative.parent(), Some(Path::new(".")));
    }
}
