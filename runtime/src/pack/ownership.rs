//! Uniform ownership normalization across an unpacked tree.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use stratum_core::error::{BuildError, Result};
use stratum_core::IdMapping;

use crate::fs as rootfs_fs;

/// Outcome of one normalization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnershipReport {
    /// Nodes whose owner was changed
    pub changed: usize,
    /// Set when the host refused `lchown`; the pass stops at that point
    pub refused: Option<String>,
}

/// Apply `mapping` to every node below (and including) `root`.
///
/// Symlinks are re-owned themselves, never their targets. A refused
/// `lchown` ends the pass and is reported once instead of failing.
pub fn apply_id_mapping(root: &Path, mapping: &IdMapping) -> Result<OwnershipReport> {
    let mut report = OwnershipReport::default();
    if *mapping == IdMapping::Preserve {
        return Ok(report);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let meta = std::fs::symlink_metadata(&path).map_err(|e| BuildError::from_io(&path, e))?;
        if meta.is_dir() {
            for entry in std::fs::read_dir(&path).map_err(|e| BuildError::from_io(&path, e))? {
                stack.push(entry?.path());
            }
        }

        let (uid, gid) = owner_of(&meta);
        let target = (mapping.map_uid(uid), mapping.map_gid(gid));
        if target == (uid, gid) {
            continue;
        }
        match rootfs_fs::lchown(&path, target.0, target.1) {
            Ok(()) => {
                report.changed += 1;
                // chown clears setuid/setgid on regular files.
                let mode = meta.permissions().mode();
                if meta.is_file() && mode & 0o6000 != 0 {
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(|e| BuildError::from_io(&path, e))?;
                }
            }
            Err(e) if rootfs_fs::is_permission_error(&e) => {
                report.refused = Some(format!(
                    "Ownership mapping not applied: host refused lchown on {} ({})",
                    path.display(),
                    e
                ));
                break;
            }
            Err(e) => return Err(BuildError::from_io(&path, e)),
        }
    }

    tracing::debug!(
        root = %root.display(),
        mapping = ?mapping,
        changed = report.changed,
        "Applied ownership mapping"
    );
    Ok(report)
}

fn owner_of(meta: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

/// Whether the caller could chown arbitrary files.
pub fn can_chown() -> bool {
    rootfs_fs::effective_ids().0 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_preserve_is_noop() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        let report = apply_id_mapping(tmp.path(), &IdMapping::Preserve).unwrap();
        assert_eq!(report, OwnershipReport::default());
    }

    #[test]
    fn test_squash_to_current_ids_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/f"), "x").unwrap();
        let (uid, gid) = rootfs_fs::effective_ids();

        let report = apply_id_mapping(tmp.path(), &IdMapping::Squash { uid, gid }).unwrap();
        assert_eq!(report.changed, 0);
        assert!(report.refused.is_none());
    }

    #[test]
    fn test_squash_to_other_ids() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        std::os::unix::fs::symlink("f", tmp.path().join("link")).unwrap();
        let mapping = IdMapping::Squash { uid: 4242, gid: 4242 };

        let report = apply_id_mapping(tmp.path(), &mapping).unwrap();
        if can_chown() {
            assert!(report.refused.is_none());
            assert_eq!(rootfs_fs::owner(&tmp.path().join("link")).unwrap(), (4242, 4242));
            assert_eq!(rootfs_fs::owner(&tmp.path().join("f")).unwrap(), (4242, 4242));
        } else {
            assert!(report.refused.is_some());
        }
    }

    #[test]
    fn test_mapping_keeps_setuid_bits() {
        let tmp = TempDir::new().unwrap();
        let bin = tmp.path().join("passwd");
        std::fs::write(&bin, "elf").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o4755)).unwrap();
        let sgid = tmp.path().join("wall");
        std::fs::write(&sgid, "elf").unwrap();
        std::fs::set_permissions(&sgid, std::fs::Permissions::from_mode(0o2755)).unwrap();

        let report =
            apply_id_mapping(tmp.path(), &IdMapping::Squash { uid: 4242, gid: 4242 }).unwrap();

        if report.refused.is_none() {
            assert_eq!(rootfs_fs::owner(&bin).unwrap(), (4242, 4242));
        }
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&bin), 0o4755);
        assert_eq!(mode(&sgid), 0o2755);
    }
}
