//! Low-level filesystem helpers for working inside a root filesystem tree.
//!
//! Everything here operates on the node itself and never follows a final
//! symlink. Paths handed to [`resolve_in_root`] are interpreted as if the
//! root were `/`, so symlinks inside an image can never lead outside it.

use std::collections::VecDeque;
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Maximum symlink hops followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Change ownership of `path` without following a final symlink.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cstring(path)?;
    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call.
    check(unsafe { libc::lchown(c.as_ptr(), uid, gid) })
}

/// A second/nanosecond timestamp pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTime {
    pub secs: i64,
    pub nanos: i64,
}

impl FileTime {
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs as libc::time_t,
            tv_nsec: self.nanos as _,
        }
    }
}

/// Set access and modification times of `path` itself (symlinks included).
pub fn set_times(path: &Path, atime: FileTime, mtime: FileTime) -> io::Result<()> {
    let c = cstring(path)?;
    let times = [atime.to_timespec(), mtime.to_timespec()];
    // SAFETY: `times` holds exactly two timespecs as utimensat requires.
    check(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

/// Kind of device node to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

/// Create a device node.
pub fn mknod(path: &Path, kind: DeviceKind, mode: u32, major: u32, minor: u32) -> io::Result<()> {
    let c = cstring(path)?;
    let file_type = match kind {
        DeviceKind::Char => libc::S_IFCHR,
        DeviceKind::Block => libc::S_IFBLK,
    };
    let dev = libc::makedev(major, minor);
    // SAFETY: plain syscall on a valid path.
    check(unsafe { libc::mknod(c.as_ptr(), file_type | (mode & 0o7777), dev) })
}

/// Create a device node from a raw `st_rdev` value.
pub fn mknod_raw(path: &Path, file_type: libc::mode_t, mode: u32, rdev: u64) -> io::Result<()> {
    let c = cstring(path)?;
    // SAFETY: plain syscall on a valid path.
    check(unsafe { libc::mknod(c.as_ptr(), file_type | (mode & 0o7777), rdev as libc::dev_t) })
}

/// Create a FIFO.
pub fn mkfifo(path: &Path, mode: u32) -> io::Result<()> {
    let c = cstring(path)?;
    // SAFETY: plain syscall on a valid path.
    check(unsafe { libc::mkfifo(c.as_ptr(), (mode & 0o7777) as libc::mode_t) })
}

/// List extended attribute names of `path` (not following symlinks).
pub fn list_xattrs(path: &Path) -> io::Result<Vec<OsString>> {
    let c = cstring(path)?;
    // SAFETY: a null buffer with size 0 queries the required length.
    let size = unsafe { libc::llistxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    if size == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; size as usize];
    // SAFETY: `buf` is writable for `buf.len()` bytes.
    let size = unsafe { libc::llistxattr(c.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(size as usize);

    Ok(buf
        .split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| std::ffi::OsStr::from_bytes(name).to_os_string())
        .collect())
}

/// Read one extended attribute of `path`.
pub fn get_xattr(path: &Path, name: &std::ffi::OsStr) -> io::Result<Vec<u8>> {
    let c = cstring(path)?;
    let n = CString::new(name.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))?;
    // SAFETY: size query with a null buffer.
    let size = unsafe { libc::lgetxattr(c.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut buf = vec![0u8; size as usize];
    // SAFETY: `buf` is writable for `buf.len()` bytes.
    let size = unsafe {
        libc::lgetxattr(c.as_ptr(), n.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if size < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(size as usize);
    Ok(buf)
}

/// Set one extended attribute on `path`.
pub fn set_xattr(path: &Path, name: &std::ffi::OsStr, value: &[u8]) -> io::Result<()> {
    let c = cstring(path)?;
    let n = CString::new(name.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))?;
    // SAFETY: `value` is readable for `value.len()` bytes.
    check(unsafe {
        libc::lsetxattr(c.as_ptr(), n.as_ptr(), value.as_ptr().cast(), value.len(), 0)
    })
}

/// Copy every extended attribute from `src` to `dst`.
///
/// Attributes the destination filesystem or the caller cannot set are
/// skipped; the number of skipped attributes is returned.
pub fn copy_xattrs(src: &Path, dst: &Path) -> io::Result<usize> {
    let names = match list_xattrs(src) {
        Ok(names) => names,
        Err(e) if is_unsupported(&e) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut skipped = 0;
    for name in names {
        let value = get_xattr(src, &name)?;
        match set_xattr(dst, &name, &value) {
            Ok(()) => {}
            Err(e) if is_unsupported(&e) || e.kind() == io::ErrorKind::PermissionDenied => {
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(skipped)
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP) | Some(libc::ENODATA)
    ) || err.kind() == io::ErrorKind::Unsupported
}

/// Whether an error means the host refused a privileged operation.
pub fn is_permission_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(libc::EPERM)
}

/// Normalize an archive member path to a path relative to the root.
///
/// Leading `/` and `.` components are dropped. Returns `None` when the path
/// contains `..` or a platform prefix.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Resolve `rel` under `root`, following symlinks in every component except
/// the last one as if `root` were the filesystem root.
///
/// The result always lies inside `root`.
pub fn resolve_in_root(root: &Path, rel: &Path) -> io::Result<PathBuf> {
    let mut parts: Vec<OsString> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_os_string()),
            _ => None,
        })
        .collect();
    let Some(last) = parts.pop() else {
        return Ok(root.to_path_buf());
    };

    let mut current = PathBuf::new();
    let mut pending: VecDeque<OsString> = parts.into();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            current.pop();
            continue;
        }
        let candidate = current.join(&part);
        let host_path = root.join(&candidate);
        match std::fs::symlink_metadata(&host_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("too many levels of symlinks in {}", rel.display()),
                    ));
                }
                let target = std::fs::read_link(&host_path)?;
                if target.is_absolute() {
                    current = PathBuf::new();
                }
                let mut expanded: VecDeque<OsString> = target
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(p) => Some(p.to_os_string()),
                        Component::ParentDir => Some(OsString::from("..")),
                        _ => None,
                    })
                    .collect();
                expanded.extend(pending);
                pending = expanded;
            }
            _ => current = candidate,
        }
    }

    Ok(root.join(current).join(last))
}

/// Remove whatever node is at `path` (file, symlink or directory tree).
pub fn remove_node(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_tree_writable(path)?;
            std::fs::remove_dir_all(path)
        }
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Grant the owner `rwx` on every directory below (and including) `path`
/// so the tree can be removed.
pub fn make_tree_writable(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o700))?;
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_tree_writable(&entry.path())?;
        }
    }
    Ok(())
}

/// Total size of regular files below `path`, not following symlinks.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}

/// Current effective uid/gid.
pub fn effective_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid cannot fail.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

/// Owner of `path` itself.
pub fn owner(path: &Path) -> io::Result<(u32, u32)> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok((meta.uid(), meta.gid()))
}
