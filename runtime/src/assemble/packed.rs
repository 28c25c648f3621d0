//! Packed single-file image.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0    magic "STRATUM\0"
//! 8    version        u32
//! 12   section count  u32 (N)
//! 16   N descriptors of 32 bytes: type u32, flags u32, offset u64,
//!      length u64, reserved u64
//! 16+32N  section data, contiguous in table order
//! end-32  SHA-256 of bytes [0, 16+32N)
//! ```
//!
//! The header is written last, so a crash mid-write never leaves a file
//! with a valid checksum.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use stratum_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::sandbox::{check_destination, commit_staging, staging_path};
use crate::bundle::{Bundle, BundleMetadata};
use crate::fs as rootfs_fs;

/// File magic.
pub const MAGIC: &[u8; 8] = b"STRATUM\0";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const PREAMBLE_LEN: u64 = 16;
const DESCRIPTOR_LEN: u64 = 32;
const TRAILER_LEN: u64 = 32;

/// Upper bound on the section count accepted by the reader.
const MAX_SECTIONS: u32 = 64;

/// Section flag: payload is gzip compressed.
pub const FLAG_GZIP: u32 = 1;

/// Known section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionType {
    /// Root filesystem as a gzip tar
    Rootfs = 1,
    /// Bundle metadata as JSON
    Metadata = 2,
}

/// One entry of the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub section_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub length: u64,
}

impl SectionDescriptor {
    fn encode(&self) -> [u8; DESCRIPTOR_LEN as usize] {
        let mut buf = [0u8; DESCRIPTOR_LEN as usize];
        buf[0..4].copy_from_slice(&self.section_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        if u64_at(24) != 0 {
            return Err(BuildError::PackedFormat(
                "Reserved descriptor field is not zero".to_string(),
            ));
        }
        Ok(Self {
            section_type: u32_at(0),
            flags: u32_at(4),
            offset: u64_at(8),
            length: u64_at(16),
        })
    }

    /// Exclusive end offset.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn is_gzip(&self) -> bool {
        self.flags & FLAG_GZIP != 0
    }

    /// Known type of this section, `None` for types this reader skips.
    pub fn kind(&self) -> Option<SectionType> {
        match self.section_type {
            1 => Some(SectionType::Rootfs),
            2 => Some(SectionType::Metadata),
            _ => None,
        }
    }
}

fn data_start(count: u32) -> u64 {
    PREAMBLE_LEN + DESCRIPTOR_LEN * count as u64
}

fn encode_header(sections: &[SectionDescriptor]) -> Vec<u8> {
    let mut header = Vec::with_capacity(data_start(sections.len() as u32) as usize);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    header.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    for section in sections {
        header.extend_from_slice(&section.encode());
    }
    header
}

/// Writes bundles as packed images.
#[derive(Debug, Clone, Default)]
pub struct PackedAssembler {
    overwrite: bool,
}

impl PackedAssembler {
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
        let metadata = bundle.metadata().clone();
        let dest = dest.to_path_buf();
        let overwrite = self.overwrite;
        let cancel = cancel.clone();
        crate::run_blocking(move || {
            check_destination(&dest, overwrite)?;
            let staging = staging_path(&dest)?;
            if let Some(parent) = staging.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BuildError::from_io(parent, e))?;
            }

            let size = match write_packed(&rootfs, &metadata, &staging, &cancel) {
                Ok(size) => size,
                Err(e) => {
                    let _ = std::fs::remove_file(&staging);
                    return Err(e);
                }
            };
            commit_staging(&staging, &dest, overwrite)?;
            tracing::info!(dest = %dest.display(), size_bytes = size, "Packed image written");
            Ok(dest)
        })
        .await
    }
}

/// Counts bytes passing through to the inner writer.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write a packed image of `rootfs` and `metadata` to `path`.
pub fn write_packed(
    rootfs: &Path,
    metadata: &BundleMetadata,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let file = File::create(path).map_err(|e| BuildError::from_io(path, e))?;
    let mut out = BufWriter::new(file);
    let start = data_start(2);
    out.write_all(&vec![0u8; start as usize])?;

    let counting = CountingWriter {
        inner: &mut out,
        count: 0,
    };
    let mut builder = tar::Builder::new(GzEncoder::new(counting, Compression::default()));
    builder.follow_symlinks(false);
    append_tree(&mut builder, rootfs, Path::new(""), cancel)?;
    let rootfs_len = builder.into_inner()?.finish()?.count;

    let metadata_json = serde_json::to_vec_pretty(metadata)?;
    out.write_all(&metadata_json)?;

    let sections = [
        SectionDescriptor {
            section_type: SectionType::Rootfs as u32,
            flags: FLAG_GZIP,
            offset: start,
            length: rootfs_len,
        },
        SectionDescriptor {
            section_type: SectionType::Metadata as u32,
            flags: 0,
            offset: start + rootfs_len,
            length: metadata_json.len() as u64,
        },
    ];
    let header = encode_header(&sections);
    out.write_all(&Sha256::digest(&header))?;

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.write_all_at(&header, 0)?;
    file.sync_all()?;

    let size = start + rootfs_len + metadata_json.len() as u64 + TRAILER_LEN;
    tracing::debug!(
        path = %path.display(),
        rootfs_bytes = rootfs_len,
        metadata_bytes = metadata_json.len(),
        "Wrote packed image sections"
    );
    Ok(size)
}

/// Append the tree below `dir` in name order, checking for cancellation.
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    rel: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| BuildError::from_io(dir, e))?
        .collect::<io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let path = child.path();
        let name = rel.join(child.file_name());
        let meta = std::fs::symlink_metadata(&path).map_err(|e| BuildError::from_io(&path, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() || file_type.is_file() || file_type.is_symlink() {
            builder
                .append_path_with_name(&path, &name)
                .map_err(|e| BuildError::from_io(&path, e))?;
            if file_type.is_dir() {
                append_tree(builder, &path, &name, cancel)?;
            }
            continue;
        }

        let entry_type = if file_type.is_char_device() {
            tar::EntryType::Char
        } else if file_type.is_block_device() {
            tar::EntryType::Block
        } else if file_type.is_fifo() {
            tar::EntryType::Fifo
        } else {
            tracing::debug!(path = %path.display(), "Skipping socket");
            continue;
        };
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
        header.set_entry_type(entry_type);
        header.set_size(0);
        let rdev = meta.rdev();
        header.set_device_major((((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0x0fff)) as u32)?;
        header.set_device_minor((((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)) as u32)?;
        builder
            .append_data(&mut header, &name, io::empty())
            .map_err(|e| BuildError::from_io(&path, e))?;
    }
    Ok(())
}

/// Read side of a packed image. Every offset is validated on open.
#[derive(Debug)]
pub struct PackedImage {
    path: PathBuf,
    len: u64,
    sections: Vec<SectionDescriptor>,
}

impl PackedImage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BuildError::from_io(path, e))?;
        let len = file.metadata()?.len();
        if len < PREAMBLE_LEN + TRAILER_LEN {
            return Err(BuildError::PackedFormat(format!(
                "{} is too short ({} bytes)",
                path.display(),
                len
            )));
        }

        let mut preamble = [0u8; PREAMBLE_LEN as usize];
        file.read_exact_at(&mut preamble, 0)?;
        if &preamble[0..8] != MAGIC {
            return Err(BuildError::PackedFormat(format!(
                "{} is not a packed image (bad magic)",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([preamble[8], preamble[9], preamble[10], preamble[11]]);
        if version != FORMAT_VERSION {
            return Err(BuildError::PackedFormat(format!(
                "Unsupported format version {}",
                version
            )));
        }
        let count = u32::from_le_bytes([preamble[12], preamble[13], preamble[14], preamble[15]]);
        if count == 0 || count > MAX_SECTIONS {
            return Err(BuildError::PackedFormat(format!(
                "Invalid section count {}",
                count
            )));
        }

        let start = data_start(count);
        if start + TRAILER_LEN > len {
            return Err(BuildError::PackedFormat(format!(
                "Descriptor table exceeds file length {}",
                len
            )));
        }
        let mut header = vec![0u8; start as usize];
        file.read_exact_at(&mut header, 0)?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact_at(&mut trailer, len - TRAILER_LEN)?;
        if Sha256::digest(&header).as_slice() != &trailer[..] {
            return Err(BuildError::PackedFormat(
                "Header checksum mismatch".to_string(),
            ));
        }

        let sections = header[PREAMBLE_LEN as usize..]
            .chunks_exact(DESCRIPTOR_LEN as usize)
            .map(SectionDescriptor::decode)
            .collect::<Result<Vec<_>>>()?;
        validate_bounds(&sections, start, len - TRAILER_LEN)?;

        Ok(Self {
            path: path.to_path_buf(),
            len,
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The descriptor table in file order.
    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    /// First section of `kind`.
    pub fn section(&self, kind: SectionType) -> Option<&SectionDescriptor> {
        self.sections.iter().find(|s| s.section_type == kind as u32)
    }

    fn require(&self, kind: SectionType) -> Result<SectionDescriptor> {
        self.section(kind).copied().ok_or_else(|| {
            BuildError::PackedFormat(format!("Missing {:?} section", kind))
        })
    }

    /// Reader over one section's raw bytes.
    pub fn section_reader(&self, section: &SectionDescriptor) -> Result<impl Read> {
        let mut file = File::open(&self.path).map_err(|e| BuildError::from_io(&self.path, e))?;
        file.seek(SeekFrom::Start(section.offset))?;
        Ok(file.take(section.length))
    }

    /// Raw metadata JSON, read without touching the rootfs payload.
    pub fn metadata_bytes(&self) -> Result<Vec<u8>> {
        let section = self.require(SectionType::Metadata)?;
        let mut buf = Vec::with_capacity(section.length as usize);
        self.section_reader(&section)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn read_metadata(&self) -> Result<BundleMetadata> {
        Ok(serde_json::from_slice(&self.metadata_bytes()?)?)
    }

    /// Unpack the rootfs section into `dest`, which must not exist.
    pub fn extract_rootfs(&self, dest: &Path) -> Result<()> {
        check_destination(dest, false)?;
        let section = self.require(SectionType::Rootfs)?;
        let reader: Box<dyn Read> = if section.is_gzip() {
            Box::new(GzDecoder::new(self.section_reader(&section)?))
        } else {
            Box::new(self.section_reader(&section)?)
        };

        std::fs::create_dir_all(dest).map_err(|e| BuildError::from_io(dest, e))?;
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        if let Err(e) = archive.unpack(dest) {
            let _ = rootfs_fs::remove_node(dest);
            return Err(BuildError::Unpack(format!(
                "Failed to extract rootfs from {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }
}

fn validate_bounds(sections: &[SectionDescriptor], start: u64, end: u64) -> Result<()> {
    let mut ranges = Vec::with_capacity(sections.len());
    for (i, section) in sections.iter().enumerate() {
        let section_end = section.end().ok_or_else(|| {
            BuildError::PackedFormat(format!("Section {} length overflows", i))
        })?;
        if section.offset < start || section_end > end {
            return Err(BuildError::PackedFormat(format!(
                "Section {} [{}, {}) lies outside the data area [{}, {})",
                i, section.offset, section_end, start, end
            )));
        }
        ranges.push((section.offset, section_end));
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(BuildError::PackedFormat(format!(
                "Sections overlap at offset {}",
                pair[1].0
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(tmp: &TempDir) -> Bundle {
        let mut bundle = Bundle::create(tmp.path(), "docker://alpine:3.19").unwrap();
        let root = bundle.rootfs().to_path_buf();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/os-release"), "ID=alpine\n").unwrap();
        std::os::unix::fs::symlink("os-release", root.join("etc/release")).unwrap();
        bundle.metadata_mut().env = vec!["PATH=/bin".to_string()];
        bundle.metadata_mut().cmd = Some(vec!["/bin/sh".to_string()]);
        bundle
    }

    async fn packed(tmp: &TempDir) -> PathBuf {
        let bundle = bundle(tmp);
        let dest = tmp.path().join("image.stratum");
        PackedAssembler::new(false)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let original = bundle(&tmp).metadata().clone();
        let path = packed(&tmp).await;

        let image = PackedImage::open(&path).unwrap();
        assert_eq!(image.sections().len(), 2);

        let meta = image.read_metadata().unwrap();
        assert_eq!(meta.source, original.source);
        assert_eq!(meta.env, original.env);
        assert_eq!(meta.cmd, original.cmd);

        let out = tmp.path().join("extracted");
        image.extract_rootfs(&out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("etc/os-release")).unwrap(),
            "ID=alpine\n"
        );
        assert_eq!(
            std::fs::read_link(out.join("etc/release")).unwrap(),
            PathBuf::from("os-release")
        );
    }

    #[tokio::test]
    async fn test_sections_valid_and_disjoint() {
        let tmp = TempDir::new().unwrap();
        let path = packed(&tmp).await;
        let image = PackedImage::open(&path).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();

        let rootfs = *image.section(SectionType::Rootfs).unwrap();
        let meta = *image.section(SectionType::Metadata).unwrap();
        assert!(rootfs.is_gzip());
        assert!(!meta.is_gzip());
        assert_eq!(rootfs.kind(), Some(SectionType::Rootfs));
        assert_eq!(meta.kind(), Some(SectionType::Metadata));
        assert_eq!(rootfs.offset, data_start(2));
        assert_eq!(rootfs.end().unwrap(), meta.offset);
        assert_eq!(meta.end().unwrap(), len - TRAILER_LEN);
        assert_eq!(image.len(), len);

        // The metadata section holds exactly the JSON bytes.
        let bytes = image.metadata_bytes().unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(
            bytes,
            raw[meta.offset as usize..meta.end().unwrap() as usize].to_vec()
        );
        assert_eq!(&raw[0..8], MAGIC);
    }

    #[tokio::test]
    async fn test_corrupted_header_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = packed(&tmp).await;
        let mut raw = std::fs::read(&path).unwrap();
        raw[16 + 8] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = PackedImage::open(&path).unwrap_err();
        assert!(matches!(err, BuildError::PackedFormat(ref m) if m.contains("checksum")));
    }

    #[tokio::test]
    async fn test_bad_magic_and_version() {
        let tmp = TempDir::new().unwrap();
        let path = packed(&tmp).await;
        let raw = std::fs::read(&path).unwrap();

        let mut bad_magic = raw.clone();
        bad_magic[0] = b'X';
        std::fs::write(&path, &bad_magic).unwrap();
        assert!(matches!(
            PackedImage::open(&path).unwrap_err(),
            BuildError::PackedFormat(ref m) if m.contains("magic")
        ));

        let mut bad_version = raw.clone();
        bad_version[8] = 9;
        std::fs::write(&path, &bad_version).unwrap();
        assert!(matches!(
            PackedImage::open(&path).unwrap_err(),
            BuildError::PackedFormat(ref m) if m.contains("version")
        ));
    }

    #[tokio::test]
    async fn test_truncated_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = packed(&tmp).await;
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();
        assert!(PackedImage::open(&path).is_err());

        std::fs::write(&path, &raw[..20]).unwrap();
        assert!(matches!(
            PackedImage::open(&path).unwrap_err(),
            BuildError::PackedFormat(_)
        ));
    }

    #[test]
    fn test_overlapping_sections_rejected() {
        let a = SectionDescriptor {
            section_type: 1,
            flags: 0,
            offset: 80,
            length: 20,
        };
        let b = SectionDescriptor {
            section_type: 2,
            flags: 0,
            offset: 90,
            length: 5,
        };
        assert!(validate_bounds(&[a, b], 80, 200).is_err());
        assert!(validate_bounds(&[a], 81, 200).is_err());
        assert!(validate_bounds(&[a], 80, 99).is_err());
        assert!(validate_bounds(&[a], 80, 100).is_ok());
    }

    #[tokio::test]
    async fn test_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle(&tmp);
        let dest = tmp.path().join("image.stratum");
        std::fs::write(&dest, "previous").unwrap();

        let err = PackedAssembler::new(false)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Exists(_)));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "previous");

        PackedAssembler::new(true)
            .assemble(&bundle, &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(PackedImage::open(&dest).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let bundle = bundle(&tmp);
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = PackedAssembler::new(false)
            .assemble(&bundle, &out.join("image.stratum"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }
}
