//! Out-of-line blob storage.
//!
//! Each blob is one file under the owning buffer's blob directory,
//! sharded by column and then two fan-out levels:
//!
//! ```text
//! col_<column>/<hi:03>/<lo:03>/<index>.bin[.gz]
//!   hi = index / 1_000_000
//!   lo = (index % 1_000_000) / 1_000
//! ```
//!
//! Whether a blob kind is gzip-compressed is decided by its `BlobKind`
//! implementation, recorded once in a `CompressionPolicy`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::data::BlobAddress;
use crate::error::Result;

/// Entries per shard directory level.
pub const BLOB_ENTRIES_PER_DIRECTORY: u32 = 1000;

// ── Compression policy ──────────────────────────────────────────────

/// Capability every blob kind declares up front.
pub trait BlobKind {
    /// Kind name carried by `BlobValue::kind`.
    const NAME: &'static str;

    /// Whether payloads of this kind are stored gzip-compressed.
    fn compress() -> bool {
        true
    }
}

/// Registry of per-kind compression flags.
///
/// Kinds never registered are compressed.
#[derive(Debug, Default)]
pub struct CompressionPolicy {
    kinds: RwLock<HashMap<String, bool>>,
}

impl CompressionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: BlobKind>(&self) {
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert(K::NAME.to_string(), K::compress());
        }
    }

    pub fn should_compress(&self, kind: &str) -> bool {
        if let Ok(kinds) = self.kinds.read() {
            if let Some(&flag) = kinds.get(kind) {
                return flag;
            }
        }
        let mut kinds = match self.kinds.write() {
            Ok(k) => k,
            Err(_) => return true,
        };
        tracing::debug!("blob kind \"{}\" not registered, compressing", kind);
        *kinds.entry(kind.to_string()).or_insert(true)
    }
}

// ── Layout ──────────────────────────────────────────────────────────

/// Path of the blob `address` relative to a blob directory.
pub fn blob_relative_path(address: &BlobAddress) -> PathBuf {
    let per_dir = BLOB_ENTRIES_PER_DIRECTORY;
    let hi = address.index / (per_dir * per_dir);
    let lo = (address.index % (per_dir * per_dir)) / per_dir;
    let ext = if address.compressed { "bin.gz" } else { "bin" };
    PathBuf::from(format!("col_{}", address.column))
        .join(format!("{hi:03}"))
        .join(format!("{lo:03}"))
        .join(format!("{}.{}", address.index, ext))
}

pub fn blob_path(blob_dir: &Path, address: &BlobAddress) -> PathBuf {
    blob_dir.join(blob_relative_path(address))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ── I/O ─────────────────────────────────────────────────────────────

/// Write a blob payload, compressing if the address says so.
pub fn write_blob(blob_dir: &Path, address: &BlobAddress, bytes: &[u8]) -> Result<PathBuf> {
    let path = blob_path(blob_dir, address);
    create_parent(&path)?;
    let file = BufWriter::new(File::create(&path)?);
    if address.compressed {
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(bytes)?;
        enc.finish()?.flush()?;
    } else {
        let mut file = file;
        file.write_all(bytes)?;
        file.flush()?;
    }
    Ok(path)
}

pub fn read_blob_file(path: &Path, compressed: bool) -> Result<Vec<u8>> {
    let file = BufReader::new(File::open(path)?);
    let mut bytes = Vec::new();
    if compressed {
        GzDecoder::new(file).read_to_end(&mut bytes)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

/// Copy a stored blob byte for byte into `dest_dir` under `dest`.
///
/// Both addresses must agree on compression; the bytes are not re-encoded.
pub fn copy_blob_file(source: &Path, dest_dir: &Path, dest: &BlobAddress) -> Result<PathBuf> {
    let path = blob_path(dest_dir, dest);
    create_parent(&path)?;
    fs::copy(source, &path)?;
    Ok(path)
}

/// Recursively copy a directory tree.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Thumbnail;
    impl BlobKind for Thumbnail {
        const NAME: &'static str = "thumbnail";
        fn compress() -> bool {
            false
        }
    }

    struct Document;
    impl BlobKind for Document {
        const NAME: &'static str = "document";
    }

    fn addr(column: u32, index: u32, compressed: bool) -> BlobAddress {
        BlobAddress {
            buffer_id: 1,
            column,
            index,
            compressed,
            identity: None,
        }
    }

    #[test]
    fn test_layout_shards_by_thousands() {
        assert_eq!(
            blob_relative_path(&addr(0, 7, false)),
            PathBuf::from("col_0/000/000/7.bin")
        );
        assert_eq!(
            blob_relative_path(&addr(2, 1_234_567, true)),
            PathBuf::from("col_2/001/234/1234567.bin.gz")
        );
        assert_eq!(
            blob_relative_path(&addr(1, 999_999, false)),
            PathBuf::from("col_1/000/999/999999.bin")
        );
    }

    #[test]
    fn test_policy_registration() {
        let policy = CompressionPolicy::new();
        policy.register::<Thumbnail>();
        policy.register::<Document>();
        assert!(!policy.should_compress("thumbnail"));
        assert!(policy.should_compress("document"));
        assert!(policy.should_compress("unknown"));
    }

    #[test]
    fn test_write_read_copy() {
        let dir = TempDir::new().unwrap();
        let src_dir = dir.path().join("a");
        let dst_dir = dir.path().join("b");
        let payload = vec![42u8; 4096];

        for compressed in [false, true] {
            let src = addr(0, 3, compressed);
            let path = write_blob(&src_dir, &src, &payload).unwrap();
            assert_eq!(read_blob_file(&path, compressed).unwrap(), payload);

            let dst = addr(1, 0, compressed);
            let copied = copy_blob_file(&path, &dst_dir, &dst).unwrap();
            assert_eq!(fs::read(&copied).unwrap(), fs::read(&path).unwrap());
            assert_eq!(read_blob_file(&copied, compressed).unwrap(), payload);
        }
    }
}
