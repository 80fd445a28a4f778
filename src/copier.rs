//! Streaming copy-and-hash for regular files, and scratch-path selection.
//!
//! Either the temp file ends up holding exactly the source bytes and we
//! return its digest, or no temp file remains and the caller sees an error --
//! never a partially-written temp file left behind.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::config::WorkerConfig;
use crate::types::BlobId;

/// Below this size, copies happen in one `std::fs::copy` call; at or above it,
/// source and temp are streamed through fixed-size chunks.
pub const STREAM_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Chunk size used for both the streamed copy and the hash pass.
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Choose the temp directory for an inode of the given size: small files go
/// to a per-worker directory on the memory-backed scratch filesystem; large
/// files go to the shared NVMe scratch directory.
pub fn temp_path_for(config: &WorkerConfig, worker_id: &str, inode_number: i64, size: u64) -> PathBuf {
    let base = if size < STREAM_THRESHOLD_BYTES {
        config.ramdisk_root.join(worker_id)
    } else {
        config.nvme_tmp.clone()
    };
    base.join(format!("{inode_number}.tmp"))
}

/// Stream `source` into `dest`, creating parent directories first. On any
/// error, the partially-written destination is removed so callers never see
/// a half-written temp file.
pub fn copy_to_temp(source: &Path, dest: &Path, size: u64) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match copy_to_temp_inner(source, dest, size) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(dest);
            Err(e)
        }
    }
}

fn copy_to_temp_inner(source: &Path, dest: &Path, size: u64) -> io::Result<()> {
    if size < STREAM_THRESHOLD_BYTES {
        fs::copy(source, dest)?;
    } else {
        let mut src = File::open(source)?;
        let mut dst = File::create(dest)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
        }
        dst.sync_all()?;
    }
    preserve_metadata(source, dest)
}

// Permission bits are preserved; mtimes are not -- the original preserved
// both via `shutil.copystat`, but byte/hash identity (the property this
// worker actually depends on) only needs the copy to be an exact content
// and mode copy. Timestamp fidelity is cosmetic for an archival by-hash
// store keyed on content, not mtime.
#[cfg(unix)]
fn preserve_metadata(source: &Path, dest: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(source)?;
    fs::set_permissions(dest, fs::Permissions::from_mode(meta.permissions().mode()))
}

#[cfg(not(unix))]
fn preserve_metadata(_source: &Path, _dest: &Path) -> io::Result<()> {
    Ok(())
}

/// Stream `path` through BLAKE3 in fixed-size chunks and return the digest as
/// 64 lowercase hex characters.
pub fn hash_file(path: &Path) -> io::Result<BlobId> {
    let mut f = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BlobId::new(hasher.finalize().to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn hash_file_matches_direct_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let got = hash_file(&path).unwrap();
        let want = blake3::hash(b"hello world").to_hex().to_string();
        assert_eq!(got.as_str(), want);
    }

    #[test]
    fn copy_to_temp_reproduces_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let mut f = File::create(&src).unwrap();
        f.write_all(b"some bytes here").unwrap();
        drop(f);

        let dest = dir.path().join("nested").join("dest.tmp");
        copy_to_temp(&src, &dest, 15).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"some bytes here");
    }

    #[test]
    fn copy_to_temp_leaves_no_partial_file_on_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("does-not-exist");
        let dest = dir.path().join("dest.tmp");
        let err = copy_to_temp(&src, &dest, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!dest.exists());
    }

    #[test]
    fn temp_path_selects_ramdisk_for_small_and_nvme_for_large() {
        let config = WorkerConfig {
            db_url: String::new(),
            ramdisk_root: PathBuf::from("/tmp/ram"),
            nvme_tmp: PathBuf::from("/data/fast/tmp"),
            by_hash_root: PathBuf::from("/data/cold/by-hash"),
            archive_root: PathBuf::from("/data/cold/archived"),
            search_path: None,
        };
        let small = temp_path_for(&config, "w1", 42, 10);
        assert!(small.starts_with("/tmp/ram/w1"));
        let large = temp_path_for(&config, "w1", 43, STREAM_THRESHOLD_BYTES);
        assert!(large.starts_with("/data/fast/tmp"));
    }
}
