//! Executor: performs the filesystem effects for a plan. All filesystem work
//! happens before any database effect, and every step here is idempotent --
//! safe to re-run if the worker crashes between the filesystem phase and the
//! DB commit.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::error::ExecutionError;
use crate::types::BlobId;

/// Result of executing a file-bearing plan: whether *this* call created the
/// by-hash file, and how many new hardlinks it created.
#[derive(Debug, Clone, Copy)]
pub struct FileExecResult {
    pub by_hash_created: bool,
    pub links_created: usize,
}

/// Compute the by-hash path for a blob: `<by_hash_root>/XX/YY/<blob_id>`.
pub fn by_hash_path(config: &WorkerConfig, blob_id: &BlobId) -> PathBuf {
    let (x, y) = blob_id.shard();
    config.by_hash_root.join(x).join(y).join(blob_id.as_str())
}

/// Move `temp_path` into the by-hash store for `blob_id`, then fan out
/// hardlinks to every archive path. Returns whether this call won the race to
/// create the by-hash file.
pub fn execute_copy_new_file(
    config: &WorkerConfig,
    blob_id: &BlobId,
    temp_path: &Path,
    archive_paths: &[PathBuf],
) -> Result<FileExecResult, ExecutionError> {
    let hash_path = by_hash_path(config, blob_id);
    if let Some(parent) = hash_path.parent() {
        fs::create_dir_all(parent)?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
    }

    let by_hash_created = match fs::rename(temp_path, &hash_path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists || hash_path.exists() => {
            // Another worker won the race between our analysis and this
            // rename; discard our temp copy and treat the blob as pre-existing.
            let _ = fs::remove_file(temp_path);
            debug!(blob_id = %blob_id, "by-hash file already exists, discarding temp copy");
            false
        }
        Err(e) => return Err(e.into()),
    };

    let links_created = create_hardlinks_idempotent(&hash_path, archive_paths)?;

    Ok(FileExecResult {
        by_hash_created,
        links_created,
    })
}

/// Fan out hardlinks for a blob that is already known to exist in the by-hash
/// store (deduplicated file).
pub fn execute_link_existing_file(
    config: &WorkerConfig,
    blob_id: &BlobId,
    archive_paths: &[PathBuf],
) -> Result<usize, ExecutionError> {
    let hash_path = by_hash_path(config, blob_id);
    Ok(create_hardlinks_idempotent(&hash_path, archive_paths)?)
}

/// Ensure a zero-length by-hash file exists for the empty-file digest, then
/// fan out hardlinks the same way as any other file.
pub fn execute_empty_file(
    config: &WorkerConfig,
    blob_id: &BlobId,
    archive_paths: &[PathBuf],
) -> Result<usize, ExecutionError> {
    let hash_path = by_hash_path(config, blob_id);
    if let Some(parent) = hash_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !hash_path.exists() {
        fs::File::create(&hash_path)?;
    }
    Ok(create_hardlinks_idempotent(&hash_path, archive_paths)?)
}

/// Create each archive path as a directory. Pre-existing directories are
/// left alone.
pub fn execute_directory(archive_paths: &[PathBuf]) -> Result<(), ExecutionError> {
    for path in archive_paths {
        if !path.exists() {
            fs::create_dir_all(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

/// Create a symlink at each archive path pointing at `target`. A pre-existing
/// symlink (or any other pre-existing entry) is left alone.
pub fn execute_symlink(target: &Path, archive_paths: &[PathBuf]) -> Result<(), ExecutionError> {
    for path in archive_paths {
        if path.exists() || path.symlink_metadata().is_ok() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match std::os::unix::fs::symlink(target, path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Idempotently create hardlinks for every archive path, pointing at
/// `hash_path`. Reduces directory-creation syscalls by creating only the leaf
/// parent directories (`mkdir -p` on a leaf implicitly creates its ancestors).
///
/// A pre-existing archive entry is left in place iff it already points at
/// `hash_path`'s inode; otherwise it is replaced. Concurrent-create races
/// (another worker links the same path first) are swallowed.
pub fn create_hardlinks_idempotent(
    hash_path: &Path,
    archive_paths: &[PathBuf],
) -> Result<usize, std::io::Error> {
    if archive_paths.is_empty() {
        return Ok(0);
    }

    let hash_ino = fs::metadata(hash_path)?.ino();

    let parent_dirs: Vec<&Path> = archive_paths
        .iter()
        .filter_map(|p| p.parent())
        .collect();
    for leaf in leaf_dirs(&parent_dirs) {
        fs::create_dir_all(leaf)?;
        fs::set_permissions(leaf, fs::Permissions::from_mode(0o755))?;
    }

    let mut created = 0;
    for archive_path in archive_paths {
        if let Ok(meta) = fs::symlink_metadata(archive_path) {
            if meta.ino() == hash_ino {
                continue;
            }
            fs::remove_file(archive_path)?;
        }

        match fs::hard_link(hash_path, archive_path) {
            Ok(()) => created += 1,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    info!(count = created, "hardlinks created");
    Ok(created)
}

/// Filter a set of directory paths down to the leaves: those that are not a
/// strict prefix of any other path in the set. `mkdir(parents=true)` on a
/// leaf creates every ancestor, so only leaves need an explicit call.
fn leaf_dirs<'a>(dirs: &[&'a Path]) -> Vec<&'a Path> {
    let unique: HashSet<&Path> = dirs.iter().copied().collect();
    unique
        .iter()
        .copied()
        .filter(|&candidate| !unique.iter().any(|&other| other != candidate && other.starts_with(candidate)))
        .collect()
}
