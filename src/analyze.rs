//! Analyzer: given one claimed inode and its live paths, decide the single
//! execution plan action and gather everything the executor needs.
//!
//! Detection order matters: symlink-ness is checked before `exists()`, since
//! a broken symlink must still classify as a symlink rather than "missing".

use std::path::{Path, PathBuf};

use postgres::Client;
use tracing::warn;

use crate::copier;
use crate::config::WorkerConfig;
use crate::error::AnalysisError;
use crate::mime;
use crate::types::{BlobId, FsType, InodeRow, WorkUnit};

/// The analyzer's output for one inode: exactly one action, plus whatever
/// data the executor needs to carry it out.
#[derive(Debug)]
pub enum Plan {
    Skip {
        inode: InodeRow,
        reason: String,
    },
    CreateDirectory {
        inode: InodeRow,
        archive_paths: Vec<PathBuf>,
    },
    CreateSymlink {
        inode: InodeRow,
        target: PathBuf,
        archive_paths: Vec<PathBuf>,
    },
    RecordSpecial {
        inode: InodeRow,
        fs_type: FsType,
    },
    HandleEmptyFile {
        inode: InodeRow,
        blob_id: BlobId,
        archive_paths: Vec<PathBuf>,
        mime_type: &'static str,
    },
    CopyNewFile {
        inode: InodeRow,
        blob_id: BlobId,
        temp_path: PathBuf,
        archive_paths: Vec<PathBuf>,
        mime_type: Option<String>,
    },
    LinkExistingFile {
        inode: InodeRow,
        blob_id: BlobId,
        archive_paths: Vec<PathBuf>,
        mime_type: Option<String>,
    },
}

impl Plan {
    pub fn inode(&self) -> &InodeRow {
        match self {
            Plan::Skip { inode, .. }
            | Plan::CreateDirectory { inode, .. }
            | Plan::CreateSymlink { inode, .. }
            | Plan::RecordSpecial { inode, .. }
            | Plan::HandleEmptyFile { inode, .. }
            | Plan::CopyNewFile { inode, .. }
            | Plan::LinkExistingFile { inode, .. } => inode,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            Plan::Skip { .. } => "skip",
            Plan::CreateDirectory { .. } => "create_directory",
            Plan::CreateSymlink { .. } => "create_symlink",
            Plan::RecordSpecial { .. } => "record_special",
            Plan::HandleEmptyFile { .. } => "handle_empty_file",
            Plan::CopyNewFile { .. } => "copy_new_file",
            Plan::LinkExistingFile { .. } => "link_existing_file",
        }
    }
}

pub struct Analyzer<'a> {
    pub config: &'a WorkerConfig,
    pub worker_id: &'a str,
}

impl<'a> Analyzer<'a> {
    pub fn new(config: &'a WorkerConfig, worker_id: &'a str) -> Self {
        Self { config, worker_id }
    }

    /// Analyze one claimed work unit, given the already-resolved source-side
    /// paths for each of its live archive paths.
    pub fn analyze(
        &self,
        client: &mut Client,
        unit: &WorkUnit,
        source_paths: &[PathBuf],
        archive_paths: &[PathBuf],
    ) -> Result<Plan, AnalysisError> {
        let inode = unit.inode.clone();

        if source_paths.is_empty() {
            return Ok(Plan::Skip {
                inode,
                reason: "no non-excluded paths".to_string(),
            });
        }

        let source_path = &source_paths[0];
        let fs_type = match inode.fs_type {
            Some(t) => t,
            None => match detect_fs_type(source_path) {
                Some(t) => t,
                None => {
                    return Ok(Plan::Skip {
                        inode,
                        reason: "cannot detect fs_type".to_string(),
                    });
                }
            },
        };

        match fs_type {
            FsType::File => self.analyze_file(client, inode, source_path, archive_paths),
            FsType::Dir => Ok(Plan::CreateDirectory {
                inode,
                archive_paths: archive_paths.to_vec(),
            }),
            FsType::Symlink => self.analyze_symlink(inode, source_path, archive_paths),
            FsType::BlockDev | FsType::CharDev | FsType::Fifo | FsType::Socket => {
                Ok(Plan::RecordSpecial { inode, fs_type })
            }
            FsType::Unknown => Ok(Plan::Skip {
                inode,
                reason: "unknown fs_type".to_string(),
            }),
        }
    }

    fn analyze_file(
        &self,
        client: &mut Client,
        inode: InodeRow,
        source_path: &Path,
        archive_paths: &[PathBuf],
    ) -> Result<Plan, AnalysisError> {
        if inode.size == 0 {
            return Ok(Plan::HandleEmptyFile {
                inode,
                blob_id: BlobId::empty_file(),
                archive_paths: archive_paths.to_vec(),
                mime_type: "application/x-empty",
            });
        }

        let temp_path = copier::temp_path_for(
            self.config,
            self.worker_id,
            inode.inode_number,
            inode.size as u64,
        );

        let copy_result = copier::copy_to_temp(source_path, &temp_path, inode.size as u64)
            .map_err(AnalysisError::from)
            .and_then(|()| copier::hash_file(&temp_path).map_err(AnalysisError::from));

        let blob_id = match copy_result {
            Ok(blob_id) => blob_id,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let mime_type = mime::detect(source_path).unwrap_or_else(|e| {
            warn!(error = %e, path = %source_path.display(), "mime detection failed, continuing");
            None
        });

        if self.blob_exists(client, &blob_id)? {
            let _ = std::fs::remove_file(&temp_path);
            Ok(Plan::LinkExistingFile {
                inode,
                blob_id,
                archive_paths: archive_paths.to_vec(),
                mime_type,
            })
        } else {
            Ok(Plan::CopyNewFile {
                inode,
                blob_id,
                temp_path,
                archive_paths: archive_paths.to_vec(),
                mime_type,
            })
        }
    }

    fn analyze_symlink(
        &self,
        inode: InodeRow,
        source_path: &Path,
        archive_paths: &[PathBuf],
    ) -> Result<Plan, AnalysisError> {
        let target = std::fs::read_link(source_path)?;
        Ok(Plan::CreateSymlink {
            inode,
            target,
            archive_paths: archive_paths.to_vec(),
        })
    }

    fn blob_exists(&self, client: &mut Client, blob_id: &BlobId) -> Result<bool, AnalysisError> {
        let row = client
            .query_opt("SELECT 1 FROM blobs WHERE blob_id = $1", &[&blob_id.as_str()])
            .map_err(|e| AnalysisError::Hash(e.to_string()))?;
        Ok(row.is_some())
    }
}

/// Detect the on-disk object kind for `source_path`. Checks symlink-ness
/// before existence, so a dangling symlink still classifies as a symlink
/// rather than "missing".
pub fn detect_fs_type(source_path: &Path) -> Option<FsType> {
    let symlink_meta = std::fs::symlink_metadata(source_path).ok()?;
    if symlink_meta.file_type().is_symlink() {
        return Some(FsType::Symlink);
    }
    if !source_path.exists() {
        return None;
    }
    let meta = std::fs::metadata(source_path).ok()?;
    if meta.is_dir() {
        return Some(FsType::Dir);
    }
    if meta.is_file() {
        return Some(FsType::File);
    }
    special_fs_type(&meta)
}

#[cfg(unix)]
fn special_fs_type(meta: &std::fs::Metadata) -> Option<FsType> {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    if ft.is_block_device() {
        Some(FsType::BlockDev)
    } else if ft.is_char_device() {
        Some(FsType::CharDev)
    } else if ft.is_fifo() {
        Some(FsType::Fifo)
    } else if ft.is_socket() {
        Some(FsType::Socket)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn special_fs_type(_meta: &std::fs::Metadata) -> Option<FsType> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::symlink;

    #[test]
    fn detects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_fs_type(dir.path()), Some(FsType::Dir));
    }

    #[test]
    fn detects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        assert_eq!(detect_fs_type(&path), Some(FsType::File));
    }

    #[test]
    #[cfg(unix)]
    fn detects_broken_symlink_as_symlink_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("broken");
        symlink(dir.path().join("does-not-exist"), &link).unwrap();
        assert_eq!(detect_fs_type(&link), Some(FsType::Symlink));
    }

    #[test]
    fn missing_path_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_fs_type(&dir.path().join("nope")), None);
    }
}
