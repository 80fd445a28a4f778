//! Core semantic types for the copy worker: medium/blob identifiers, the
//! on-disk object-kind tag, and the row shapes read back from Postgres.

use std::fmt;

/// Opaque fixed-length medium identifier (typically a 128-bit hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediumId(String);

impl MediumId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MediumId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MediumId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Content hash identifying one unique blob: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(String);

/// Fixed blob id assigned to every zero-length file, regardless of the hash
/// algorithm used for non-empty content. Used to short-circuit empty-file
/// handling without hashing anything.
pub const EMPTY_FILE_BLOB_ID: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

impl BlobId {
    /// Wrap an already-lowercased 64-char hex digest. Does not re-validate length;
    /// callers that parse untrusted input should use [`BlobId::from_hex`].
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Parse a hex digest, rejecting anything that isn't 64 lowercase hex chars.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn empty_file() -> Self {
        Self(EMPTY_FILE_BLOB_ID.to_string())
    }

    /// Two-level shard prefix (`XX`, `YY`) used under `by_hash_root`.
    pub fn shard(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object kind on the source medium, encoded on the wire (DB column `fs_type`)
/// as a single character, matching the original enumerator's convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    File,
    Dir,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
    Unknown,
}

impl FsType {
    pub fn from_db_char(c: char) -> Self {
        match c {
            'f' => FsType::File,
            'd' => FsType::Dir,
            'l' => FsType::Symlink,
            'b' => FsType::BlockDev,
            'c' => FsType::CharDev,
            'p' => FsType::Fifo,
            's' => FsType::Socket,
            _ => FsType::Unknown,
        }
    }

    pub fn to_db_char(self) -> char {
        match self {
            FsType::File => 'f',
            FsType::Dir => 'd',
            FsType::Symlink => 'l',
            FsType::BlockDev => 'b',
            FsType::CharDev => 'c',
            FsType::Fifo => 'p',
            FsType::Socket => 's',
            FsType::Unknown => '?',
        }
    }

    /// The synthetic MIME type recorded for object kinds that are not regular files.
    pub fn synthetic_mime_type(self) -> Option<&'static str> {
        match self {
            FsType::Dir => Some("inode/directory"),
            FsType::Symlink => Some("inode/symlink"),
            FsType::BlockDev => Some("inode/blockdevice"),
            FsType::CharDev => Some("inode/chardevice"),
            FsType::Fifo => Some("inode/fifo"),
            FsType::Socket => Some("inode/socket"),
            FsType::File | FsType::Unknown => None,
        }
    }
}

/// One `inode` table row, as claimed by this worker.
#[derive(Debug, Clone)]
pub struct InodeRow {
    pub medium_id: MediumId,
    pub inode_number: i64,
    pub size: i64,
    pub fs_type: Option<FsType>,
    pub mime_type: Option<String>,
    pub blob_id: Option<BlobId>,
    pub copied: bool,
    pub by_hash_created: bool,
    pub claimed_by: Option<String>,
    pub errors: Vec<String>,
}

/// One `path` table row (a hardlink / directory entry pointing at an inode).
#[derive(Debug, Clone)]
pub struct PathRow {
    pub path_bytes: Vec<u8>,
    pub exclude_reason: Option<String>,
}

/// One claimed unit of work: an inode plus its non-excluded paths.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub inode: InodeRow,
    pub paths: Vec<PathRow>,
}

impl WorkUnit {
    /// Paths eligible for archival: those without an `exclude_reason`.
    pub fn live_paths(&self) -> impl Iterator<Item = &PathRow> {
        self.paths.iter().filter(|p| p.exclude_reason.is_none())
    }
}
