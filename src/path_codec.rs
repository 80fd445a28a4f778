//! Pure byte <-> filesystem path conversion.
//!
//! Path bytes are stored exactly as observed on the source filesystem: an
//! arbitrary 8-bit sequence, not necessarily valid UTF-8, and sometimes
//! containing literal two-character escape sequences (`\r`, `\n`) left behind
//! by HFS+ "Private Directory Data" metadata entries. Decoding must preserve
//! invalid byte sequences exactly, and decoded output must round-trip back to
//! the original bytes if re-encoded: no normalization, no case-folding.
//!
//! This module does not touch the filesystem.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Decode raw path bytes from the database into a filesystem-usable path.
///
/// Two passes:
/// 1. The literal two-byte sequences `\r` and `\n` (backslash followed by the
///    letter) are rewritten to the single control bytes `0x0d` / `0x0a`. These
///    come from legacy HFS+ metadata directories stored verbatim as text.
/// 2. The result is interpreted as raw bytes via `OsStr::from_bytes`, which on
///    Unix preserves any sequence -- including invalid UTF-8 -- without loss.
pub fn decode_db_path_bytes(raw: &[u8]) -> PathBuf {
    let unescaped = unescape_hfs_control_chars(raw);
    PathBuf::from(OsStr::from_bytes(&unescaped))
}

/// Inverse of [`decode_db_path_bytes`]: recover the exact original byte
/// sequence for a path produced by it (or one the worker wants to persist).
///
/// This is the identity on the raw bytes of `path` -- the decode step above
/// never introduces information it can't reproduce, so encoding is just
/// reading the path's raw OS bytes back out.
pub fn encode_path_for_db(path: &Path) -> Vec<u8> {
    path.as_os_str().as_bytes().to_vec()
}

/// Rewrite literal `\r` and `\n` two-byte sequences to their control-character
/// equivalents. Any other backslash sequence is left untouched.
fn unescape_hfs_control_chars(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() && (raw[i + 1] == b'r' || raw[i + 1] == b'n') {
            out.push(if raw[i + 1] == b'r' { b'\r' } else { b'\n' });
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

/// Strip the archive root's leading-`/` convention: archive entries are
/// computed as `<archive_root>/<source_path with leading / stripped>`.
pub fn strip_leading_slash(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
