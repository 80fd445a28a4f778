//! Best-effort MIME type detection over the first 2 KiB of a file's content.
//!
//! No crate in this codebase's dependency tree offers magic-byte sniffing, so
//! this is a small hand-rolled signature table covering the formats this
//! archive is most likely to see. Detection failure is never fatal to
//! analysis -- callers treat `Ok(None)` the same as an error.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const SNIFF_LEN: usize = 2048;

/// Sniff the first 2 KiB of `path` and return a best-guess MIME type.
pub fn detect(path: &Path) -> io::Result<Option<String>> {
    let mut f = File::open(path)?;
    let mut buf = [0u8; SNIFF_LEN];
    let n = f.read(&mut buf)?;
    Ok(sniff(&buf[..n]).map(str::to_string))
}

fn sniff(head: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"BZh", "application/x-bzip2"),
        (b"\x7fELF", "application/x-elf"),
        (b"#!/", "text/x-shellscript"),
        (b"<?xml", "application/xml"),
    ];

    for (sig, mime) in SIGNATURES {
        if head.starts_with(sig) {
            return Some(mime);
        }
    }

    if !head.is_empty() && head.iter().all(|&b| b != 0 && (b >= 0x09 || b == 0x08)) {
        return Some("text/plain");
    }

    Some("application/octet-stream")
}
