//! Mount manager: ensures a medium's image is mounted at a stable path,
//! delegating the actual mount syscall to a privileged helper binary.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use postgres::Client;
use tracing::{debug, info};

use crate::error::MountError;
use crate::types::MediumId;

/// Per-worker cache of already-resolved mount points, so repeated
/// `ensure_mounted` calls for the same medium are free after the first.
pub struct MountManager {
    mount_base: PathBuf,
    helper_binary: String,
    cache: HashMap<MediumId, PathBuf>,
}

impl MountManager {
    pub fn new(mount_base: impl Into<PathBuf>, helper_binary: impl Into<String>) -> Self {
        Self {
            mount_base: mount_base.into(),
            helper_binary: helper_binary.into(),
            cache: HashMap::new(),
        }
    }

    /// Return the canonical mount path for `medium_id`, mounting it via the
    /// privileged helper if it is not already mounted. Idempotent and cached.
    pub fn ensure_mounted(
        &mut self,
        client: &mut Client,
        medium_id: &MediumId,
    ) -> Result<PathBuf, MountError> {
        if let Some(cached) = self.cache.get(medium_id) {
            return Ok(cached.clone());
        }

        let expected = self.mount_base.join(medium_id.as_str());

        if let Some(resolved) = self.probe_existing_mount(&expected)? {
            self.cache.insert(medium_id.clone(), resolved.clone());
            return Ok(resolved);
        }

        let image_path = self.lookup_image_path(client, medium_id)?;
        if !Path::new(&image_path).exists() {
            return Err(MountError::MissingImage(medium_id.to_string(), image_path));
        }

        self.invoke_helper(medium_id, &image_path)?;

        // Re-probe after a successful helper invocation; the helper is
        // expected to have mounted at `expected`.
        let resolved = self.probe_existing_mount(&expected)?.unwrap_or(expected);
        self.cache.insert(medium_id.clone(), resolved.clone());
        info!(medium_id = %medium_id, mount_point = %resolved.display(), "medium mounted");
        Ok(resolved)
    }

    /// Probe `expected`: if it's a symlink, resolve it first. The resolved
    /// path counts as already-mounted only if `/proc/self/mountinfo` lists it
    /// as an actual mount point -- a stale, unmounted directory left behind
    /// at the same path must not be mistaken for a live mount.
    fn probe_existing_mount(&self, expected: &Path) -> Result<Option<PathBuf>, MountError> {
        let resolved = match fs::symlink_metadata(expected) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = fs::read_link(expected)?;
                if target.is_absolute() {
                    target
                } else {
                    expected
                        .parent()
                        .map(|p| p.join(&target))
                        .unwrap_or(target)
                }
            }
            Ok(_) => expected.to_path_buf(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !resolved.exists() {
            return Ok(None);
        }

        if is_mount_point(&resolved)? {
            debug!(path = %resolved.display(), "mount point already present");
            Ok(Some(resolved))
        } else {
            debug!(path = %resolved.display(), "path exists but is not a mount point");
            Ok(None)
        }
    }

    fn lookup_image_path(
        &self,
        client: &mut Client,
        medium_id: &MediumId,
    ) -> Result<String, MountError> {
        let row = client
            .query_opt(
                "SELECT image_path FROM medium WHERE medium_id = $1",
                &[&medium_id.as_str()],
            )?
            .ok_or_else(|| MountError::UnknownMedium(medium_id.to_string()))?;
        Ok(row.get::<_, String>("image_path"))
    }

    fn invoke_helper(&self, medium_id: &MediumId, image_path: &str) -> Result<(), MountError> {
        let status = Command::new(&self.helper_binary)
            .arg(medium_id.as_str())
            .arg(image_path)
            .status()?;
        if !status.success() {
            return Err(MountError::HelperFailed(
                medium_id.to_string(),
                format!("helper exited with {status}"),
            ));
        }
        Ok(())
    }
}

/// Check `/proc/self/mountinfo` for an entry whose mount point resolves to
/// `path`. Field 5 (0-indexed 4) of each line is the mount point, escaped the
/// way `/etc/mtab` escapes it (octal `\NNN` for space, tab, newline, backslash).
fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    let canonical = fs::canonicalize(path)?;
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    for line in mountinfo.lines() {
        let Some(field) = line.split_whitespace().nth(4) else {
            continue;
        };
        if Path::new(&unescape_mountinfo_field(field)) == canonical {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Undo mtab-style octal escaping (`\040` for space, etc.) in one mountinfo field.
fn unescape_mountinfo_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
