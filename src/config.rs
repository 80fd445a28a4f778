//! Environment-derived configuration, read once at worker startup.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db_url: String,
    pub ramdisk_root: PathBuf,
    pub nvme_tmp: PathBuf,
    pub by_hash_root: PathBuf,
    pub archive_root: PathBuf,
    pub search_path: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from the environment, applying the same defaults
    /// the original worker used when a variable was unset.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            db_url: env::var("NTT_DB_URL").unwrap_or_else(|_| "postgresql:///copyjob".to_string()),
            ramdisk_root: env::var("NTT_RAMDISK")
                .unwrap_or_else(|_| "/tmp/ram".to_string())
                .into(),
            nvme_tmp: env::var("NTT_NVME_TMP")
                .unwrap_or_else(|_| "/data/fast/tmp".to_string())
                .into(),
            by_hash_root: env::var("NTT_BY_HASH_ROOT")
                .unwrap_or_else(|_| "/data/cold/by-hash".to_string())
                .into(),
            archive_root: env::var("NTT_ARCHIVE_ROOT")
                .unwrap_or_else(|_| "/data/cold/archived".to_string())
                .into(),
            search_path: env::var("NTT_SEARCH_PATH").ok(),
        })
    }
}

/// Minimum free space, in bytes, required on the archive root's filesystem
/// for preflight to pass.
pub const MIN_ARCHIVE_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024 * 1024;
