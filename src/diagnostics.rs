//! Diagnostics: per-inode retry tracking, a dmesg-based checkpoint probe at
//! retry #10, and terminal-state promotion after repeated identical failures.
//!
//! Grounded in `ntt_copier_diagnostics.DiagnosticService`: `track_failure`,
//! `diagnose_at_checkpoint`, `should_skip_permanently`, and
//! `record_diagnostic_event_no_commit`.

use std::collections::HashMap;
use std::process::Command;

use postgres::Transaction;
use serde_json::json;
use tracing::warn;

use crate::types::{InodeRow, MediumId};

/// Retry count at which a dmesg checkpoint is taken, looking for evidence the
/// failure is hardware/media-level rather than transient.
const CHECKPOINT_RETRY: u32 = 10;

/// Number of identical trailing errors after which an inode is permanently
/// excluded rather than retried again.
const TERMINAL_REPEAT_COUNT: usize = 3;

const DMESG_PATTERNS: &[&str] = &["beyond EOF", "FAT-fs", "I/O error"];

#[derive(Debug, Default)]
pub struct DiagnosticService {
    retry_counts: HashMap<(MediumId, i64), u32>,
}

impl DiagnosticService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more failure for `inode` and return the new retry count.
    pub fn track_failure(&mut self, inode: &InodeRow) -> u32 {
        let key = (inode.medium_id.clone(), inode.inode_number);
        let count = self.retry_counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// At [`CHECKPOINT_RETRY`] failures, scan `dmesg` for known hardware/media
    /// error signatures. Returns the matching lines, if any; never fails the
    /// caller -- a dmesg read failure just means no diagnostic is recorded.
    pub fn diagnose_at_checkpoint(&self, retry_count: u32) -> Option<Vec<String>> {
        if retry_count != CHECKPOINT_RETRY {
            return None;
        }
        let matches = scan_dmesg().unwrap_or_default();
        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }

    /// An inode whose trailing [`TERMINAL_REPEAT_COUNT`] errors are identical
    /// is never going to succeed on its own; it should be excluded rather
    /// than retried forever.
    pub fn should_skip_permanently(&self, inode: &InodeRow) -> bool {
        tail_all_identical(&inode.errors, TERMINAL_REPEAT_COUNT)
    }
}

/// True iff the last `count` entries of `errors` are all equal. Used both for
/// the live `InodeRow.errors` and for a not-yet-committed candidate list (an
/// existing error array plus the entry about to be appended).
pub fn tail_all_identical(errors: &[String], count: usize) -> bool {
    if errors.len() < count {
        return false;
    }
    let tail = &errors[errors.len() - count..];
    tail.windows(2).all(|w| w[0] == w[1])
}

fn scan_dmesg() -> std::io::Result<Vec<String>> {
    let output = Command::new("dmesg").output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter(|line| DMESG_PATTERNS.iter().any(|p| line.contains(p)))
        .map(str::to_string)
        .collect())
}

/// Merge a diagnostic event into `medium.problems` (a JSONB array). The
/// commit is left to the caller's enclosing transaction, matching
/// `record_diagnostic_event_no_commit`'s deferred-commit contract.
pub fn record_diagnostic_event(
    txn: &mut Transaction<'_>,
    medium_id: &MediumId,
    inode_number: i64,
    retry_count: u32,
    dmesg_lines: &[String],
) -> Result<(), postgres::Error> {
    let event = json!({
        "inode_number": inode_number,
        "retry_count": retry_count,
        "dmesg_matches": dmesg_lines,
    });

    let result = txn.execute(
        "UPDATE medium SET problems = COALESCE(problems, '[]'::jsonb) || $1::jsonb \
         WHERE medium_id = $2",
        &[&event, &medium_id.as_str()],
    )?;

    if result == 0 {
        warn!(medium_id = %medium_id, "no medium row to record diagnostic event against");
    }

    Ok(())
}
