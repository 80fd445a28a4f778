//! DB updater: applies one batch's outcomes inside a single transaction.
//!
//! Filesystem work has already happened by the time anything here runs --
//! this module only ever records what was done. Grounded in
//! `update_db_for_file`/`update_db_for_directory`/`update_db_for_symlink`/
//! `update_db_for_special` from the original copy worker.

use postgres::Client;
use tracing::{info, warn};

use crate::error::ErrorClass;
use crate::types::{BlobId, FsType, InodeRow};

/// Batch-wide statement timeout; a batch that runs longer than this is
/// rolled back by Postgres rather than blocking the worker loop forever.
const BATCH_STATEMENT_TIMEOUT: &str = "5min";

/// What happened to one claimed inode, ready to be folded into the database.
#[derive(Debug)]
pub enum InodeOutcome {
    Completed {
        inode: InodeRow,
        fs_type: FsType,
        mime_type: Option<String>,
        blob_id: Option<BlobId>,
        by_hash_created: bool,
        /// New hardlinks created by this run's executor call, folded into
        /// `blobs.n_hardlinks`, which only ever accumulates.
        links_created: usize,
        /// Overrides the cleared `claimed_by` with a terminal sentinel, e.g.
        /// `"EXCLUDED: all_paths_excluded"`.
        claimed_by_override: Option<String>,
        /// Path rows discovered missing on the source medium this run; each
        /// gets `exclude_reason = 'file_not_found'`.
        excluded_paths: Vec<Vec<u8>>,
    },
    Failed {
        inode: InodeRow,
        error_class: ErrorClass,
        message: String,
        excluded_paths: Vec<Vec<u8>>,
    },
}

impl InodeOutcome {
    fn inode(&self) -> &InodeRow {
        match self {
            InodeOutcome::Completed { inode, .. } => inode,
            InodeOutcome::Failed { inode, .. } => inode,
        }
    }
}

/// Apply every outcome in `batch` inside one transaction. Either the whole
/// batch lands, or (on any error) the whole batch is rolled back and the
/// claims revert to retryable on the next `claim_batch` pass.
pub fn commit_batch(client: &mut Client, batch: &[InodeOutcome]) -> Result<(), postgres::Error> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut txn = client.transaction()?;
    txn.batch_execute(&format!("SET LOCAL statement_timeout = '{BATCH_STATEMENT_TIMEOUT}'"))?;

    for outcome in batch {
        match outcome {
            InodeOutcome::Completed {
                inode,
                fs_type,
                mime_type,
                blob_id,
                by_hash_created,
                links_created,
                claimed_by_override,
                excluded_paths,
            } => {
                apply_completed(
                    &mut txn,
                    inode,
                    *fs_type,
                    mime_type.as_deref(),
                    blob_id.as_ref(),
                    *by_hash_created,
                    *links_created,
                    claimed_by_override.as_deref(),
                )?;
                apply_excluded_paths(&mut txn, inode, excluded_paths)?;
            }
            InodeOutcome::Failed {
                inode,
                error_class,
                message,
                excluded_paths,
            } => {
                apply_failed(&mut txn, inode, *error_class, message)?;
                apply_excluded_paths(&mut txn, inode, excluded_paths)?;
            }
        }
    }

    txn.commit()?;
    info!(count = batch.len(), "batch committed");
    Ok(())
}

fn apply_completed(
    txn: &mut postgres::Transaction<'_>,
    inode: &InodeRow,
    fs_type: FsType,
    mime_type: Option<&str>,
    blob_id: Option<&BlobId>,
    by_hash_created: bool,
    links_created: usize,
    claimed_by_override: Option<&str>,
) -> Result<(), postgres::Error> {
    let fs_type_str = fs_type.to_db_char().to_string();
    let blob_id_str = blob_id.map(BlobId::as_str);

    txn.execute(
        "UPDATE inode SET copied = true, fs_type = $1, mime_type = $2, blob_id = $3, \
         by_hash_created = by_hash_created OR $4, claimed_by = $5, claimed_at = NULL \
         WHERE medium_id = $6 AND inode_number = $7",
        &[
            &fs_type_str,
            &mime_type,
            &blob_id_str,
            &by_hash_created,
            &claimed_by_override,
            &inode.medium_id.as_str(),
            &inode.inode_number,
        ],
    )?;

    if let Some(blob_id) = blob_id {
        let n_hardlinks = links_created as i64;
        txn.execute(
            "INSERT INTO blobs (blob_id, n_hardlinks, last_checked) VALUES ($1, $2, NOW()) \
             ON CONFLICT (blob_id) DO UPDATE SET \
                n_hardlinks = blobs.n_hardlinks + EXCLUDED.n_hardlinks, \
                last_checked = NOW()",
            &[&blob_id.as_str(), &n_hardlinks],
        )?;

        txn.execute(
            "UPDATE path SET blob_id = $1 \
             WHERE medium_id = $2 AND inode_number = $3 AND exclude_reason IS NULL",
            &[&blob_id.as_str(), &inode.medium_id.as_str(), &inode.inode_number],
        )?;
    }

    Ok(())
}

/// Record paths discovered missing on the source medium this run.
fn apply_excluded_paths(
    txn: &mut postgres::Transaction<'_>,
    inode: &InodeRow,
    excluded_paths: &[Vec<u8>],
) -> Result<(), postgres::Error> {
    for path_bytes in excluded_paths {
        txn.execute(
            "UPDATE path SET exclude_reason = 'file_not_found' \
             WHERE medium_id = $1 AND inode_number = $2 AND path_bytes = $3",
            &[&inode.medium_id.as_str(), &inode.inode_number, path_bytes],
        )?;
    }
    Ok(())
}

fn apply_failed(
    txn: &mut postgres::Transaction<'_>,
    inode: &InodeRow,
    error_class: ErrorClass,
    message: &str,
) -> Result<(), postgres::Error> {
    let entry = format!("{}: {}", error_class.as_str(), message);

    // Three identical trailing errors promote the inode to a terminal,
    // excluded state rather than retrying it forever. A single failure,
    // even of a class that looks unrecoverable, is never terminal on its
    // own -- it just gets retried like any other.
    let mut prospective = inode.clone();
    prospective.errors.push(entry.clone());
    let persistent_failure = crate::diagnostics::DiagnosticService::new().should_skip_permanently(&prospective);

    let claimed_by_override: Option<&str> = if persistent_failure {
        Some("EXCLUDED: persistent_failure")
    } else {
        None
    };

    txn.execute(
        "UPDATE inode SET errors = array_append(errors, $1), copied = copied OR $2, \
         claimed_by = $3, claimed_at = NULL \
         WHERE medium_id = $4 AND inode_number = $5",
        &[
            &entry,
            &persistent_failure,
            &claimed_by_override,
            &inode.medium_id.as_str(),
            &inode.inode_number,
        ],
    )?;

    warn!(
        medium_id = %inode.medium_id,
        inode_number = inode.inode_number,
        class = error_class.as_str(),
        "inode recorded as failed"
    );

    Ok(())
}

/// Snapshot of queue depth for a medium, used by the `stats` subcommand.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub total: i64,
    pub copied: i64,
    pub claimed: i64,
    pub failed: i64,
}

pub fn queue_stats(client: &mut Client, medium_id: &str) -> Result<QueueStats, postgres::Error> {
    let row = client.query_one(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE copied) AS copied, \
                COUNT(*) FILTER (WHERE NOT copied AND claimed_by IS NOT NULL) AS claimed, \
                COUNT(*) FILTER (WHERE cardinality(errors) > 0) AS failed \
         FROM inode WHERE medium_id = $1",
        &[&medium_id],
    )?;
    Ok(QueueStats {
        total: row.get("total"),
        copied: row.get("copied"),
        claimed: row.get("claimed"),
        failed: row.get("failed"),
    })
}
