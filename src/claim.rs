//! Claim layer: atomically reserves a batch of unclaimed inodes for a worker.
//!
//! Three random probes against `id >= start_id` are tried first to spread
//! contention across the partitioned table without a global order; if all
//! three miss, a sequential scan without the lower bound handles the sparse
//! long tail. Every UPDATE here matches on the composite primary key
//! `(medium_id, inode_number)` so the partition pruner only ever touches the
//! target partition.

use rand::Rng;

use postgres::Client;
use tracing::debug;

use crate::error::ClaimError;
use crate::types::{InodeRow, MediumId, PathRow, WorkUnit};

const PROBE_ATTEMPTS: u32 = 3;
/// Inodes with at least this many recorded errors are swept to a terminal
/// state on worker startup so subsequent claims skip them.
const MAX_RETRIES: i64 = 5;

pub struct ClaimLayer {
    max_id: i64,
}

impl ClaimLayer {
    /// Compute `max_id` for `medium_id` once at startup.
    pub fn new(client: &mut Client, medium_id: &MediumId) -> Result<Self, ClaimError> {
        let row = client.query_one(
            "SELECT COALESCE(MAX(id), 0) AS max_id FROM inode WHERE medium_id = $1",
            &[&medium_id.as_str()],
        )?;
        Ok(Self {
            max_id: row.get("max_id"),
        })
    }

    /// Claim up to `batch_size` unclaimed inodes for `worker_id`, trying
    /// random probes before falling back to an unbounded scan.
    pub fn claim_batch(
        &self,
        client: &mut Client,
        medium_id: &MediumId,
        worker_id: &str,
        batch_size: i64,
    ) -> Result<Vec<WorkUnit>, ClaimError> {
        for _ in 0..PROBE_ATTEMPTS {
            let start_id = if self.max_id > 0 {
                rand::thread_rng().gen_range(0..=self.max_id)
            } else {
                0
            };
            let claimed = self.try_claim(client, medium_id, worker_id, batch_size, Some(start_id))?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
        }

        debug!(medium_id = %medium_id, "all random probes missed, falling back to sequential scan");
        self.try_claim(client, medium_id, worker_id, batch_size, None)
    }

    fn try_claim(
        &self,
        client: &mut Client,
        medium_id: &MediumId,
        worker_id: &str,
        batch_size: i64,
        start_id: Option<i64>,
    ) -> Result<Vec<WorkUnit>, ClaimError> {
        let mut txn = client.transaction()?;

        let candidate_ids: Vec<i64> = {
            let rows = if let Some(start_id) = start_id {
                txn.query(
                    "SELECT id FROM inode \
                     WHERE medium_id = $1 AND copied = false AND claimed_by IS NULL AND id >= $2 \
                     ORDER BY id \
                     FOR UPDATE SKIP LOCKED \
                     LIMIT $3",
                    &[&medium_id.as_str(), &start_id, &batch_size],
                )?
            } else {
                txn.query(
                    "SELECT id FROM inode \
                     WHERE medium_id = $1 AND copied = false AND claimed_by IS NULL \
                     ORDER BY id \
                     FOR UPDATE SKIP LOCKED \
                     LIMIT $2",
                    &[&medium_id.as_str(), &batch_size],
                )?
            };
            rows.iter().map(|r| r.get("id")).collect()
        };

        if candidate_ids.is_empty() {
            txn.commit()?;
            return Ok(Vec::new());
        }

        // Match on the composite primary key (medium_id, inode_number), not
        // the synthetic `id`, so the partition pruner visits only the target
        // partition rather than scanning every partition.
        let rows = txn.query(
            "UPDATE inode i SET claimed_by = $1, claimed_at = NOW() \
             FROM (SELECT medium_id, inode_number FROM inode WHERE id = ANY($2)) AS target \
             WHERE i.medium_id = target.medium_id AND i.inode_number = target.inode_number \
             RETURNING i.medium_id, i.inode_number, i.size, i.fs_type, i.mime_type, \
                       i.blob_id, i.copied, i.by_hash_created, i.claimed_by, i.errors",
            &[&worker_id, &candidate_ids],
        )?;

        let mut work_units = Vec::with_capacity(rows.len());
        for row in &rows {
            let medium_id: String = row.get("medium_id");
            let inode_number: i64 = row.get("inode_number");

            let path_rows = txn.query(
                "SELECT path_bytes, exclude_reason FROM path \
                 WHERE medium_id = $1 AND inode_number = $2",
                &[&medium_id, &inode_number],
            )?;

            let inode = InodeRow {
                medium_id: MediumId::new(medium_id),
                inode_number,
                size: row.get("size"),
                fs_type: row
                    .get::<_, Option<String>>("fs_type")
                    .and_then(|s| s.chars().next())
                    .map(crate::types::FsType::from_db_char),
                mime_type: row.get("mime_type"),
                blob_id: row
                    .get::<_, Option<String>>("blob_id")
                    .and_then(|s| crate::types::BlobId::from_hex(&s)),
                copied: row.get("copied"),
                by_hash_created: row.get("by_hash_created"),
                claimed_by: row.get("claimed_by"),
                errors: row.get("errors"),
            };

            let paths = path_rows
                .iter()
                .map(|p| PathRow {
                    path_bytes: p.get("path_bytes"),
                    exclude_reason: p.get("exclude_reason"),
                })
                .collect();

            work_units.push(WorkUnit { inode, paths });
        }

        txn.commit()?;
        Ok(work_units)
    }

    /// Release a claim held by `worker_id` without making any other change.
    pub fn release_claim(
        &self,
        client: &mut Client,
        inode: &InodeRow,
        worker_id: &str,
    ) -> Result<(), ClaimError> {
        client.execute(
            "UPDATE inode SET claimed_by = NULL, claimed_at = NULL \
             WHERE medium_id = $1 AND inode_number = $2 AND claimed_by = $3",
            &[&inode.medium_id.as_str(), &inode.inode_number, &worker_id],
        )?;
        Ok(())
    }
}

/// Startup sweep: mark any inode with at least [`MAX_RETRIES`] recorded
/// errors as terminal so subsequent claims skip it.
pub fn sweep_max_retries(client: &mut Client, medium_id: &MediumId) -> Result<u64, ClaimError> {
    let n = client.execute(
        "UPDATE inode SET copied = true, claimed_by = 'MAX_RETRIES_EXCEEDED', claimed_at = NULL \
         WHERE medium_id = $1 AND copied = false AND cardinality(errors) >= $2",
        &[&medium_id.as_str(), &MAX_RETRIES],
    )?;
    Ok(n)
}
