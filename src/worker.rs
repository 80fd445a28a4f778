//! Worker loop: claim a batch, analyze and execute each inode in sequence,
//! commit the batch, repeat until the queue is drained or a shutdown signal
//! arrives. One process, one connection, no internal task scheduler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use postgres::Client;
use tracing::{debug, info, warn};

use crate::analyze::{Analyzer, Plan};
use crate::claim::{self, ClaimLayer};
use crate::config::WorkerConfig;
use crate::db::{self, InodeOutcome};
use crate::diagnostics::DiagnosticService;
use crate::execute;
use crate::mount::MountManager;
use crate::path_codec;
use crate::types::{FsType, MediumId, WorkUnit};

pub struct WorkerOptions {
    pub medium_id: MediumId,
    pub worker_id: String,
    pub batch_size: i64,
    pub limit: Option<u64>,
    pub dry_run: bool,
}

/// Install a `SIGINT`/`SIGTERM` handler that flips an `AtomicBool`, checked
/// between batches (never mid-batch) so a batch either completes or is
/// rolled back in full.
pub fn install_shutdown_flag() -> Result<Arc<AtomicBool>, std::io::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    Ok(flag)
}

/// Run the copy loop until the queue is drained, `opts.limit` inodes have
/// been processed, or `shutdown` is set.
pub fn run(
    client: &mut Client,
    config: &WorkerConfig,
    opts: &WorkerOptions,
    shutdown: &AtomicBool,
) -> anyhow::Result<u64> {
    let swept = claim::sweep_max_retries(client, &opts.medium_id)?;
    if swept > 0 {
        info!(count = swept, "swept inodes past max retries at startup");
    }

    let claim_layer = ClaimLayer::new(client, &opts.medium_id)?;
    let mut mount_mgr = MountManager::new("/mnt", "mount-ntt-medium");
    let analyzer = Analyzer::new(config, &opts.worker_id);
    let mut diagnostics = DiagnosticService::new();

    let mut processed: u64 = 0;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown signal observed, stopping before next batch");
            break;
        }
        if let Some(limit) = opts.limit {
            if processed >= limit {
                info!(limit, "processing limit reached");
                break;
            }
        }

        let remaining = opts.limit.map(|l| l.saturating_sub(processed));
        let batch_size = remaining
            .map(|r| opts.batch_size.min(r as i64))
            .unwrap_or(opts.batch_size);
        if batch_size == 0 {
            break;
        }

        let batch = claim_layer.claim_batch(client, &opts.medium_id, &opts.worker_id, batch_size)?;
        if batch.is_empty() {
            info!("queue drained, no unclaimed inodes remain");
            break;
        }

        let mount_point = mount_mgr.ensure_mounted(client, &opts.medium_id)?;

        let mut outcomes = Vec::with_capacity(batch.len());
        for unit in &batch {
            let outcome = process_unit(
                client,
                config,
                &analyzer,
                &mut diagnostics,
                &mount_point,
                &opts.worker_id,
                unit,
                opts.dry_run,
            );
            processed += 1;
            outcomes.push(outcome);
        }

        if !opts.dry_run {
            db::commit_batch(client, &outcomes)?;
        }

        debug!(batch_len = batch.len(), processed, "batch complete");
    }

    Ok(processed)
}

fn process_unit(
    client: &mut Client,
    config: &WorkerConfig,
    analyzer: &Analyzer<'_>,
    diagnostics: &mut DiagnosticService,
    mount_point: &std::path::Path,
    _worker_id: &str,
    unit: &WorkUnit,
    dry_run: bool,
) -> InodeOutcome {
    let live_paths: Vec<_> = unit.live_paths().collect();

    // A path can vanish between enumeration and processing (deleted, or the
    // medium's mount state changed). Partition into the paths still present
    // on the source and those that now resolve to nothing -- the latter are
    // excluded with `file_not_found` rather than failing the whole inode.
    let mut available_source: Vec<PathBuf> = Vec::new();
    let mut available_archive: Vec<PathBuf> = Vec::new();
    let mut newly_excluded: Vec<Vec<u8>> = Vec::new();

    for p in &live_paths {
        let decoded = path_codec::decode_db_path_bytes(&p.path_bytes);
        let relative = path_codec::strip_leading_slash(&decoded);
        let source_path = mount_point.join(relative);
        if std::fs::symlink_metadata(&source_path).is_ok() {
            available_source.push(source_path);
            available_archive.push(config.archive_root.join(relative));
        } else {
            newly_excluded.push(p.path_bytes.clone());
        }
    }

    if available_source.is_empty() {
        info!(
            inode_number = unit.inode.inode_number,
            "every path for this inode is missing on the source medium"
        );
        return InodeOutcome::Completed {
            inode: unit.inode.clone(),
            fs_type: FsType::Unknown,
            mime_type: None,
            blob_id: None,
            by_hash_created: false,
            links_created: 0,
            claimed_by_override: Some("EXCLUDED: all_paths_excluded".to_string()),
            excluded_paths: newly_excluded,
        };
    }

    let plan = match analyzer.analyze(client, unit, &available_source, &available_archive) {
        Ok(plan) => plan,
        Err(e) => {
            let mut outcome = failed_outcome(client, diagnostics, unit, e.classify(), &e.to_string());
            attach_excluded_paths(&mut outcome, newly_excluded);
            return outcome;
        }
    };

    if dry_run {
        info!(action = plan.action_name(), inode_number = plan.inode().inode_number, "dry run, no effects applied");
        return InodeOutcome::Completed {
            inode: unit.inode.clone(),
            fs_type: FsType::Unknown,
            mime_type: None,
            blob_id: None,
            by_hash_created: false,
            links_created: 0,
            claimed_by_override: None,
            excluded_paths: newly_excluded,
        };
    }

    let mut outcome = match execute_plan(config, plan) {
        Ok(outcome) => outcome,
        Err(e) => failed_outcome(client, diagnostics, unit, e.classify(), &e.to_string()),
    };
    attach_excluded_paths(&mut outcome, newly_excluded);
    outcome
}

fn attach_excluded_paths(outcome: &mut InodeOutcome, newly_excluded: Vec<Vec<u8>>) {
    match outcome {
        InodeOutcome::Completed { excluded_paths, .. } | InodeOutcome::Failed { excluded_paths, .. } => {
            excluded_paths.extend(newly_excluded);
        }
    }
}

fn execute_plan(config: &WorkerConfig, plan: Plan) -> Result<InodeOutcome, crate::error::ExecutionError> {
    match plan {
        Plan::Skip { inode, reason } => {
            warn!(inode_number = inode.inode_number, reason = %reason, "skipping inode");
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::Unknown,
                mime_type: None,
                blob_id: None,
                by_hash_created: false,
                links_created: 0,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
        Plan::CreateDirectory { inode, archive_paths } => {
            execute::execute_directory(&archive_paths)?;
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::Dir,
                mime_type: FsType::Dir.synthetic_mime_type().map(str::to_string),
                blob_id: None,
                by_hash_created: false,
                links_created: 0,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
        Plan::CreateSymlink { inode, target, archive_paths } => {
            execute::execute_symlink(&target, &archive_paths)?;
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::Symlink,
                mime_type: FsType::Symlink.synthetic_mime_type().map(str::to_string),
                blob_id: None,
                by_hash_created: false,
                links_created: 0,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
        Plan::RecordSpecial { inode, fs_type } => Ok(InodeOutcome::Completed {
            inode,
            fs_type,
            mime_type: fs_type.synthetic_mime_type().map(str::to_string),
            blob_id: None,
            by_hash_created: false,
            links_created: 0,
            claimed_by_override: None,
            excluded_paths: Vec::new(),
        }),
        Plan::HandleEmptyFile {
            inode,
            blob_id,
            archive_paths,
            mime_type,
        } => {
            let links = execute::execute_empty_file(config, &blob_id, &archive_paths)?;
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::File,
                mime_type: Some(mime_type.to_string()),
                blob_id: Some(blob_id),
                by_hash_created: false,
                links_created: links,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
        Plan::CopyNewFile {
            inode,
            blob_id,
            temp_path,
            archive_paths,
            mime_type,
        } => {
            let result = execute::execute_copy_new_file(config, &blob_id, &temp_path, &archive_paths)?;
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::File,
                mime_type,
                blob_id: Some(blob_id),
                by_hash_created: result.by_hash_created,
                links_created: result.links_created,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
        Plan::LinkExistingFile {
            inode,
            blob_id,
            archive_paths,
            mime_type,
        } => {
            let links = execute::execute_link_existing_file(config, &blob_id, &archive_paths)?;
            Ok(InodeOutcome::Completed {
                inode,
                fs_type: FsType::File,
                mime_type,
                blob_id: Some(blob_id),
                by_hash_created: false,
                links_created: links,
                claimed_by_override: None,
                excluded_paths: Vec::new(),
            })
        }
    }
}

fn failed_outcome(
    client: &mut Client,
    diagnostics: &mut DiagnosticService,
    unit: &WorkUnit,
    error_class: crate::error::ErrorClass,
    message: &str,
) -> InodeOutcome {
    let retry_count = diagnostics.track_failure(&unit.inode);
    warn!(
        inode_number = unit.inode.inode_number,
        retry_count,
        class = error_class.as_str(),
        message,
        "inode analysis/execution failed"
    );

    if let Some(dmesg_lines) = diagnostics.diagnose_at_checkpoint(retry_count) {
        if let Ok(mut txn) = client.transaction() {
            let recorded = crate::diagnostics::record_diagnostic_event(
                &mut txn,
                &unit.inode.medium_id,
                unit.inode.inode_number,
                retry_count,
                &dmesg_lines,
            );
            if recorded.is_ok() {
                let _ = txn.commit();
            }
        }
    }

    InodeOutcome::Failed {
        inode: unit.inode.clone(),
        error_class,
        message: message.to_string(),
        excluded_paths: Vec::new(),
    }
}
