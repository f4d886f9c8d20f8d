//! Sync engine: drives one reconcile run for one vault end to end —
//! gather, plan, execute phase-by-phase with a barrier between phases
//! and pool-bounded concurrency within a phase, record the result.
//!
//! Grounded on the teacher's `background_worker.rs` loop (collect ops,
//! then perform each one) and `caching_remote.rs`'s upload/download
//! pairing, generalized to the three-policy reconciliation described in
//! the storage-synchronization component design.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::error::{VaultError, VaultResult};
use crate::fsops::FsOps;
use crate::logging::TARGET_SYNC;
use crate::s3::xml;
use crate::storage::CloudEngine;
use crate::types::{SyncEvent, SyncStatus, SyncTrigger, ThroughputMetric, ThroughputRecord, Vault, VaultType};
use crate::workerpool::WorkerPool;

use super::plan::{self, Action, ActionKind, ActionPlan, LocalFile, RemoteFile};

/// Cache-mode free-space floor (Open Question #1): kept as a hardcoded
/// constant rather than config-driven, matching the original's
/// undocumented-but-observed behavior.
pub const MIN_FREE_SPACE: u64 = 10 * 1024 * 1024;
const SHOULD_PURGE_THRESHOLD: u64 = 2 * MIN_FREE_SPACE;

pub struct SyncEngine {
    fsops: Arc<FsOps>,
    workers: Arc<WorkerPool>,
}

impl SyncEngine {
    pub fn new(fsops: Arc<FsOps>, workers: Arc<WorkerPool>) -> SyncEngine {
        SyncEngine { fsops, workers }
    }

    /// Runs one reconcile pass for `vault`. Returns the finished
    /// `SyncEvent` on both success and handled failure (a transient
    /// per-action error does not abort the run; it's recorded in the
    /// event's error fields and throughput failure counts).
    pub fn run_once(&self, vault: &Vault, trigger: SyncTrigger, retry_attempt: u32) -> VaultResult<SyncEvent> {
        if vault.vault_type != VaultType::S3 {
            return Err(VaultError::InvalidArgument(format!("vault {} is not a sync-capable S3 vault", vault.id)));
        }
        let engine = self.fsops.manager().engine_for(vault.id)?;
        let cloud = engine
            .as_cloud()
            .ok_or_else(|| VaultError::InvalidArgument(format!("vault {} has no cloud engine", vault.id)))?;

        let run_uuid = Uuid::new_v4().to_string();
        let sync_event_id = self
            .fsops
            .pool()
            .transaction(|txn| queries::begin_sync_event(txn, vault.id, &run_uuid, trigger, retry_attempt))?;
        info!(target: TARGET_SYNC, "vault {} sync run {} started ({:?}, attempt {})", vault.id, run_uuid, trigger, retry_attempt);

        let outcome = self.reconcile(vault, cloud, sync_event_id);
        self.fsops.pool_with(|conn| queries::touch_heartbeat(conn, sync_event_id))?;

        match outcome {
            Ok(run) => {
                self.fsops.pool_with(|conn| {
                    queries::finish_sync_event(
                        conn,
                        sync_event_id,
                        SyncStatus::Success,
                        run.total_ops,
                        run.bytes_up,
                        run.bytes_down,
                        None,
                        None,
                    )?;
                    for record in &run.throughput {
                        queries::insert_throughput(conn, sync_event_id, record)?;
                    }
                    for conflict in &run.conflicts {
                        queries::insert_conflict(conn, sync_event_id, conflict)?;
                    }
                    queries::record_sync_success(conn, vault.id)
                })?;
                info!(target: TARGET_SYNC, "vault {} sync run {} succeeded: {} ops, {}B up, {}B down, {} conflicts",
                    vault.id, run_uuid, run.total_ops, run.bytes_up, run.bytes_down, run.conflicts.len());
            }
            Err(ref err) => {
                self.fsops.pool_with(|conn| {
                    queries::finish_sync_event(
                        conn,
                        sync_event_id,
                        SyncStatus::Error,
                        0,
                        0,
                        0,
                        Some(err.code()),
                        Some(&err.to_string()),
                    )
                })?;
                warn!(target: TARGET_SYNC, "vault {} sync run {} failed: {}", vault.id, run_uuid, err);
            }
        }
        self.fsops.pool_with(|conn| queries::get_sync_event(conn, sync_event_id))
    }

    /// Builds the input listings and action plan, then executes it.
    fn reconcile(&self, vault: &Vault, cloud: &CloudEngine, sync_event_id: i64) -> VaultResult<ReconcileRun> {
        let local_rows = self.fsops.pool_with(|conn| queries::list_vault_files(conn, vault.id))?;
        let mut local: HashMap<String, LocalFile> = HashMap::new();
        for (entry, meta) in local_rows {
            local.insert(
                entry.path.clone(),
                LocalFile { entry_id: entry.id, size: meta.size_bytes, hash: meta.content_hash, updated_at: entry.updated_at },
            );
        }

        let remote = cloud.grouped_files_from_s3()?;

        // Only probe remote metadata for paths present on both sides —
        // those are the only ones whose resolution needs it; local-only
        // and remote-only paths are unambiguous.
        let mut remote_meta: HashMap<String, RemoteFile> = HashMap::new();
        for path in local.keys() {
            if remote.contains_key(path) {
                let hash = cloud.get_remote_content_hash(path).unwrap_or(None);
                remote_meta.insert(path.clone(), RemoteFile { hash, updated_at: None });
            }
        }

        let remote_keys: Vec<String> = remote.keys().cloned().collect();
        let remote_dirs = xml::extract_directories(&remote_keys, "");
        let existing_dirs = self.fsops.pool_with(|conn| queries::list_vault_directory_paths(conn, vault.id))?;

        let action_plan = plan::build_plan(vault.sync_policy, &local, &remote, &remote_meta, &remote_dirs, &existing_dirs);
        debug!(target: TARGET_SYNC, "vault {} plan: {} phases, {} ops, {} conflicts",
            vault.id, action_plan.phases.len(), action_plan.total_ops(), action_plan.conflicts.len());

        let free_after_download = if matches!(vault.sync_policy, crate::types::SyncPolicy::Cache) {
            self.enforce_cache_budget(vault, cloud, action_plan.total_download_bytes())?
        } else {
            false
        };

        self.execute(vault, cloud, action_plan, sync_event_id, free_after_download)
    }

    /// Cache-mode eviction. `required` is the sum of sizes to download.
    /// If even evicting every purgeable cache entry wouldn't free enough
    /// room (`freeSpace() + cache_size_total() < required`), eviction is
    /// skipped entirely and the run instead proceeds in "free-after-
    /// download" mode: every download is cached only transiently and
    /// evicted immediately afterward. Otherwise, if `freeSpace() <
    /// required`, the largest cache entries are evicted in doubling
    /// batches until there's `2*MIN_FREE_SPACE` of headroom past
    /// `required`, and downloads proceed normally (cached and kept).
    fn enforce_cache_budget(&self, vault: &Vault, cloud: &CloudEngine, required: u64) -> VaultResult<bool> {
        let mut free = cloud.free_space()?;
        let purgeable = self.fsops.pool_with(|conn| queries::cache_size_total(conn, vault.id))?;
        if free + purgeable < required {
            warn!(target: TARGET_SYNC, "vault {} cannot free {}B even by evicting the entire {}B cache; downloading in free-after-download mode", vault.id, required, purgeable);
            return Ok(true);
        }
        if free >= required + SHOULD_PURGE_THRESHOLD {
            return Ok(false);
        }
        let mut batch: u32 = 1;
        loop {
            let candidates = self.fsops.pool_with(|conn| queries::largest_cache_entries(conn, vault.id, batch))?;
            if candidates.is_empty() {
                return Err(VaultError::InsufficientSpace(format!(
                    "vault {} needs {}B but only {}B free after evicting everything cached",
                    vault.id, required, free
                )));
            }
            let mut evicted_any = false;
            for entry in &candidates {
                if free >= required + SHOULD_PURGE_THRESHOLD {
                    break;
                }
                cloud.evict_cache_entry(&entry.path)?;
                free += entry.size;
                evicted_any = true;
            }
            if free >= required + SHOULD_PURGE_THRESHOLD {
                return Ok(false);
            }
            if !evicted_any {
                return Err(VaultError::InsufficientSpace(format!(
                    "vault {} still short of {}B headroom after evicting {} largest entries",
                    vault.id, SHOULD_PURGE_THRESHOLD, candidates.len()
                )));
            }
            batch = batch.saturating_mul(2);
        }
    }

    fn execute(
        &self,
        vault: &Vault,
        cloud: &CloudEngine,
        action_plan: ActionPlan,
        sync_event_id: i64,
        free_after_download: bool,
    ) -> VaultResult<ReconcileRun> {
        let mut run = ReconcileRun::default();
        run.conflicts = action_plan.conflicts;

        for phase in &action_plan.phases {
            let results: Vec<VaultResult<u64>> = self.workers_run_phase(vault, cloud, phase, free_after_download);
            // Touch the heartbeat between phases so a slow Upload/Download
            // phase doesn't starve the scheduler's stall-detection tick
            // (default 120s window, §5) even though no per-action timer
            // exists here.
            let _ = self.fsops.pool_with(|conn| queries::touch_heartbeat(conn, sync_event_id));
            let mut metric_count = 0u64;
            let mut metric_bytes = 0u64;
            let mut metric_failed = 0u64;
            let started = std::time::Instant::now();
            for (action, result) in phase.actions.iter().zip(results.into_iter()) {
                if phase.kind != ActionKind::EnsureDirectory {
                    run.total_ops += 1;
                }
                match result {
                    Ok(bytes) => {
                        metric_count += 1;
                        metric_bytes += bytes;
                        match phase.kind {
                            ActionKind::Upload => run.bytes_up += bytes,
                            ActionKind::Download => run.bytes_down += bytes,
                            _ => {}
                        }
                    }
                    Err(err) => {
                        metric_failed += 1;
                        warn!(target: TARGET_SYNC, "vault {} action {:?} on {} failed: {}", vault.id, phase.kind, action.path, err);
                    }
                }
            }
            let metric = match phase.kind {
                ActionKind::Upload => Some(ThroughputMetric::Upload),
                ActionKind::Download => Some(ThroughputMetric::Download),
                ActionKind::DeleteLocal | ActionKind::DeleteRemote => Some(ThroughputMetric::Delete),
                ActionKind::EnsureDirectory => None,
            };
            if let Some(metric) = metric {
                run.throughput.push(ThroughputRecord {
                    metric,
                    count: metric_count,
                    bytes: metric_bytes,
                    duration_ms: started.elapsed().as_millis() as u64,
                    failed: metric_failed,
                });
            }
        }
        Ok(run)
    }

    /// Drains pending remote deletes left behind by `FsOps::remove` for
    /// S3 vaults (local vaults delete synchronously and never populate
    /// this queue). Each tombstone's `backing_path` is the logical rel
    /// path the entry had when it was trashed; removing it from the
    /// bucket is idempotent, so a delete that already landed on a prior
    /// (crashed or restarted) run is simply a no-op 404. Returns the
    /// number of tombstones closed out.
    pub fn drain_trash(&self, vault: &Vault) -> VaultResult<u64> {
        if vault.vault_type != VaultType::S3 {
            return Ok(0);
        }
        let engine = self.fsops.manager().engine_for(vault.id)?;
        let cloud = engine
            .as_cloud()
            .ok_or_else(|| VaultError::InvalidArgument(format!("vault {} has no cloud engine", vault.id)))?;
        let pending = self.fsops.pool_with(|conn| queries::pending_trashed_deletes(conn, vault.id))?;
        let mut drained = 0u64;
        for trashed in pending {
            match cloud.remove(&trashed.backing_path) {
                Ok(()) | Err(VaultError::NotFound(_)) => {
                    self.fsops.pool_with(|conn| queries::mark_trashed_deleted(conn, trashed.id))?;
                    drained += 1;
                }
                Err(err) => {
                    warn!(target: TARGET_SYNC, "vault {} trash drain: failed to remove {}: {}", vault.id, trashed.backing_path, err);
                }
            }
        }
        if drained > 0 {
            debug!(target: TARGET_SYNC, "vault {} trash drain: closed {} tombstones", vault.id, drained);
        }
        Ok(drained)
    }

    /// Submits every action in one phase to the worker pool and joins
    /// on all of them before the next phase starts — concurrency within
    /// a phase, a barrier between phases.
    fn workers_run_phase(
        &self,
        vault: &Vault,
        cloud: &CloudEngine,
        phase: &plan::Phase,
        free_after_download: bool,
    ) -> Vec<VaultResult<u64>> {
        let tasks: Vec<_> = phase
            .actions
            .iter()
            .map(|action| move || self.run_action(vault, cloud, phase.kind, action, free_after_download))
            .collect();
        self.workers.run_all(tasks)
    }

    /// Runs a single action, returning the number of bytes moved (0 for
    /// metadata-only/delete actions).
    fn run_action(
        &self,
        vault: &Vault,
        cloud: &CloudEngine,
        kind: ActionKind,
        action: &Action,
        free_after_download: bool,
    ) -> VaultResult<u64> {
        match kind {
            ActionKind::EnsureDirectory => {
                self.fsops.ensure_directory(vault.id, &action.path, 0, 0)?;
                Ok(0)
            }
            ActionKind::Upload => {
                let engine = self.fsops.manager().engine_for(vault.id)?;
                let bytes = engine.read_file(&action.path)?;
                let meta = cloud.upload(&action.path, &bytes)?;
                self.fsops.record_uploaded_meta(&action.path, &meta)?;
                Ok(bytes.len() as u64)
            }
            ActionKind::Download => {
                let bytes = if free_after_download {
                    let bytes = cloud.download_file(&action.path)?;
                    cloud.index_and_delete_file(&action.path)?;
                    bytes
                } else {
                    cloud.download_file(&action.path)?
                };
                let meta = crate::types::FileMeta {
                    entry_id: 0,
                    size_bytes: bytes.len() as u64,
                    mime_type: None,
                    content_hash: Some(crate::crypto::sha256_hex(&bytes)),
                    encryption_iv: None,
                    encrypted_with_key_version: None,
                };
                self.fsops.upsert_downloaded_file(vault.id, &action.path, &meta, 0, 0)?;
                Ok(bytes.len() as u64)
            }
            ActionKind::DeleteLocal => {
                self.fsops.remove(vault.id, &action.path, None)?;
                Ok(action.size)
            }
            ActionKind::DeleteRemote => {
                cloud.remove(&action.path)?;
                Ok(action.size)
            }
        }
    }
}

#[derive(Default)]
struct ReconcileRun {
    total_ops: u64,
    bytes_up: u64,
    bytes_down: u64,
    throughput: Vec<ThroughputRecord>,
    conflicts: Vec<crate::types::SyncConflict>,
}
