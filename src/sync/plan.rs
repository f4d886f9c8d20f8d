//! Action-plan construction: the pure, side-effect-free half of the sync
//! engine. Builds an ordered sequence of phases from a snapshot of local
//! and remote listings, per the phase/policy table in the reconciliation
//! component design. Kept free of I/O so the conflict-resolution and
//! phase-ordering rules can be exercised directly in tests.

use std::collections::HashMap;

use crate::types::{ConflictArtifact, ConflictSide, SyncConflict, SyncPolicy};

/// A locally indexed file, as read from the metadata store's
/// `localFiles` set.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub entry_id: i64,
    pub size: u64,
    pub hash: Option<String>,
    pub updated_at: u64,
}

/// What the remote side knows about one overlapping path: its size plus
/// whatever the `content-hash`/last-modified user metadata on the S3
/// object revealed. Both are best-effort — an object written by a tool
/// other than this one may carry neither.
#[derive(Debug, Clone, Default)]
pub struct RemoteFile {
    pub hash: Option<String>,
    pub updated_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    EnsureDirectory,
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub path: String,
    pub size: u64,
    /// Cache-mode only: download into the cache briefly for
    /// thumbnailing/indexing, then evict immediately.
    pub free_after_download: bool,
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub kind: ActionKind,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    pub phases: Vec<Phase>,
    pub conflicts: Vec<SyncConflict>,
}

impl ActionPlan {
    pub fn total_download_bytes(&self) -> u64 {
        self.phases
            .iter()
            .filter(|p| p.kind == ActionKind::Download)
            .flat_map(|p| p.actions.iter())
            .map(|a| a.size)
            .sum()
    }

    /// Count of actions that represent real sync work. `EnsureDirectory`
    /// is excluded: it is bookkeeping that makes a remote directory
    /// visible locally, not a counted sync operation (the original
    /// `CacheSyncTask::handleDiff` does not tally it either), so a
    /// directory-only remote listing with nothing left to move yields
    /// `num_ops_total == 0`.
    pub fn total_ops(&self) -> u64 {
        self.phases
            .iter()
            .filter(|p| p.kind != ActionKind::EnsureDirectory)
            .map(|p| p.actions.len() as u64)
            .sum()
    }
}

fn push_action(dest: &mut Vec<Action>, kind: ActionKind, path: &str, size: u64) {
    dest.push(Action { kind, path: path.to_string(), size, free_after_download: false });
}

fn conflict_of(path: &str, local: &LocalFile, remote_size: u64, reason: &str) -> SyncConflict {
    SyncConflict {
        path: path.to_string(),
        reason_code: reason.to_string(),
        artifacts: vec![
            ConflictArtifact {
                side: ConflictSide::Local,
                size: Some(local.size),
                hash: local.hash.clone(),
                mtime: Some(local.updated_at),
                iv: None,
                key_version: None,
            },
            ConflictArtifact {
                side: ConflictSide::Remote,
                size: Some(remote_size),
                hash: None,
                mtime: None,
                iv: None,
                key_version: None,
            },
        ],
    }
}

/// Builds the ordered action plan for one reconcile run. `remote` is the
/// flat path->size listing (`s3Map`); `remote_meta` carries whatever
/// hash/mtime the remote side exposed for paths also present in
/// `remote` (`remoteHashMap`); `remote_dirs` is the minimal
/// ancestor-directory set §4.E/§4.D.E derives from the key listing;
/// `existing_dirs` is the set of directory paths already materialized
/// locally (`DirectoryQueries::directoryExists`), so directories that
/// exist on both sides are never re-emitted as an action.
pub fn build_plan(
    policy: SyncPolicy,
    local: &HashMap<String, LocalFile>,
    remote: &HashMap<String, u64>,
    remote_meta: &HashMap<String, RemoteFile>,
    remote_dirs: &[String],
    existing_dirs: &std::collections::HashSet<String>,
) -> ActionPlan {
    let mut ensure_dirs = Vec::new();
    let mut uploads = Vec::new();
    let mut downloads = Vec::new();
    let mut delete_local = Vec::new();
    let mut delete_remote = Vec::new();
    let mut conflicts = Vec::new();

    if matches!(policy, SyncPolicy::Cache | SyncPolicy::Safe | SyncPolicy::MirrorKeepRemote) {
        for dir in remote_dirs {
            if !existing_dirs.contains(dir) {
                push_action(&mut ensure_dirs, ActionKind::EnsureDirectory, dir, 0);
            }
        }
    }

    // Local-only paths.
    for (path, local_file) in local {
        if remote.contains_key(path) {
            continue; // handled by the both-sides pass below
        }
        match policy {
            SyncPolicy::Cache | SyncPolicy::Safe | SyncPolicy::MirrorKeepLocal => {
                push_action(&mut uploads, ActionKind::Upload, path, local_file.size);
            }
            SyncPolicy::MirrorKeepRemote => {
                push_action(&mut delete_local, ActionKind::DeleteLocal, path, local_file.size);
            }
        }
    }

    // Remote-only paths.
    for (path, &size) in remote {
        if local.contains_key(path) {
            continue;
        }
        match policy {
            SyncPolicy::Cache | SyncPolicy::Safe | SyncPolicy::MirrorKeepRemote => {
                push_action(&mut downloads, ActionKind::Download, path, size);
            }
            SyncPolicy::MirrorKeepLocal => {
                push_action(&mut delete_remote, ActionKind::DeleteRemote, path, size);
            }
        }
    }

    // Paths present on both sides: no-op if content-identical, else
    // resolve per policy.
    for (path, local_file) in local {
        let remote_size = match remote.get(path) {
            Some(s) => *s,
            None => continue,
        };
        let empty = RemoteFile::default();
        let remote_file = remote_meta.get(path).unwrap_or(&empty);

        if let (Some(local_hash), Some(remote_hash)) = (&local_file.hash, &remote_file.hash) {
            if local_hash == remote_hash {
                continue; // identical content, no-op
            }
        }

        match policy {
            SyncPolicy::Safe => {
                // Open Question #2: hash-equal already handled above;
                // fall back to an updated_at comparison. Absent a
                // remote timestamp (an object with no `content-hash`/
                // mtime metadata), prefer the remote copy so a
                // foreign writer's upload isn't silently clobbered.
                let local_is_newer = match remote_file.updated_at {
                    Some(remote_updated_at) => local_file.updated_at > remote_updated_at,
                    None => false,
                };
                let reason = if local_is_newer { "local_newer" } else { "remote_newer" };
                conflicts.push(conflict_of(path, local_file, remote_size, reason));
                if local_is_newer {
                    push_action(&mut uploads, ActionKind::Upload, path, local_file.size);
                } else {
                    push_action(&mut downloads, ActionKind::Download, path, remote_size);
                }
            }
            SyncPolicy::Cache => {
                // `CacheSyncTask::sync`: download only when the remote
                // side is known to be at least as fresh. Absent a
                // remote timestamp (the common case — S3 objects here
                // carry none), or when local is newer, assume an
                // upload for this path is already scheduled elsewhere
                // and skip; never delete in Cache mode.
                let remote_is_fresher = match remote_file.updated_at {
                    Some(remote_updated_at) => local_file.updated_at <= remote_updated_at,
                    None => false,
                };
                if remote_is_fresher {
                    conflicts.push(conflict_of(path, local_file, remote_size, "remote_newer"));
                    push_action(&mut downloads, ActionKind::Download, path, remote_size);
                }
                // else: skip, no action, no conflict recorded.
            }
            SyncPolicy::MirrorKeepLocal => {
                conflicts.push(conflict_of(path, local_file, remote_size, "mirror_keep_local"));
                push_action(&mut uploads, ActionKind::Upload, path, local_file.size);
            }
            SyncPolicy::MirrorKeepRemote => {
                conflicts.push(conflict_of(path, local_file, remote_size, "mirror_keep_remote"));
                push_action(&mut downloads, ActionKind::Download, path, remote_size);
            }
        }
    }

    let mut phases = Vec::new();
    if !ensure_dirs.is_empty() {
        phases.push(Phase { kind: ActionKind::EnsureDirectory, actions: ensure_dirs });
    }
    if !uploads.is_empty() {
        phases.push(Phase { kind: ActionKind::Upload, actions: uploads });
    }
    if !downloads.is_empty() {
        phases.push(Phase { kind: ActionKind::Download, actions: downloads });
    }
    if !delete_local.is_empty() {
        phases.push(Phase { kind: ActionKind::DeleteLocal, actions: delete_local });
    }
    if !delete_remote.is_empty() {
        phases.push(Phase { kind: ActionKind::DeleteRemote, actions: delete_remote });
    }

    ActionPlan { phases, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn lf(size: u64, hash: Option<&str>, updated_at: u64) -> LocalFile {
        LocalFile { entry_id: 1, size, hash: hash.map(|s| s.to_string()), updated_at }
    }

    #[test]
    fn safe_mode_uploads_local_only_and_downloads_remote_only() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, None, 100));
        let mut remote = HashMap::new();
        remote.insert("b.txt".to_string(), 5u64);
        let plan = build_plan(SyncPolicy::Safe, &local, &remote, &HashMap::new(), &[], &HashSet::new());
        let upload_paths: Vec<_> = plan.phases.iter().find(|p| p.kind == ActionKind::Upload).unwrap().actions.iter().map(|a| a.path.clone()).collect();
        let download_paths: Vec<_> = plan.phases.iter().find(|p| p.kind == ActionKind::Download).unwrap().actions.iter().map(|a| a.path.clone()).collect();
        assert_eq!(upload_paths, vec!["a.txt"]);
        assert_eq!(download_paths, vec!["b.txt"]);
    }

    #[test]
    fn hash_equal_on_both_sides_is_a_no_op() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("deadbeef"), 100));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 3u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("deadbeef".to_string()), updated_at: None });
        let plan = build_plan(SyncPolicy::Safe, &local, &remote, &remote_meta, &[], &HashSet::new());
        assert!(plan.phases.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn safe_mode_conflict_prefers_newer_side_by_timestamp() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("aaa"), 200));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 9u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("bbb".to_string()), updated_at: Some(100) });
        let plan = build_plan(SyncPolicy::Safe, &local, &remote, &remote_meta, &[], &HashSet::new());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].reason_code, "local_newer");
        let upload_phase = plan.phases.iter().find(|p| p.kind == ActionKind::Upload).unwrap();
        assert_eq!(upload_phase.actions[0].path, "a.txt");
    }

    #[test]
    fn safe_mode_conflict_without_remote_timestamp_prefers_remote() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("aaa"), 200));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 9u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("bbb".to_string()), updated_at: None });
        let plan = build_plan(SyncPolicy::Safe, &local, &remote, &remote_meta, &[], &HashSet::new());
        assert_eq!(plan.conflicts[0].reason_code, "remote_newer");
        let download_phase = plan.phases.iter().find(|p| p.kind == ActionKind::Download).unwrap();
        assert_eq!(download_phase.actions[0].path, "a.txt");
    }

    #[test]
    fn mirror_keep_remote_deletes_local_only_files() {
        let mut local = HashMap::new();
        local.insert("stale.bin".to_string(), lf(3, None, 100));
        let plan = build_plan(SyncPolicy::MirrorKeepRemote, &local, &HashMap::new(), &HashMap::new(), &[], &HashSet::new());
        let phase = plan.phases.iter().find(|p| p.kind == ActionKind::DeleteLocal).unwrap();
        assert_eq!(phase.actions[0].path, "stale.bin");
    }

    #[test]
    fn mirror_keep_local_deletes_remote_only_objects() {
        let mut remote = HashMap::new();
        remote.insert("extra.bin".to_string(), 4u64);
        let plan = build_plan(SyncPolicy::MirrorKeepLocal, &HashMap::new(), &remote, &HashMap::new(), &[], &HashSet::new());
        let phase = plan.phases.iter().find(|p| p.kind == ActionKind::DeleteRemote).unwrap();
        assert_eq!(phase.actions[0].path, "extra.bin");
    }

    #[test]
    fn ensure_directories_phase_is_absent_for_mirror_keep_local() {
        let plan = build_plan(SyncPolicy::MirrorKeepLocal, &HashMap::new(), &HashMap::new(), &HashMap::new(), &["docs".to_string()], &HashSet::new());
        assert!(plan.phases.iter().all(|p| p.kind != ActionKind::EnsureDirectory));
    }

    #[test]
    fn ensure_directory_is_skipped_when_already_materialized() {
        let mut existing = HashSet::new();
        existing.insert("docs".to_string());
        let plan = build_plan(
            SyncPolicy::Safe,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &["docs".to_string(), "photos".to_string()],
            &existing,
        );
        let phase = plan.phases.iter().find(|p| p.kind == ActionKind::EnsureDirectory).unwrap();
        let paths: Vec<_> = phase.actions.iter().map(|a| a.path.clone()).collect();
        assert_eq!(paths, vec!["photos"]);
    }

    #[test]
    fn ensure_directory_phase_and_total_ops_are_empty_when_nothing_new() {
        let mut existing = HashSet::new();
        existing.insert("docs".to_string());
        let plan = build_plan(
            SyncPolicy::Safe,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &["docs".to_string()],
            &existing,
        );
        assert!(plan.phases.iter().all(|p| p.kind != ActionKind::EnsureDirectory));
        assert_eq!(plan.total_ops(), 0);
    }

    #[test]
    fn cache_mode_skips_download_when_local_is_newer() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("aaa"), 200));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 9u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("bbb".to_string()), updated_at: Some(100) });
        let plan = build_plan(SyncPolicy::Cache, &local, &remote, &remote_meta, &[], &HashSet::new());
        assert!(plan.conflicts.is_empty());
        assert!(plan.phases.iter().all(|p| p.kind != ActionKind::Download));
        assert!(plan.phases.iter().all(|p| p.kind != ActionKind::Upload));
    }

    #[test]
    fn cache_mode_skips_download_when_remote_timestamp_absent() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("aaa"), 200));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 9u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("bbb".to_string()), updated_at: None });
        let plan = build_plan(SyncPolicy::Cache, &local, &remote, &remote_meta, &[], &HashSet::new());
        assert!(plan.phases.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn cache_mode_downloads_when_remote_is_fresher() {
        let mut local = HashMap::new();
        local.insert("a.txt".to_string(), lf(3, Some("aaa"), 100));
        let mut remote = HashMap::new();
        remote.insert("a.txt".to_string(), 9u64);
        let mut remote_meta = HashMap::new();
        remote_meta.insert("a.txt".to_string(), RemoteFile { hash: Some("bbb".to_string()), updated_at: Some(200) });
        let plan = build_plan(SyncPolicy::Cache, &local, &remote, &remote_meta, &[], &HashSet::new());
        let phase = plan.phases.iter().find(|p| p.kind == ActionKind::Download).unwrap();
        assert_eq!(phase.actions[0].path, "a.txt");
        assert_eq!(plan.conflicts[0].reason_code, "remote_newer");
    }
}
