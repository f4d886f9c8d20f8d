//! Shared data model: filesystem entries, vaults, keys, cache index and
//! sync events. Mirrors the relational rows the metadata store persists.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Inode = u64;
pub type EntryId = i64;
pub type VaultId = i64;

pub const ROOT_INODE: Inode = 1;
pub const ROOT_ENTRY_ID: EntryId = 1;

/// Current epoch seconds, used for mtime/atime bookkeeping.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// A random, URL-safe Base32 identifier assigned once per Entry; used as
/// the physical object key on disk and in S3, decoupling kernel paths
/// from physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Alias(pub String);

impl Alias {
    pub fn generate() -> Alias {
        use rand::RngCore;
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Alias(base32_encode(&bytes))
    }
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits_in_buffer = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits_in_buffer += 8;
        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let idx = (buffer >> bits_in_buffer) & 0x1f;
            out.push(BASE32_ALPHABET[idx as usize] as char);
        }
    }
    if bits_in_buffer > 0 {
        let idx = (buffer << (5 - bits_in_buffer)) & 0x1f;
        out.push(BASE32_ALPHABET[idx as usize] as char);
    }
    out
}

/// The polymorphic filesystem node. Every file or directory is an Entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub alias: Alias,
    pub parent_id: Option<EntryId>,
    pub name: String,
    pub path: String,
    pub vault_id: Option<VaultId>,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub mode: u32,
    pub kind: EntryKind,
    pub created_by: Option<i64>,
    pub last_modified_by: Option<i64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Entry {
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ENTRY_ID
    }
}

/// File (extends Entry with payload attributes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub entry_id: EntryId,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,
    pub encryption_iv: Option<String>,
    pub encrypted_with_key_version: Option<i64>,
}

impl FileMeta {
    /// Invariant from the data model: a file in a vault with
    /// `encrypt_upstream` always carries a non-empty IV.
    pub fn check_encryption_invariant(&self, encrypt_upstream: bool) -> bool {
        if !encrypt_upstream {
            return true;
        }
        matches!(&self.encryption_iv, Some(iv) if !iv.is_empty())
            && self.encrypted_with_key_version.map_or(false, |v| v >= 0)
    }
}

/// Directory (extends Entry): aggregates over children.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DirStats {
    pub size_bytes: u64,
    pub file_count: u64,
    pub subdirectory_count: u64,
}

/// A tombstone row recording a removed entry pending physical deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashedFile {
    pub id: i64,
    pub vault_id: VaultId,
    pub alias: Alias,
    pub size_bytes: u64,
    pub trashed_by: Option<i64>,
    pub trashed_at: u64,
    pub backing_path: String,
    pub deleted_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultType {
    Local,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    Cache,
    Safe,
    MirrorKeepLocal,
    MirrorKeepRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    pub owner_id: i64,
    pub vault_type: VaultType,
    pub mount_point: String,
    pub quota_bytes: u64,
    pub is_active: bool,
    pub sync_policy: SyncPolicy,
    pub sync_enabled: bool,
    // S3 subtype fields; unused when vault_type == Local.
    pub api_key_id: Option<i64>,
    pub bucket: Option<String>,
    pub encrypt_upstream: bool,
}

impl Vault {
    pub fn is_unlimited_quota(&self) -> bool {
        self.quota_bytes == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum S3Provider {
    GenericS3,
    Aws,
    Minio,
}

/// S3 API key. The secret is stored only as ciphertext under the process
/// master key; `decrypted_secret` must be zeroed by the caller after use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub provider: S3Provider,
    pub access_key: String,
    pub region: String,
    pub endpoint: String,
    pub encrypted_secret_access_key: Vec<u8>,
    pub iv: String,
}

/// Per-vault data key, stored encrypted under the master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKey {
    pub vault_id: VaultId,
    pub version: i64,
    pub wrapped_key: Vec<u8>,
    pub wrap_iv: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashedVaultKey {
    pub vault_id: VaultId,
    pub version: i64,
    pub wrapped_key: Vec<u8>,
    pub wrap_iv: String,
    pub trashed_at: u64,
    pub rotation_completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntryType {
    File,
    Thumbnail,
}

/// A byte-resident copy of a logical file, participating in eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub id: i64,
    pub vault_id: VaultId,
    pub file_id: EntryId,
    pub path: String,
    pub entry_type: CacheEntryType,
    pub size: u64,
    pub last_accessed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    FuseRoot,
    VaultRoot,
    CacheRoot,
    ThumbnailRoot,
    FileCacheRoot,
    BackingRoot,
    BackingVaultRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Stalled,
    Error,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Stalled => "stalled",
            SyncStatus::Error => "error",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTrigger {
    Schedule,
    Manual,
    Startup,
    Webhook,
    Retry,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Schedule => "schedule",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Startup => "startup",
            SyncTrigger::Webhook => "webhook",
            SyncTrigger::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThroughputMetric {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputRecord {
    pub metric: ThroughputMetric,
    pub count: u64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictArtifact {
    pub side: ConflictSide,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub mtime: Option<u64>,
    pub iv: Option<String>,
    pub key_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictSide {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub path: String,
    pub reason_code: String,
    pub artifacts: Vec<ConflictArtifact>,
}

/// One execution of the sync engine for one vault at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: i64,
    pub vault_id: VaultId,
    pub run_uuid: String,
    pub status: SyncStatus,
    pub trigger: SyncTrigger,
    pub timestamp_begin: u64,
    pub timestamp_end: Option<u64>,
    pub heartbeat_at: u64,
    pub retry_attempt: u32,
    pub num_ops_total: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub local_state_hash: Option<String>,
    pub remote_state_hash: Option<String>,
    pub config_hash: Option<String>,
    pub stall_reason: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub throughputs: Vec<ThroughputRecord>,
    pub conflicts: Vec<SyncConflict>,
}

impl SyncEvent {
    /// Mirrors `Event::looksStalled`: no heartbeat observed within the
    /// stall window while the run is still marked running.
    pub fn looks_stalled(&self, now: u64, stall_window_secs: u64) -> bool {
        self.status == SyncStatus::Running && now.saturating_sub(self.heartbeat_at) > stall_window_secs
    }

    /// Mirrors `Event::computeDashboardStats`: aggregate byte/op counts
    /// across the recorded throughput buckets.
    pub fn total_failed_ops(&self) -> u64 {
        self.throughputs.iter().map(|t| t.failed).sum()
    }
}

/// Attributes reported to the kernel for a FUSE getattr/lookup reply.
#[derive(Debug, Clone, Copy)]
pub struct FileAttr {
    pub inode: Inode,
    pub size: u64,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}
