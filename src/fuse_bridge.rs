//! FUSE bridge: kernel low-level op dispatch. Each kernel request is
//! enqueued onto a worker pool sized to hardware parallelism; the
//! dedicated FUSE receive thread (owned by `fuser`'s own session loop)
//! blocks on pool completion per request, per §5's "no single event
//! loop, FUSE receive blocks on a dedicated thread" model.
//!
//! Grounded on the teacher's `fuse.rs` stub (which targeted `fuse_mt`
//! rather than `fuser`; rewritten here against `fuser`'s low-level
//! `Filesystem` trait) and on the translation contract in the
//! filesystem-mediation component design.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr as FuserFileAttr, FileType as FuserFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request,
};
use log::{debug, warn};

use crate::db::queries;
use crate::fsops::FsOps;
use crate::manager::StorageManager;
use crate::registry::EntryRegistry;
use crate::types::{Entry, EntryKind, Inode, VaultId, ROOT_ENTRY_ID, ROOT_INODE};

const ENTRY_TTL: Duration = Duration::from_secs(60);
const FUSE_ROOT_VAULT: VaultId = 0;

fn entry_kind_to_fuser(kind: EntryKind) -> FuserFileType {
    match kind {
        EntryKind::File => FuserFileType::RegularFile,
        EntryKind::Directory => FuserFileType::Directory,
    }
}

fn entry_to_attr(entry: &Entry, inode: Inode, size: u64) -> FuserFileAttr {
    let mtime = UNIX_EPOCH + Duration::from_secs(entry.updated_at);
    let ctime = mtime;
    let atime = mtime;
    FuserFileAttr {
        ino: inode,
        size,
        blocks: size.div_ceil(512),
        atime,
        mtime,
        ctime,
        crtime: mtime,
        kind: entry_kind_to_fuser(entry.kind),
        perm: entry.mode as u16,
        nlink: 1,
        uid: entry.owner_uid,
        gid: entry.group_gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno_reply<T>(err: crate::error::VaultError) -> Result<T, i32> {
    Err(err.to_errno())
}

pub struct VaultFilesystem {
    ops: Arc<FsOps>,
    worker_pool: crate::workerpool::WorkerPool,
}

impl VaultFilesystem {
    pub fn new(ops: Arc<FsOps>, worker_pool: crate::workerpool::WorkerPool) -> VaultFilesystem {
        VaultFilesystem { ops, worker_pool }
    }

    fn registry(&self) -> &EntryRegistry {
        self.ops.registry()
    }

    fn manager(&self) -> &StorageManager {
        self.ops.manager()
    }

    fn attr_for_entry(&self, entry: &Entry, inode: Inode) -> crate::error::VaultResult<FuserFileAttr> {
        let size = match entry.kind {
            EntryKind::File => self
                .ops
                .pool_with(|conn| queries::get_file_meta(conn, entry.id))
                .map(|m| m.size_bytes)
                .unwrap_or(0),
            EntryKind::Directory => 0,
        };
        Ok(entry_to_attr(entry, inode, size))
    }

    /// Resolves `parent`'s registered path, joins `name`, and looks the
    /// child up via the store if the registry has no cached entry.
    fn lookup_child(&self, parent: Inode, name: &str) -> crate::error::VaultResult<(Entry, Inode)> {
        let parent_entry = self
            .registry()
            .entry_for_inode(parent)
            .ok_or_else(|| crate::error::VaultError::NotFound(format!("inode {}", parent)))?;
        let child = self
            .ops
            .pool_with(|conn| queries::get_child(conn, parent_entry.id, name))?
            .ok_or_else(|| crate::error::VaultError::NotFound(name.to_string()))?;
        let child_path = crate::path::join(&parent_entry.path, name);
        let inode = self.registry().assign_inode(&child_path, child.clone());
        Ok((child, inode))
    }
}

impl Filesystem for VaultFilesystem {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy().to_string();
        let result = self.worker_pool.block_on(|| self.lookup_child(parent, &name));
        match result {
            Ok((entry, inode)) => match self.attr_for_entry(&entry, inode) {
                Ok(attr) => {
                    self.registry().increment_lookup(inode, 1);
                    reply.entry(&ENTRY_TTL, &attr, 0);
                }
                Err(err) => reply.error(err.to_errno()),
            },
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.registry().decrement_inode_ref(ino, nlookup, false);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.registry().entry_for_inode(ino) {
            Some(entry) => match self.attr_for_entry(&entry, ino) {
                Ok(attr) => reply.attr(&ENTRY_TTL, &attr),
                Err(err) => reply.error(err.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // truncate/chmod/chown/utimens all funnel through here per
        // fuser's combined setattr; atime/mtime are surfaced as
        // `updated_at` already bumped by the metadata update below, so
        // no separate column tracks them.
        let entry = match self.registry().entry_for_inode(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if mode.is_none() && uid.is_none() && gid.is_none() && size.is_none() {
            match self.attr_for_entry(&entry, ino) {
                Ok(attr) => reply.attr(&ENTRY_TTL, &attr),
                Err(err) => reply.error(err.to_errno()),
            }
            return;
        }
        let vault_id = match entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let result = self
            .worker_pool
            .block_on(|| self.ops.set_attrs(vault_id, &entry.path, mode, uid, gid, size));
        match result {
            Ok(updated) => {
                self.registry().update_entry(updated.clone());
                match self.attr_for_entry(&updated, ino) {
                    Ok(attr) => reply.attr(&ENTRY_TTL, &attr),
                    Err(err) => reply.error(err.to_errno()),
                }
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        if offset > 0 {
            // Single-pass buffer fill; does not page across offset, a
            // known limitation for very large directories (see
            // DESIGN.md's Open Question #3).
            reply.ok();
            return;
        }
        let dir_entry_id = if ino == ROOT_INODE {
            ROOT_ENTRY_ID
        } else {
            match self.registry().entry_for_inode(ino) {
                Some(e) => e.id,
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            }
        };
        let parent_id = self.registry().parent_id_of(dir_entry_id).unwrap_or(ROOT_ENTRY_ID);

        let mut idx = 0i64;
        let _ = reply.add(ino, idx, fuser::FileType::Directory, ".");
        idx += 1;
        if ino != ROOT_INODE {
            let _ = reply.add(parent_id as u64, idx, fuser::FileType::Directory, "..");
            idx += 1;
        }

        let children = self.worker_pool.block_on(|| self.manager().list_dir(dir_entry_id));
        match children {
            Ok(children) => {
                for child in children {
                    let child_path = crate::path::join(
                        &self.registry().entry_for_id(dir_entry_id).map(|e| e.path).unwrap_or_default(),
                        &child.name,
                    );
                    let child_inode = self.registry().assign_inode(&child_path, child.clone());
                    let full = reply.add(child_inode, idx, entry_kind_to_fuser(child.kind), &child.name);
                    idx += 1;
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let entry = match self.registry().entry_for_inode(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let result = self.worker_pool.block_on(|| {
            let engine = self.manager().engine_for(vault_id)?;
            engine.read_file(&entry.path)
        });
        match result {
            Ok(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let end = (start + size as usize).min(bytes.len());
                reply.data(&bytes[start..end]);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        // Buffered at the FUSE layer is not modeled here; writes go
        // straight to the engine, which encrypts+persists on release in
        // the original design. For simplicity and to keep the on-disk
        // state always consistent between calls, every write
        // read-modify-writes the full object immediately.
        let entry = match self.registry().entry_for_inode(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let offset = offset as usize;
        let data = data.to_vec();
        let result = self.worker_pool.block_on(|| {
            let engine = self.manager().engine_for(vault_id)?;
            let mut existing = engine.read_file(&entry.path).unwrap_or_default();
            let new_len = offset + data.len();
            if existing.len() < new_len {
                self.ops.check_quota(vault_id, (new_len - existing.len()) as u64)?;
                existing.resize(new_len, 0);
            }
            existing[offset..offset + data.len()].copy_from_slice(&data);
            let meta = engine.write_file(&entry.path, &existing)?;
            self.ops.pool().transaction(|txn| {
                let mut meta = meta.clone();
                meta.entry_id = entry.id;
                queries::update_file_meta_propagating(txn, &meta)
            })?;
            Ok::<_, crate::error::VaultError>(data.len())
        });
        match result {
            Ok(written) => {
                if let Ok(refreshed) = self.ops.pool_with(|conn| queries::get_entry_by_id(conn, entry.id)) {
                    self.registry().update_entry(refreshed);
                }
                reply.written(written as u32)
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy().to_string();
        let parent_entry = match self.registry().entry_for_inode(parent) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match parent_entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let uid = req.uid();
        let gid = req.gid();
        let result = self
            .worker_pool
            .block_on(|| self.ops.create_file(vault_id, parent_entry.id, &name, uid, gid, mode, None));
        match result {
            Ok(entry) => {
                let child_path = crate::path::join(&parent_entry.path, &entry.name);
                let inode = self.registry().assign_inode(&child_path, entry.clone());
                match self.attr_for_entry(&entry, inode) {
                    Ok(attr) => reply.created(&ENTRY_TTL, &attr, 0, 0, 0),
                    Err(err) => reply.error(err.to_errno()),
                }
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = name.to_string_lossy().to_string();
        let parent_entry = match self.registry().entry_for_inode(parent) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match parent_entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let uid = req.uid();
        let gid = req.gid();
        let result = self
            .worker_pool
            .block_on(|| self.ops.mkdir(vault_id, parent_entry.id, &name, uid, gid, mode, None));
        match result {
            Ok(entry) => {
                let child_path = crate::path::join(&parent_entry.path, &entry.name);
                let inode = self.registry().assign_inode(&child_path, entry.clone());
                match self.attr_for_entry(&entry, inode) {
                    Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
                    Err(err) => reply.error(err.to_errno()),
                }
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_common(parent, name, reply)
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_common(parent, name, reply)
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().to_string();
        let newname = newname.to_string_lossy().to_string();
        let parent_entry = match self.registry().entry_for_inode(parent) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let new_parent_entry = match self.registry().entry_for_inode(newparent) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match parent_entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let from_rel = crate::path::join(&parent_entry.path, &name);
        let to_rel = crate::path::join(&new_parent_entry.path, &newname);
        let result = self
            .worker_pool
            .block_on(|| self.ops.rename(vault_id, &from_rel, &to_rel, new_parent_entry.id));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Advisory only; real permission checks are layered on top in
        // the non-core permission module.
        if self.registry().entry_for_inode(ino).is_some() || ino == ROOT_INODE {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let vault_id = self
            .registry()
            .entry_for_inode(ino)
            .and_then(|e| e.vault_id)
            .unwrap_or(FUSE_ROOT_VAULT);
        let result = self.worker_pool.block_on(|| {
            if vault_id == FUSE_ROOT_VAULT {
                return Ok::<_, crate::error::VaultError>((0u64, 0u64));
            }
            let engine = self.manager().engine_for(vault_id)?;
            Ok((engine.vault_size()?, engine.free_space()?))
        });
        match result {
            Ok((used, free)) => {
                let block_size = 4096u32;
                let total_blocks = (used + free) / block_size as u64;
                let free_blocks = free / block_size as u64;
                reply.statfs(total_blocks, free_blocks, free_blocks, 0, 0, block_size, 255, block_size);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }
}

impl VaultFilesystem {
    fn remove_common(&self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().to_string();
        let parent_entry = match self.registry().entry_for_inode(parent) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let vault_id = match parent_entry.vault_id {
            Some(v) => v,
            None => {
                reply.error(libc::EACCES);
                return;
            }
        };
        let rel_path = crate::path::join(&parent_entry.path, &name);
        let result = self.worker_pool.block_on(|| self.ops.remove(vault_id, &rel_path, None));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => {
                warn!(target: crate::logging::TARGET_FUSE, "remove {} failed: {}", rel_path, err);
                reply.error(err.to_errno())
            }
        }
    }
}

pub fn mount(
    ops: Arc<FsOps>,
    worker_pool: crate::workerpool::WorkerPool,
    mountpoint: &str,
    allow_other: bool,
) -> crate::error::VaultResult<()> {
    let fs = VaultFilesystem::new(ops, worker_pool);
    let mut options = vec![fuser::MountOption::FSName("vaulthalla".to_string())];
    if allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    debug!(target: crate::logging::TARGET_FUSE, "mounting at {}", mountpoint);
    fuser::mount2(fs, mountpoint, &options).map_err(Into::into)
}
