//! In-memory inode↔path↔entry cache with lookup counts.
//!
//! Grounded on the teacher's decision (types.rs's `GenericVault`/`Vault`
//! trait operating purely on `Inode` handles) to keep engine lookups
//! id-keyed rather than back-pointer-based, generalized here into the
//! explicit arena described by the design notes: no parent↔child
//! cycles, a single readers-writer lock (`parking_lot::RwLock`) guarding
//! all maps, never held across calls into the storage engine.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{Entry, EntryId, Inode, ROOT_ENTRY_ID, ROOT_INODE};

#[derive(Debug, Clone)]
pub struct PendingRename {
    pub new_path: String,
}

#[derive(Default)]
struct RegistryState {
    inode_to_path: HashMap<Inode, String>,
    path_to_inode: HashMap<String, Inode>,
    inode_to_id: HashMap<Inode, EntryId>,
    id_to_entry: HashMap<EntryId, Entry>,
    id_to_inode: HashMap<EntryId, Inode>,
    child_id_to_parent_id: HashMap<EntryId, EntryId>,
    lookup_counts: HashMap<Inode, u64>,
    pending_renames: HashMap<Inode, PendingRename>,
    next_inode: Inode,
}

/// The entry/inode registry. Reads use the shared lock mode; structural
/// changes take the exclusive mode. The registry never calls into the
/// storage engine or the database while holding its lock.
pub struct EntryRegistry {
    state: RwLock<RegistryState>,
}

impl EntryRegistry {
    pub fn new() -> EntryRegistry {
        EntryRegistry {
            state: RwLock::new(RegistryState {
                next_inode: ROOT_INODE + 1,
                ..Default::default()
            }),
        }
    }

    pub fn seed_root(&self, root: Entry) {
        let mut state = self.state.write();
        state.inode_to_path.insert(ROOT_INODE, root.path.clone());
        state.path_to_inode.insert(root.path.clone(), ROOT_INODE);
        state.inode_to_id.insert(ROOT_INODE, ROOT_ENTRY_ID);
        state.id_to_inode.insert(ROOT_ENTRY_ID, ROOT_INODE);
        state.id_to_entry.insert(ROOT_ENTRY_ID, root);
        state.lookup_counts.insert(ROOT_INODE, 1);
    }

    /// The only way to produce an inode for `path`/`entry`. Double
    /// assignment for the same path returns the existing inode.
    pub fn assign_inode(&self, path: &str, entry: Entry) -> Inode {
        let mut state = self.state.write();
        if let Some(&inode) = state.path_to_inode.get(path) {
            *state.lookup_counts.entry(inode).or_insert(0) += 1;
            state.id_to_entry.insert(entry.id, entry);
            return inode;
        }
        let inode = state.next_inode;
        state.next_inode += 1;
        state.inode_to_path.insert(inode, path.to_string());
        state.path_to_inode.insert(path.to_string(), inode);
        state.inode_to_id.insert(inode, entry.id);
        state.id_to_inode.insert(entry.id, inode);
        if let Some(parent_id) = entry.parent_id {
            state.child_id_to_parent_id.insert(entry.id, parent_id);
        }
        state.id_to_entry.insert(entry.id, entry);
        state.lookup_counts.insert(inode, 1);
        inode
    }

    pub fn inode_for_path(&self, path: &str) -> Option<Inode> {
        self.state.read().path_to_inode.get(path).copied()
    }

    pub fn path_for_inode(&self, inode: Inode) -> Option<String> {
        self.state.read().inode_to_path.get(&inode).cloned()
    }

    pub fn entry_for_inode(&self, inode: Inode) -> Option<Entry> {
        let state = self.state.read();
        let id = state.inode_to_id.get(&inode)?;
        state.id_to_entry.get(id).cloned()
    }

    pub fn entry_for_id(&self, id: EntryId) -> Option<Entry> {
        self.state.read().id_to_entry.get(&id).cloned()
    }

    pub fn parent_id_of(&self, id: EntryId) -> Option<EntryId> {
        self.state.read().child_id_to_parent_id.get(&id).copied()
    }

    pub fn increment_lookup(&self, inode: Inode, n: u64) {
        let mut state = self.state.write();
        *state.lookup_counts.entry(inode).or_insert(0) += n;
    }

    /// Subtracts `n` from the reference counter; when it reaches zero
    /// and the entry is no longer reachable from its parent, the
    /// in-memory caches are dropped (the persisted row is untouched).
    pub fn decrement_inode_ref(&self, inode: Inode, n: u64, still_reachable: bool) {
        let mut state = self.state.write();
        let remaining = {
            let counter = state.lookup_counts.entry(inode).or_insert(0);
            *counter = counter.saturating_sub(n);
            *counter
        };
        if remaining == 0 && !still_reachable {
            Self::evict_inode_locked(&mut state, inode);
        }
    }

    /// Forcibly drops caches for a single path; callers evict an entire
    /// subtree by calling this for every descendant path (see
    /// `evict_subtree`).
    pub fn evict_path(&self, path: &str) {
        let mut state = self.state.write();
        if let Some(inode) = state.path_to_inode.get(path).copied() {
            Self::evict_inode_locked(&mut state, inode);
        }
    }

    pub fn evict_inode(&self, inode: Inode) {
        let mut state = self.state.write();
        Self::evict_inode_locked(&mut state, inode);
    }

    /// Evicts every cached path that starts with `path_prefix` — used on
    /// rename and remove for the whole affected subtree.
    pub fn evict_subtree(&self, path_prefix: &str) {
        let mut state = self.state.write();
        let prefix_with_slash = format!("{}/", path_prefix);
        let doomed: Vec<Inode> = state
            .path_to_inode
            .iter()
            .filter(|(path, _)| *path == path_prefix || path.starts_with(&prefix_with_slash))
            .map(|(_, inode)| *inode)
            .collect();
        for inode in doomed {
            Self::evict_inode_locked(&mut state, inode);
        }
    }

    fn evict_inode_locked(state: &mut RegistryState, inode: Inode) {
        if inode == ROOT_INODE {
            return;
        }
        if let Some(path) = state.inode_to_path.remove(&inode) {
            state.path_to_inode.remove(&path);
        }
        if let Some(id) = state.inode_to_id.remove(&inode) {
            state.id_to_entry.remove(&id);
            state.id_to_inode.remove(&id);
            state.child_id_to_parent_id.remove(&id);
        }
        state.lookup_counts.remove(&inode);
        state.pending_renames.remove(&inode);
    }

    /// Queues a logical (metadata-only) rename distinct from a physical
    /// byte copy, so the FUSE bridge can answer subsequent lookups with
    /// the new path before the engine has finished moving bytes.
    pub fn queue_pending_rename(&self, inode: Inode, new_path: String) {
        self.state.write().pending_renames.insert(inode, PendingRename { new_path });
    }

    pub fn take_pending_rename(&self, inode: Inode) -> Option<PendingRename> {
        self.state.write().pending_renames.remove(&inode)
    }

    pub fn lookup_count(&self, inode: Inode) -> u64 {
        self.state.read().lookup_counts.get(&inode).copied().unwrap_or(0)
    }

    /// Refreshes the cached Entry for an id already tracked by the
    /// registry, without touching its inode mapping — used after
    /// setattr/write mutations so a subsequent getattr sees fresh
    /// mode/uid/gid/size/updated_at instead of the value cached at
    /// lookup time.
    pub fn update_entry(&self, entry: Entry) {
        let mut state = self.state.write();
        if state.id_to_inode.contains_key(&entry.id) {
            state.id_to_entry.insert(entry.id, entry);
        }
    }
}

impl Default for EntryRegistry {
    fn default() -> EntryRegistry {
        EntryRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Alias, EntryKind};

    fn make_entry(id: EntryId, parent_id: Option<EntryId>, name: &str, path: &str) -> Entry {
        Entry {
            id,
            alias: Alias(format!("alias-{}", id)),
            parent_id,
            name: name.to_string(),
            path: path.to_string(),
            vault_id: Some(1),
            owner_uid: 0,
            group_gid: 0,
            mode: 0o644,
            kind: EntryKind::File,
            created_by: None,
            last_modified_by: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn double_assignment_for_same_path_returns_existing_inode() {
        let registry = EntryRegistry::new();
        let entry = make_entry(2, Some(ROOT_ENTRY_ID), "a.txt", "/a.txt");
        let first = registry.assign_inode("/a.txt", entry.clone());
        let second = registry.assign_inode("/a.txt", entry);
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_paths_get_distinct_inodes() {
        let registry = EntryRegistry::new();
        let a = registry.assign_inode("/a.txt", make_entry(2, Some(ROOT_ENTRY_ID), "a.txt", "/a.txt"));
        let b = registry.assign_inode("/b.txt", make_entry(3, Some(ROOT_ENTRY_ID), "b.txt", "/b.txt"));
        assert_ne!(a, b);
    }

    #[test]
    fn decrement_to_zero_evicts_when_unreachable() {
        let registry = EntryRegistry::new();
        let inode = registry.assign_inode("/a.txt", make_entry(2, Some(ROOT_ENTRY_ID), "a.txt", "/a.txt"));
        registry.decrement_inode_ref(inode, 1, false);
        assert!(registry.path_for_inode(inode).is_none());
    }

    #[test]
    fn decrement_to_zero_keeps_cache_if_still_reachable() {
        let registry = EntryRegistry::new();
        let inode = registry.assign_inode("/a.txt", make_entry(2, Some(ROOT_ENTRY_ID), "a.txt", "/a.txt"));
        registry.decrement_inode_ref(inode, 1, true);
        assert!(registry.path_for_inode(inode).is_some());
    }

    #[test]
    fn evict_subtree_drops_descendants_but_not_siblings() {
        let registry = EntryRegistry::new();
        let dir = registry.assign_inode("/a", make_entry(2, Some(ROOT_ENTRY_ID), "a", "/a"));
        let child = registry.assign_inode("/a/b.txt", make_entry(3, Some(2), "b.txt", "/a/b.txt"));
        let sibling = registry.assign_inode("/c.txt", make_entry(4, Some(ROOT_ENTRY_ID), "c.txt", "/c.txt"));
        registry.evict_subtree("/a");
        assert!(registry.path_for_inode(dir).is_none());
        assert!(registry.path_for_inode(child).is_none());
        assert!(registry.path_for_inode(sibling).is_some());
    }
}
