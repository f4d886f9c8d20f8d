//! Path model: translates between four coordinate systems (mount-relative,
//! vault-relative, backing-absolute, cache-absolute).
//!
//! Grounded on the four physical roots the original configures once
//! (`include/types/fs/Path.hpp`): the fuse mount root, the backing root,
//! the cache root under backing, and per-vault sub-roots derived by
//! appending the vault's path prefix.

use crate::types::{PathType, VaultId};
use std::collections::HashMap;
use std::path::{Path as StdPath, PathBuf};

#[derive(Debug, Clone)]
pub struct PathRoots {
    pub fuse_root: PathBuf,
    pub backing_root: PathBuf,
    pub cache_root: PathBuf,
    pub thumbnail_root: PathBuf,
    pub file_cache_root: PathBuf,
    /// vault_id -> backing-relative mount point, e.g. "vaults/42"
    vault_mount_points: HashMap<VaultId, String>,
}

impl PathRoots {
    pub fn new(fuse_root: PathBuf, backing_root: PathBuf) -> PathRoots {
        let cache_root = backing_root.join(".cache");
        let file_cache_root = cache_root.join("files");
        let thumbnail_root = cache_root.join("thumbnails");
        PathRoots {
            fuse_root,
            backing_root,
            cache_root,
            thumbnail_root,
            file_cache_root,
            vault_mount_points: HashMap::new(),
        }
    }

    pub fn register_vault(&mut self, vault_id: VaultId, mount_point: &str) {
        self.vault_mount_points
            .insert(vault_id, normalize_relative(mount_point));
    }

    fn base_for(&self, path_type: PathType, vault_id: Option<VaultId>) -> Option<PathBuf> {
        match path_type {
            PathType::FuseRoot => Some(self.fuse_root.clone()),
            PathType::BackingRoot => Some(self.backing_root.clone()),
            PathType::CacheRoot => Some(self.cache_root.clone()),
            PathType::ThumbnailRoot => Some(self.thumbnail_root.clone()),
            PathType::FileCacheRoot => Some(self.file_cache_root.clone()),
            PathType::VaultRoot | PathType::BackingVaultRoot => {
                let vault_id = vault_id?;
                let prefix = self.vault_mount_points.get(&vault_id)?;
                let base = if path_type == PathType::VaultRoot {
                    &self.fuse_root
                } else {
                    &self.backing_root
                };
                Some(base.join(prefix))
            }
        }
    }

    /// Joins `relative` under the base path for `path_type`. The
    /// synthetic root "/" maps to the base path itself without
    /// appending. Leading slashes are stripped; `..` components are
    /// dropped lexically so traversal never escapes the root.
    pub fn abs(&self, relative: &str, path_type: PathType, vault_id: Option<VaultId>) -> Option<PathBuf> {
        let base = self.base_for(path_type, vault_id)?;
        let rel = normalize_relative(relative);
        if rel.is_empty() {
            return Some(base);
        }
        Some(base.join(rel))
    }

    /// Strips the base path for `path_type` off `absolute`. If
    /// `absolute` does not lie under the named root, falls back to
    /// using only the filename component (defensive coding against
    /// escape attempts).
    pub fn rel(&self, absolute: &StdPath, path_type: PathType, vault_id: Option<VaultId>) -> Option<String> {
        let base = self.base_for(path_type, vault_id)?;
        let rel = match absolute.strip_prefix(&base) {
            Ok(stripped) => stripped.to_string_lossy().to_string(),
            Err(_) => absolute
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        Some(normalize_relative(&rel))
    }

    /// Converts a path expressed relative to `from`'s root into one
    /// relative to `to`'s root, by round-tripping through an absolute
    /// path and re-deriving the relative form.
    pub fn translate(
        &self,
        relative: &str,
        from: PathType,
        to: PathType,
        vault_id: Option<VaultId>,
    ) -> Option<String> {
        let absolute = self.abs(relative, from, vault_id)?;
        self.rel(&absolute, to, vault_id)
    }
}

/// Lexical normalization: strips leading slashes, collapses `.`
/// components, and drops any `..` component instead of walking up (a
/// path starting with `..` is treated as relative to the nearest root,
/// never escaping it).
pub fn normalize_relative(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in input.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                // Dropped, not popped: escape attempts never walk above
                // the configured root.
                continue;
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

pub fn join(parent: &str, name: &str) -> String {
    let parent = normalize_relative(parent);
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn parent_and_name(path: &str) -> (String, String) {
    let normalized = normalize_relative(path);
    match normalized.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), normalized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> PathRoots {
        let mut roots = PathRoots::new(PathBuf::from("/mnt/v"), PathBuf::from("/var/backing"));
        roots.register_vault(1, "vaults/1");
        roots
    }

    #[test]
    fn root_maps_to_base_without_appending() {
        let roots = roots();
        let p = roots.abs("/", PathType::BackingRoot, None).unwrap();
        assert_eq!(p, PathBuf::from("/var/backing"));
    }

    #[test]
    fn rel_then_abs_round_trips_for_normal_paths() {
        let roots = roots();
        let abs = roots.abs("docs/a.txt", PathType::VaultRoot, Some(1)).unwrap();
        let rel = roots.rel(&abs, PathType::VaultRoot, Some(1)).unwrap();
        assert_eq!(rel, "docs/a.txt");
    }

    #[test]
    fn traversal_components_are_dropped_not_escaped() {
        assert_eq!(normalize_relative("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_relative("/a/../b"), "a/b");
    }

    #[test]
    fn escape_attempt_falls_back_to_filename() {
        let roots = roots();
        let outside = PathBuf::from("/etc/passwd");
        let rel = roots.rel(&outside, PathType::VaultRoot, Some(1)).unwrap();
        assert_eq!(rel, "passwd");
    }

    #[test]
    fn translate_moves_between_coordinate_systems() {
        let roots = roots();
        let cache_rel = roots
            .translate("docs/a.txt", PathType::VaultRoot, PathType::BackingVaultRoot, Some(1))
            .unwrap();
        assert_eq!(cache_rel, "docs/a.txt");
    }
}
