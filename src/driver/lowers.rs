//! Lower-chain resolution.
//!
//! A layer's `lower` file names its ancestor chain, uppermost first, as
//! paths relative to the driver home (normally farm links `l/<short>`). At
//! mount time the chain is expanded into absolute and relative lists: the
//! layer's own rotated `diffN` directories come first (newest rotation
//! first), then each ancestor followed by its own rotations. Entries whose
//! primary path is missing are looked up in the additional image stores,
//! and a missing farm symlink triggers a full rebuild before giving up.

use std::fs;
use std::path::{Path, PathBuf};

use super::layout::{clean_path, dumb_join, name_with_suffix, LINK_DIR, LOWER_FILE, MAX_DEPTH};
use super::links::read_link_id;
use super::Driver;
use crate::error::{LayerStoreError, Result};

pub(crate) struct ResolvedLowers {
    /// Absolute lower paths, uppermost first. Works with additional stores.
    pub abs: Vec<PathBuf>,
    /// The same lowers relative to the driver home, for the short mount
    /// data used when the absolute form exceeds a page.
    pub rel: Vec<String>,
    /// Mode of the first pre-existing upper contribution seen while
    /// scanning, used to recreate `diff` with its previous permissions.
    pub perms: Option<u32>,
}

impl Driver {
    /// Composes the `lower` file content for a layer whose parent is
    /// `parent`: the parent's own link followed by the parent's lowers.
    pub(crate) fn get_lower(&self, parent: &str) -> Result<String> {
        let parent_dir = self.layout.dir(parent);
        fs::symlink_metadata(&parent_dir)
            .map_err(|e| LayerStoreError::path_ctx(&parent_dir, e))?;

        let parent_link = read_link_id(&parent_dir)?;
        let mut lowers = vec![dumb_join(&[LINK_DIR, &parent_link])];

        if let Ok(parent_lower) = fs::read_to_string(parent_dir.join(LOWER_FILE)) {
            lowers.extend(parent_lower.split(':').map(str::to_string));
        }
        Ok(lowers.join(":"))
    }

    /// Resolves the `lower` entries of `id` back to the absolute `diff`
    /// directories they point at, via the farm symlinks.
    pub(crate) fn get_lower_dirs(&self, id: &str) -> Result<Vec<PathBuf>> {
        let lower_file = self.layout.lower_file(id);
        let lowers = match fs::read_to_string(&lower_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LayerStoreError::path_ctx(lower_file, e)),
        };

        let mut lower_dirs = Vec::new();
        for entry in lowers.split(':').filter(|s| !s.is_empty()) {
            let link_path = self.entry_path(entry);
            let target = fs::read_link(&link_path)
                .map_err(|e| LayerStoreError::path_ctx(&link_path, e))?;
            // The target is relative to the farm directory the symlink
            // lives in ("../<id>/diff").
            let base = link_path.parent().unwrap_or(Path::new("/"));
            lower_dirs.push(clean_path(&base.join(target)));
        }
        Ok(lower_dirs)
    }

    /// Resolves an entry of a `lower` file to an on-disk path: primary under
    /// home, else the first additional image store that has it.
    fn entry_path(&self, entry: &str) -> PathBuf {
        let primary = self.layout.home().join(entry);
        if fs::symlink_metadata(&primary).is_err() {
            for store in self.layout.image_stores() {
                let candidate = store.join(self.name()).join(entry);
                if fs::symlink_metadata(&candidate).is_ok() {
                    return candidate;
                }
            }
        }
        primary
    }

    /// Expands the full lower chain for mounting `id`.
    pub(crate) fn resolve_lowers(&self, id: &str) -> Result<ResolvedLowers> {
        let dir = self.layout.dir(id);

        let lowers = match fs::read_to_string(dir.join(LOWER_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(LayerStoreError::path_ctx(dir.join(LOWER_FILE), e)),
        };
        let split_lowers: Vec<&str> = if lowers.is_empty() {
            Vec::new()
        } else {
            lowers.split(':').collect()
        };
        if split_lowers.len() > MAX_DEPTH {
            return Err(LayerStoreError::DepthExceeded);
        }

        let link = read_link_id(&dir)?;

        let mut resolved = ResolvedLowers {
            abs: Vec::new(),
            rel: Vec::new(),
            perms: None,
        };
        fn note_perms(meta: &fs::Metadata, perms: &mut Option<u32>) {
            use std::os::unix::fs::MetadataExt;
            if perms.is_none() {
                *perms = Some(meta.mode() & 0o7777);
            }
        }

        // The layer's own rotated diffs stack in front of all ancestors,
        // newest rotation first. "diff" itself is the upper and is never in
        // these lists.
        for n in 1.. {
            let suffix = name_with_suffix("diff", n);
            let abs = dir.join(&suffix);
            match fs::metadata(&abs) {
                Ok(meta) => {
                    note_perms(&meta, &mut resolved.perms);
                    resolved.abs.push(abs);
                    resolved.rel.push(dumb_join(&[LINK_DIR, &link, "..", &suffix]));
                }
                Err(_) => break,
            }
        }

        for entry in split_lowers {
            if entry.is_empty() {
                continue;
            }
            let primary = self.layout.home().join(entry);
            let lower = match fs::metadata(&primary) {
                Ok(meta) => {
                    note_perms(&meta, &mut resolved.perms);
                    primary.clone()
                }
                Err(err) => {
                    let mut found = None;
                    for store in self.layout.image_stores() {
                        let candidate = store.join(self.name()).join(entry);
                        if let Ok(meta) = fs::metadata(&candidate) {
                            note_perms(&meta, &mut resolved.perms);
                            found = Some(candidate);
                            break;
                        }
                    }
                    match found {
                        Some(candidate) => candidate,
                        None if err.kind() == std::io::ErrorKind::NotFound => {
                            // A "not found" here means the farm symlinks were
                            // lost (typically a reboot wiping volatile
                            // storage). Rebuild the farm and keep going with
                            // the primary path.
                            tracing::warn!(
                                "Can't stat lower layer {} because it does not exist. Going through storage to recreate the missing symlinks.",
                                primary.display()
                            );
                            self.recreate_symlinks()?;
                            primary.clone()
                        }
                        None => {
                            return Err(LayerStoreError::path_ctx(primary, err));
                        }
                    }
                }
            };

            resolved.abs.push(lower.clone());
            resolved.rel.push(entry.to_string());

            // Rotated diffs of this ancestor ride along right behind it.
            // The ".." component resolves through the farm symlink back
            // into the ancestor's layer directory.
            for n in 1.. {
                let suffix = name_with_suffix("diff", n);
                let abs = lower.join("..").join(&suffix);
                if fs::metadata(&abs).is_err() {
                    break;
                }
                resolved.abs.push(abs);
                resolved.rel.push(dumb_join(&[entry, "..", &suffix]));
            }
        }

        // Overlay wants at least one lower; parent-less layers use their
        // "empty" sentinel.
        if resolved.abs.is_empty() {
            resolved.abs.push(dir.join("empty"));
            resolved.rel.push(dumb_join(&[id, "empty"]));
        }
        Ok(resolved)
    }
}
