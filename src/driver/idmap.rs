//! Ownership remapping and diff rotation.
//!
//! Changing a layer's ID mapping cannot rewrite a populated upper in place:
//! a previously computed diff of that upper must stay byte-stable. Instead
//! the current `diff` is rotated aside (`diff` -> `diff1`, `diff1` ->
//! `diff2`, ...) after the tree-wide chown, and a fresh upper is created
//! for subsequent writes. The rotated directories keep participating in
//! mounts as extra lowers.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use super::layout::{name_with_suffix, DEFAULT_PERMS};
use super::options::MountOpts;
use super::{mkdir_as, Driver};
use crate::error::{LayerStoreError, Result};
use crate::idmap::{root_uid_gid, IdMappings};

impl Driver {
    /// Rewrites ownership across the layer from `to_container`'s view to
    /// `to_host`'s view, then rotates the diff directories so the remapped
    /// history is preserved and a fresh upper receives future writes.
    pub fn update_layer_id_map(
        &self,
        id: &str,
        to_container: Option<&IdMappings>,
        to_host: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<()> {
        let _lock = self.locker.lock(id);

        let dir = self.layout.dir(id);

        // The rotated work and upper directories belong to host root unless
        // the target mapping says otherwise.
        let owner = match to_host {
            Some(mappings) if !mappings.is_empty() => {
                Some(root_uid_gid(&mappings.uid_maps, &mappings.gid_maps)?)
            }
            _ => Some((0, 0)),
        };

        // Mount with shifting disabled so the walk sees raw on-disk ids.
        let options = MountOpts {
            mount_label: mount_label.to_string(),
            options: self
                .options
                .mount_options
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        };
        let layer_fs = self.get_locked(id, true, options)?;

        if let Err(err) = self
            .chown
            .chown_path_by_maps(&layer_fs, to_container, to_host)
        {
            if let Err(e) = self.put_locked(id) {
                tracing::error!("{}; error unmounting {}: {}", err, id, e);
            }
            return Err(err);
        }
        self.put_locked(id)?;

        rotate_and_recreate(&dir, self.options.force_mask, owner)
    }

    /// Whether ID shifting can be delegated at mount time. Only the mount
    /// helper can shift; the kernel backend cannot.
    pub fn supports_shifting(&self) -> bool {
        if std::env::var("LAYERSTORE_TEST_FORCE_SUPPORT_SHIFTING").as_deref() == Ok("yes-please") {
            return true;
        }
        self.options.mount_program.is_some()
    }
}

/// Rotates `diff` and every `diffN` one slot up, renaming in descending
/// order so an interruption never leaves a gap, then recreates `work` (its
/// overlay index may reference the old upper) and an empty `diff` with the
/// preserved permissions.
pub(crate) fn rotate_and_recreate(
    dir: &Path,
    force_mask: Option<u32>,
    owner: Option<(u32, u32)>,
) -> Result<()> {
    let diff_dir = dir.join("diff");

    let mut perms = DEFAULT_PERMS;
    match force_mask {
        Some(mask) => perms = mask,
        None => {
            if let Ok(st) = fs::metadata(&diff_dir) {
                perms = st.mode() & 0o7777;
            }
        }
    }

    let mut highest = 0;
    while dir
        .join(name_with_suffix("diff", highest))
        .symlink_metadata()
        .is_ok()
    {
        highest += 1;
    }
    while highest > 0 {
        let from = dir.join(name_with_suffix("diff", highest - 1));
        let to = dir.join(name_with_suffix("diff", highest));
        fs::rename(&from, &to).map_err(|e| LayerStoreError::path_ctx(from, e))?;
        highest -= 1;
    }

    let work_dir = dir.join("work");
    if fs::remove_dir_all(&work_dir).is_ok() {
        mkdir_as(&work_dir, DEFAULT_PERMS, owner)
            .map_err(|e| LayerStoreError::path_ctx(work_dir, e))?;
    }

    mkdir_as(&diff_dir, perms, owner).map_err(|e| LayerStoreError::path_ctx(diff_dir, e))?;
    Ok(())
}
