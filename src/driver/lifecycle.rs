//! Layer creation and removal.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use super::layout::{DEFAULT_PERMS, LINK_DIR, LOWER_FILE};
use super::links::read_link_id;
use super::options::{parse_storage_opt, CreateOpts};
use super::{mkdir_all_as, mkdir_as, write_file_with_mode, Driver};
use crate::error::{LayerStoreError, Result};
use crate::idmap::root_uid_gid;
use crate::quota::Quota;

impl Driver {
    /// Creates a read-only layer. A per-layer `size` is rejected here; only
    /// writable container layers carry quotas.
    pub fn create(&self, id: &str, parent: &str, opts: Option<&CreateOpts>) -> Result<()> {
        if let Some(opts) = opts {
            if opts.storage_opt.contains_key("size") {
                return Err(LayerStoreError::SizeOnReadOnlyLayer);
            }
        }
        self.create_impl(id, parent, opts.cloned())
    }

    /// Creates a writable layer for use as a container filesystem, applying
    /// the configured default quota unless the caller overrides it.
    pub fn create_read_write(
        &self,
        id: &str,
        parent: &str,
        opts: Option<&CreateOpts>,
    ) -> Result<()> {
        if let Some(opts) = opts {
            if !opts.storage_opt.is_empty() && !self.project_quota_supported {
                return Err(LayerStoreError::QuotaUnsupported(self.backing_fs.clone()));
            }
        }

        let mut opts = opts.cloned().unwrap_or_default();
        opts.storage_opt
            .entry("size".to_string())
            .or_insert_with(|| self.options.quota_size.to_string());
        self.create_impl(id, parent, Some(opts))
    }

    /// Creates a layer that will receive the same content as `template`.
    /// The content copy itself happens upstream; the driver only shapes the
    /// on-disk layer.
    #[allow(clippy::too_many_arguments)]
    pub fn create_from_template(
        &self,
        id: &str,
        _template: &str,
        _template_mappings: Option<&crate::idmap::IdMappings>,
        parent: &str,
        _parent_mappings: Option<&crate::idmap::IdMappings>,
        opts: Option<&CreateOpts>,
        read_write: bool,
    ) -> Result<()> {
        if read_write {
            self.create_read_write(id, parent, opts)
        } else {
            self.create(id, parent, opts)
        }
    }

    fn create_impl(&self, id: &str, parent: &str, opts: Option<CreateOpts>) -> Result<()> {
        let dir = self.layout.dir(id);

        let mut owner = match opts.as_ref().and_then(|o| o.mappings.as_ref()) {
            Some(mappings) if !mappings.is_empty() => {
                Some(root_uid_gid(&mappings.uid_maps, &mappings.gid_maps)?)
            }
            _ => self.root_pair(),
        };

        mkdir_all_as(&self.layout.link_dir(), 0o700, owner)?;
        if let Some(parent_dir) = dir.parent() {
            mkdir_all_as(parent_dir, 0o700, owner)?;
        }
        if !parent.is_empty() {
            let parent_dir = self.layout.dir(parent);
            let st = fs::metadata(&parent_dir)
                .map_err(|e| LayerStoreError::path_ctx(&parent_dir, e))?;
            owner = Some((st.uid(), st.gid()));
        }
        mkdir_as(&dir, 0o700, owner).map_err(|e| LayerStoreError::path_ctx(&dir, e))?;

        if let Err(err) = self.populate_layer(&dir, id, parent, opts.as_ref(), owner) {
            let _ = fs::remove_dir_all(&dir);
            return Err(err);
        }
        Ok(())
    }

    fn populate_layer(
        &self,
        dir: &Path,
        id: &str,
        parent: &str,
        opts: Option<&CreateOpts>,
        owner: Option<(u32, u32)>,
    ) -> Result<()> {
        if let Some(opts) = opts {
            if !opts.storage_opt.is_empty() {
                let size = parse_storage_opt(&opts.storage_opt)?;
                if size > 0 {
                    match &self.quota {
                        Some(quota_ctl) => quota_ctl.set_quota(dir, Quota { size })?,
                        None => {
                            return Err(LayerStoreError::QuotaUnsupported(
                                self.backing_fs.clone(),
                            ))
                        }
                    }
                }
            }
        }

        let mut perms = DEFAULT_PERMS;
        if let Some(mask) = self.options.force_mask {
            perms = mask;
        }
        if !parent.is_empty() {
            // The new upper inherits the permissions of the parent's.
            let parent_diff = self.layout.diff_dir(parent);
            let st = fs::metadata(&parent_diff)
                .map_err(|e| LayerStoreError::path_ctx(&parent_diff, e))?;
            perms = st.mode() & 0o7777;
        }

        mkdir_as(&dir.join("diff"), perms, owner)
            .map_err(|e| LayerStoreError::path_ctx(dir.join("diff"), e))?;

        self.assign_link(id, dir)?;

        mkdir_as(&dir.join("work"), 0o700, owner)
            .map_err(|e| LayerStoreError::path_ctx(dir.join("work"), e))?;
        mkdir_as(&dir.join("merged"), 0o700, owner)
            .map_err(|e| LayerStoreError::path_ctx(dir.join("merged"), e))?;

        // Without a parent there is no "lower" file; a sentinel lower keeps
        // the kernel happy when the layer is mounted on its own.
        if parent.is_empty() {
            mkdir_as(&dir.join("empty"), 0o700, owner)
                .map_err(|e| LayerStoreError::path_ctx(dir.join("empty"), e))?;
            return Ok(());
        }

        let lower = self.get_lower(parent)?;
        if !lower.is_empty() {
            write_file_with_mode(&dir.join(LOWER_FILE), lower.as_bytes(), 0o666)?;
        }
        Ok(())
    }

    /// Removes a layer: farm symlink first (best effort), then the layer
    /// directory. Removing an absent layer is not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        let _lock = self.locker.lock(id);

        let dir = self.layout.dir(id);
        if let Ok(lid) = read_link_id(&dir) {
            let link_path = self.layout.home().join(LINK_DIR).join(lid);
            if let Err(e) = fs::remove_file(&link_path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!("Failed to remove link: {}", e);
                }
            }
        }

        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LayerStoreError::path_ctx(dir, e)),
        }
    }

    /// Whether a layer directory exists, in `home` or any additional image
    /// store.
    pub fn exists(&self, id: &str) -> bool {
        fs::metadata(self.layout.dir(id)).is_ok()
    }
}
