//! Diff strategy selection and the diff/apply pipeline.
//!
//! Reading `diff/` directly ("native" diffing) is only correct when the
//! requested parent is the layer's direct lower ancestor and the kernel
//! configuration does not rewrite upper entries (metacopy, redirects).
//! Everything else goes through the naive mount-and-compare driver.

use std::io::Read;

use super::features;
use super::Driver;
use crate::archive::{ApplyDiffOpts, Change, FileGetter, PathFileGetter, TarOptions, WhiteoutFormat};
use crate::error::Result;
use crate::idmap::IdMappings;
use crate::usage::directory_size;

impl Driver {
    /// Latched process-wide decision: true when native diffing must not be
    /// used. Probed at most once, with the result cached in the run home.
    pub(crate) fn use_naive_diff(&self) -> bool {
        *self.naive_only.get_or_init(|| {
            if self.options.mount_program.is_some() {
                return true;
            }
            let feature = format!("native-diff({})", self.options.mount_options);
            if let Ok((result, text)) = features::cached_feature_check(&self.run_home, &feature) {
                if result {
                    tracing::debug!("cached value indicated that native-diff is usable");
                } else {
                    tracing::debug!("cached value indicated that native-diff is not being used");
                    tracing::info!("{}", text);
                }
                return !result;
            }

            let mut naive_only = false;
            let mut text = String::new();
            if let Err(err) =
                features::supports_native_diff(self.layout.home(), &self.options.mount_options)
            {
                text = format!(
                    "Not using native diff for overlay, this may cause degraded performance for building images: {}",
                    err
                );
                tracing::info!("{}", text);
                naive_only = true;
            }
            if let Err(err) =
                features::cached_feature_record(&self.run_home, &feature, !naive_only, &text)
            {
                tracing::warn!("Error recording native-diff status: {}", err);
            }
            naive_only
        })
    }

    /// True iff `parent` is the direct parent of `id`: the first entry of
    /// the layer's lower chain lives in the parent's directory. Parent-less
    /// layers match the empty parent id.
    pub fn is_parent(&self, id: &str, parent: &str) -> bool {
        let lowers = match self.get_lower_dirs(id) {
            Ok(lowers) => lowers,
            Err(_) => return false,
        };
        if parent.is_empty() {
            return lowers.is_empty();
        }
        match lowers.first().and_then(|l| l.parent()) {
            Some(first_lower_dir) => first_lower_dir == self.layout.dir(parent),
            None => false,
        }
    }

    pub(crate) fn whiteout_format(&self) -> WhiteoutFormat {
        if self.options.mount_program.is_some() {
            // A mount program means we are most likely running unprivileged
            // and cannot mknod character-device whiteouts.
            WhiteoutFormat::Aufs
        } else {
            WhiteoutFormat::Overlay
        }
    }

    /// Archive of the changes between `id` and `parent`, uncompressed, with
    /// whiteouts in the selected dialect.
    pub fn diff(
        &self,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<Box<dyn Read + Send>> {
        if self.use_naive_diff() || !self.is_parent(id, parent) {
            return self
                .naive
                .diff(self, id, mappings, parent, parent_mappings, mount_label);
        }

        let lower_dirs = self.get_lower_dirs(id)?;
        let diff_path = self.layout.diff_dir(id);
        tracing::debug!("Tar with options on {}", diff_path.display());
        self.codec.tar_with_options(
            &diff_path,
            &TarOptions {
                uid_maps: mappings.map(|m| m.uid_maps.clone()).unwrap_or_default(),
                gid_maps: mappings.map(|m| m.gid_maps.clone()).unwrap_or_default(),
                whiteout_format: Some(self.whiteout_format()),
                whiteout_data: lower_dirs,
                ..Default::default()
            },
        )
    }

    /// Byte size of the changes between `id` and `parent`.
    pub fn diff_size(
        &self,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<u64> {
        if self.use_naive_diff() || !self.is_parent(id, parent) {
            return self
                .naive
                .diff_size(self, id, mappings, parent, parent_mappings, mount_label);
        }
        directory_size(&self.layout.diff_dir(id))
    }

    /// Added/modified/deleted paths between `id` and `parent`.
    pub fn changes(
        &self,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<Vec<Change>> {
        if self.use_naive_diff() || !self.is_parent(id, parent) {
            return self
                .naive
                .changes(self, id, mappings, parent, parent_mappings, mount_label);
        }
        // There are no snapshots; changes are computed against the full
        // lower chain.
        let diff_path = self.layout.diff_dir(id);
        let layers = self.get_lower_dirs(id)?;
        self.codec.overlay_changes(&layers, &diff_path)
    }

    /// Extracts a tar stream into the layer's upper directory. Only valid
    /// as a fast path when `parent` is the direct parent; otherwise the
    /// naive driver materializes and applies.
    pub fn apply_diff(&self, id: &str, parent: &str, options: ApplyDiffOpts<'_>) -> Result<u64> {
        if !self.is_parent(id, parent) {
            let mut options = options;
            if self.options.ignore_chown_errors {
                options.ignore_chown_errors = true;
            }
            if let Some(mask) = self.options.force_mask {
                options.force_mask = Some(mask);
            }
            return self.naive.apply_diff(self, id, parent, options);
        }

        let apply_dir = self.layout.diff_dir(id);
        tracing::debug!("Applying tar in {}", apply_dir.display());
        let tar_options = TarOptions {
            uid_maps: options
                .mappings
                .map(|m| m.uid_maps.clone())
                .unwrap_or_default(),
            gid_maps: options
                .mappings
                .map(|m| m.gid_maps.clone())
                .unwrap_or_default(),
            ignore_chown_errors: self.options.ignore_chown_errors,
            force_mask: self.options.force_mask,
            whiteout_format: Some(self.whiteout_format()),
            whiteout_data: Vec::new(),
        };
        self.codec
            .untar_uncompressed(options.diff, &apply_dir, &tar_options)?;

        directory_size(&apply_dir)
    }

    /// Direct file access into the layer's diff directory, for tar-split
    /// style reassembly.
    pub fn diff_getter(&self, id: &str) -> Result<Box<dyn FileGetter>> {
        Ok(Box::new(PathFileGetter::new(self.layout.diff_dir(id))))
    }
}
