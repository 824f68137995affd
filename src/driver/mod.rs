//! The overlay layer-graph driver.
//!
//! Layers live under a persistent `home`; capability probe results live
//! under a volatile run home. Every layer directory holds its own upper
//! (`diff`), rotated prior uppers (`diff1`, `diff2`, ...), the kernel's
//! scratch dir (`work`), the mountpoint (`merged`), and the `link`/`lower`
//! bookkeeping files that let the stack be recomposed after a restart.

mod diff;
mod features;
mod fsmagic;
mod idmap;
mod layout;
mod lifecycle;
mod links;
mod lowers;
mod mount;
pub mod options;

pub use layout::MAX_DEPTH;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use nix::mount::{umount2, MntFlags, MsFlags};

use crate::archive::{NaiveDiffDriver, TarCodec};
use crate::error::{LayerStoreError, Result};
use crate::idmap::{root_uid_gid, ChownByMaps, IdMap};
use crate::locker::Locker;
use crate::quota::QuotaController;
use crate::refcount::{FsChecker, RefCounter};
use crate::usage::{directory_usage, DiskUsage};
use layout::{Layout, LINK_DIR};
use options::DriverOptions;

/// Configuration and collaborators handed to [`Driver::init`].
pub struct InitOptions {
    /// Volatile state root; the capability cache lives in a subdirectory
    /// named after `home`.
    pub run_root: PathBuf,
    /// Raw `key=value` driver options.
    pub driver_options: Vec<String>,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Tar codec producing and consuming layer archives.
    pub codec: Arc<dyn TarCodec>,
    /// Mount-and-compare diff fallback.
    pub naive: Arc<dyn NaiveDiffDriver>,
    /// Tree-wide ownership rewriter used by `update_layer_id_map`.
    pub chown: Arc<dyn ChownByMaps>,
    /// Project-quota controller for the backing filesystem, when one is
    /// available (xfs mounted with `pquota`).
    pub quota: Option<Arc<dyn QuotaController>>,
}

pub struct Driver {
    name: String,
    layout: Layout,
    run_home: PathBuf,
    uid_maps: Vec<IdMap>,
    gid_maps: Vec<IdMap>,
    root_pair: Option<(u32, u32)>,
    options: DriverOptions,
    backing_fs: String,
    supports_dtype: bool,
    using_metacopy: bool,
    project_quota_supported: bool,
    locker: Locker,
    ctr: RefCounter,
    naive_only: OnceLock<bool>,
    codec: Arc<dyn TarCodec>,
    naive: Arc<dyn NaiveDiffDriver>,
    chown: Arc<dyn ChownByMaps>,
    quota: Option<Arc<dyn QuotaController>>,
}

impl Driver {
    /// Initializes the driver over `home`, probing the environment. Fails
    /// when the backing filesystem or kernel cannot support overlay (and no
    /// mount helper is configured to take its place).
    pub fn init(home: &Path, options: InitOptions) -> Result<Driver> {
        let opts = DriverOptions::parse(&options.driver_options)?;

        let root_pair = if options.uid_maps.is_empty() && options.gid_maps.is_empty() {
            None
        } else {
            Some(root_uid_gid(&options.uid_maps, &options.gid_maps)?)
        };

        mkdir_all_as(&home.join(LINK_DIR), 0o700, root_pair)
            .map_err(|e| LayerStoreError::path_ctx(home.join(LINK_DIR), e))?;

        let fs_magic = fsmagic::get_fs_magic(home)?;
        let backing_fs = fsmagic::fs_name(fs_magic).unwrap_or("<unknown>").to_string();

        if opts.mount_program.is_none() {
            if opts.force_mask.is_some() {
                return Err(LayerStoreError::NotSupported(
                    "'force_mask' is supported only with 'mount_program'".to_string(),
                ));
            }
            if matches!(
                fs_magic,
                fsmagic::FS_MAGIC_AUFS
                    | fsmagic::FS_MAGIC_ZFS
                    | fsmagic::FS_MAGIC_OVERLAY
                    | fsmagic::FS_MAGIC_ECRYPTFS
            ) {
                return Err(LayerStoreError::IncompatibleFs {
                    backing_fs,
                    home: home.to_path_buf(),
                });
            }
        }

        let run_home = options
            .run_root
            .join(home.file_name().unwrap_or_else(|| OsStr::new("overlay")));
        mkdir_all_as(&run_home, 0o700, root_pair)
            .map_err(|e| LayerStoreError::path_ctx(&run_home, e))?;

        let mut supports_dtype = true;
        let mut using_metacopy = false;
        if opts.mount_program.is_none() {
            let feature = "overlay";
            match features::cached_feature_check(&run_home, feature) {
                Ok((result, text)) => {
                    if result {
                        tracing::debug!("cached value indicated that overlay is supported");
                    } else {
                        tracing::debug!("cached value indicated that overlay is not supported");
                        return Err(LayerStoreError::NotSupported(text));
                    }
                    supports_dtype = result;
                }
                Err(_) => {
                    match features::supports_overlay(home, &backing_fs, root_pair) {
                        Ok(dtype) => {
                            supports_dtype = dtype;
                            features::cached_feature_record(&run_home, feature, dtype, "")
                                .map_err(|e| LayerStoreError::path_ctx(&run_home, e))?;
                        }
                        Err(err) => {
                            let _ = fs::remove_dir(home.join(LINK_DIR));
                            let _ = fs::remove_dir(home);
                            if err.is_enospc() {
                                return Err(err);
                            }
                            let reason = err.to_string();
                            features::cached_feature_record(&run_home, feature, false, &reason)
                                .map_err(|e| LayerStoreError::path_ctx(&run_home, e))?;
                            return Err(err);
                        }
                    }
                }
            }

            let feature = format!("metacopy({})", opts.mount_options);
            match features::cached_feature_check(&run_home, &feature) {
                Ok((result, _)) => {
                    if result {
                        tracing::debug!("cached value indicated that metacopy is being used");
                    } else {
                        tracing::debug!("cached value indicated that metacopy is not being used");
                    }
                    using_metacopy = result;
                }
                Err(_) => {
                    using_metacopy = features::does_metacopy(home, &opts.mount_options)?;
                    if using_metacopy {
                        tracing::debug!("overlay test mount indicated that metacopy is being used");
                    } else {
                        tracing::debug!(
                            "overlay test mount indicated that metacopy is not being used"
                        );
                    }
                    features::cached_feature_record(&run_home, &feature, using_metacopy, "")
                        .map_err(|e| LayerStoreError::path_ctx(&run_home, e))?;
                }
            }
        }

        if !opts.skip_mount_home {
            make_private(home)?;
        }

        let checker_magic = if opts.mount_program.is_some() {
            fsmagic::FS_MAGIC_FUSE
        } else {
            fsmagic::FS_MAGIC_OVERLAY
        };

        let project_quota_supported = backing_fs == "xfs" && options.quota.is_some();
        if opts.quota_size > 0 && !project_quota_supported {
            return Err(LayerStoreError::QuotaUnsupported(backing_fs));
        }

        let driver = Driver {
            name: "overlay".to_string(),
            layout: Layout::new(home.to_path_buf(), "overlay", opts.image_stores.clone()),
            run_home,
            uid_maps: options.uid_maps,
            gid_maps: options.gid_maps,
            root_pair,
            options: opts,
            backing_fs,
            supports_dtype,
            using_metacopy,
            project_quota_supported,
            locker: Locker::new(),
            ctr: RefCounter::new(FsChecker::new(checker_magic)),
            naive_only: OnceLock::new(),
            codec: options.codec,
            naive: options.naive,
            chown: options.chown,
            quota: if project_quota_supported {
                options.quota
            } else {
                None
            },
        };

        tracing::debug!(
            "backingFs={}, projectQuotaSupported={}, useNativeDiff={}, usingMetacopy={}",
            driver.backing_fs,
            driver.project_quota_supported,
            !driver.use_naive_diff(),
            driver.using_metacopy
        );
        Ok(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-side owner for directories created on behalf of the mapped
    /// root, or `None` when no mappings are configured and the process's
    /// own identity applies.
    pub(crate) fn root_pair(&self) -> Option<(u32, u32)> {
        self.root_pair
    }

    pub fn status(&self) -> Vec<(String, String)> {
        vec![
            ("Backing Filesystem".to_string(), self.backing_fs.clone()),
            ("Supports d_type".to_string(), self.supports_dtype.to_string()),
            (
                "Native Overlay Diff".to_string(),
                (!self.use_naive_diff()).to_string(),
            ),
            ("Using metacopy".to_string(), self.using_metacopy.to_string()),
        ]
    }

    /// Paths a consumer needs to assemble or inspect the layer: work,
    /// merged, upper, and the resolved lower chain.
    pub fn metadata(&self, id: &str) -> Result<HashMap<String, String>> {
        let dir = self.layout.dir(id);
        fs::metadata(&dir).map_err(|e| LayerStoreError::path_ctx(&dir, e))?;

        let mut metadata = HashMap::new();
        metadata.insert(
            "WorkDir".to_string(),
            dir.join("work").display().to_string(),
        );
        metadata.insert(
            "MergedDir".to_string(),
            dir.join("merged").display().to_string(),
        );
        metadata.insert(
            "UpperDir".to_string(),
            dir.join("diff").display().to_string(),
        );

        let lower_dirs = self.get_lower_dirs(id)?;
        if !lower_dirs.is_empty() {
            metadata.insert(
                "LowerDir".to_string(),
                lower_dirs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            );
        }
        Ok(metadata)
    }

    /// Disk usage of the layer's writable directory.
    pub fn read_write_disk_usage(&self, id: &str) -> Result<DiskUsage> {
        directory_usage(&self.layout.diff_dir(id))
    }

    pub fn additional_image_stores(&self) -> &[PathBuf] {
        self.layout.image_stores()
    }

    /// Best-effort unmount of the driver home at shutdown.
    pub fn cleanup(&self) -> Result<()> {
        match umount2(self.layout.home(), MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(source) => Err(LayerStoreError::Unmount {
                target: self.layout.home().to_path_buf(),
                source,
            }),
        }
    }
}

/// Recursively turns `home` into a private mount, bind-mounting it onto
/// itself first when it is not already a mountpoint, so layer mounts do not
/// propagate to the host namespace.
fn make_private(path: &Path) -> Result<()> {
    if !is_mountpoint(path)? {
        nix::mount::mount(
            Some(path),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|source| LayerStoreError::Mount {
            target: path.to_path_buf(),
            source,
        })?;
    }
    nix::mount::mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|source| LayerStoreError::Mount {
        target: path.to_path_buf(),
        source,
    })
}

fn is_mountpoint(path: &Path) -> Result<bool> {
    let meta = fs::metadata(path).map_err(|e| LayerStoreError::path_ctx(path, e))?;
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(true),
    };
    let parent_meta = fs::metadata(parent).map_err(|e| LayerStoreError::path_ctx(parent, e))?;
    Ok(meta.dev() != parent_meta.dev())
}

/// mkdir with an explicit mode (not umask-masked) and, when a mapping is in
/// play, ownership by the mapped root.
pub(crate) fn mkdir_as(path: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    fs::DirBuilder::new().mode(mode).create(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    chown_new(path, owner)
}

pub(crate) fn mkdir_all_as(path: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && fs::symlink_metadata(parent).is_err() {
            mkdir_all_as(parent, mode, owner)?;
        }
    }
    match mkdir_as(path, mode, owner) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

fn chown_new(path: &Path, owner: Option<(u32, u32)>) -> io::Result<()> {
    use nix::unistd::{chown, Gid, Uid};
    let Some((uid, gid)) = owner else {
        return Ok(());
    };
    if uid == Uid::effective().as_raw() && gid == Gid::effective().as_raw() {
        return Ok(());
    }
    // Without CAP_CHOWN the call can only fail; ownership then follows the
    // process identity.
    if !Uid::effective().is_root() {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

pub(crate) fn write_file_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| LayerStoreError::path_ctx(path, e))?;
    file.write_all(contents)
        .map_err(|e| LayerStoreError::path_ctx(path, e))?;
    Ok(())
}
