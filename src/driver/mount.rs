//! Mount composition and the get/put pair.
//!
//! Overlay mount data has to fit in one page. Absolute lower paths are used
//! first; when they overflow, the data is re-encoded against the short farm
//! links and the mount syscall is issued from a forked child whose working
//! directory is the driver home, so the relative paths resolve. A
//! configured mount helper replaces the kernel mount entirely and is handed
//! the composed data as its `-o` argument, with ID mappings appended unless
//! shifting is disabled for the call.

use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags, MsFlags};

use super::layout::{dumb_join, DEFAULT_PERMS, LOWER_FILE};
use super::lowers::ResolvedLowers;
use super::options::MountOpts;
use super::{mkdir_all_as, mkdir_as, Driver};
use crate::archive::LayerMounter;
use crate::error::{LayerStoreError, Result};
use crate::idmap::IdMap;

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Appends an SELinux context to overlay mount data.
pub(crate) fn format_mount_label(opts: &str, mount_label: &str) -> String {
    if mount_label.is_empty() {
        opts.to_string()
    } else if opts.is_empty() {
        format!("context=\"{}\"", mount_label)
    } else {
        format!("{},context=\"{}\"", opts, mount_label)
    }
}

/// Splits mount data into the flag bits the kernel wants out-of-band and
/// the remaining comma-joined option string.
pub(crate) fn parse_mount_options(data: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut rest = Vec::new();
    for option in data.split(',') {
        match option {
            "" | "rw" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "mand" => flags |= MsFlags::MS_MANDLOCK,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            other => rest.push(other),
        }
    }
    (flags, rest.join(","))
}

/// Runs mount(2) from a forked child chdir'd into `cwd`, so that relative
/// paths in the mount data resolve against the driver home. Only
/// async-signal-safe calls happen between fork and _exit.
pub(crate) fn mount_from(
    cwd: &Path,
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: &str,
) -> std::result::Result<(), Errno> {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::ForkResult;
    use std::ffi::CString;

    let cwd_c = CString::new(cwd.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let source_c = CString::new(source).map_err(|_| Errno::EINVAL)?;
    let target_c = CString::new(target.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let fstype_c = CString::new(fstype).map_err(|_| Errno::EINVAL)?;
    let data_c = CString::new(data).map_err(|_| Errno::EINVAL)?;

    match unsafe { nix::unistd::fork() }? {
        ForkResult::Child => unsafe {
            if libc::chdir(cwd_c.as_ptr()) != 0 {
                libc::_exit(*libc::__errno_location());
            }
            if libc::mount(
                source_c.as_ptr(),
                target_c.as_ptr(),
                fstype_c.as_ptr(),
                flags.bits(),
                data_c.as_ptr() as *const libc::c_void,
            ) != 0
            {
                libc::_exit(*libc::__errno_location());
            }
            libc::_exit(0)
        },
        ForkResult::Parent { child } => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => Ok(()),
            Ok(WaitStatus::Exited(_, code)) => Err(Errno::from_raw(code)),
            Ok(_) => Err(Errno::EIO),
            Err(e) => Err(e),
        },
    }
}

impl Driver {
    /// Mounts the layer stack for `id` and returns the merged directory.
    /// Concurrent calls for one id share a single mount.
    pub fn get(&self, id: &str, options: MountOpts) -> Result<PathBuf> {
        let _lock = self.locker.lock(id);
        self.get_locked(id, false, options)
    }

    pub(crate) fn get_locked(
        &self,
        id: &str,
        disable_shifting: bool,
        options: MountOpts,
    ) -> Result<PathBuf> {
        let dir = self.layout.dir(id);
        fs::metadata(&dir).map_err(|e| LayerStoreError::path_ctx(&dir, e))?;

        let read_write = !options.options.iter().any(|o| o == "ro");

        let resolved = self.resolve_lowers(id)?;
        let perms = self
            .options
            .force_mask
            .or(resolved.perms)
            .unwrap_or(DEFAULT_PERMS);

        // A user namespace needs the upper to exist with the right owner to
        // move entries from lower to upper.
        let diff_dir = dir.join("diff");
        mkdir_all_as(&diff_dir, perms, self.root_pair())?;

        let merged = dir.join("merged");
        match mkdir_as(&merged, 0o700, self.root_pair()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(LayerStoreError::path_ctx(&merged, e)),
        }

        if self.ctr.increment(&merged) > 1 {
            return Ok(merged);
        }

        if let Err(err) =
            self.mount_merged(id, &dir, &merged, &resolved, read_write, disable_shifting, &options)
        {
            // Restore refcount > 0 <=> mounted before surfacing the error.
            if self.ctr.decrement(&merged) <= 0 {
                if let Err(e) = umount2(&merged, MntFlags::empty()) {
                    tracing::error!("error unmounting {}: {}", merged.display(), e);
                }
            }
            return Err(err);
        }
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    fn mount_merged(
        &self,
        id: &str,
        dir: &Path,
        merged: &Path,
        resolved: &ResolvedLowers,
        read_write: bool,
        disable_shifting: bool,
        options: &MountOpts,
    ) -> Result<()> {
        let abs_joined = join_paths(&resolved.abs);
        let diff_dir = dir.join("diff");

        let mut opts = if read_write {
            format!(
                "lowerdir={},upperdir={},workdir={}",
                abs_joined,
                diff_dir.display(),
                dir.join("work").display()
            )
        } else {
            // Read-only: the layer's own diff becomes the topmost lower.
            format!("lowerdir={}:{}", diff_dir.display(), abs_joined)
        };
        if !options.options.is_empty() {
            opts = format!("{},{}", options.options.join(","), opts);
        } else if !self.options.mount_options.is_empty() {
            opts = format!("{},{}", self.options.mount_options, opts);
        }
        let mount_data = format_mount_label(&opts, &options.mount_label);

        if let Some(program) = &self.options.mount_program {
            let label = if disable_shifting {
                mount_data
            } else {
                self.opts_append_mappings(mount_data, &options.uid_maps, &options.gid_maps)
            };
            return self.mount_with_helper(program, &label, merged);
        }

        let page_size = page_size();
        if mount_data.len() > page_size {
            // Re-encode against the short farm links and mount from a child
            // process working in the driver home so the relative paths
            // resolve.
            let opts = if read_write {
                format!(
                    "lowerdir={},upperdir={},workdir={}",
                    resolved.rel.join(":"),
                    dumb_join(&[id, "diff"]),
                    dumb_join(&[id, "work"])
                )
            } else {
                format!("lowerdir={}", abs_joined)
            };
            let mount_data = format_mount_label(&opts, &options.mount_label);
            if mount_data.len() > page_size {
                return Err(LayerStoreError::MountLabelTooLarge(mount_data.len()));
            }
            let (flags, data) = parse_mount_options(&mount_data);
            tracing::debug!("overlay: mount_data={}", mount_data);
            let rel_target = PathBuf::from(dumb_join(&[id, "merged"]));
            return mount_from(
                self.layout.home(),
                "overlay",
                &rel_target,
                "overlay",
                flags,
                &data,
            )
            .map_err(|source| LayerStoreError::Mount {
                target: merged.to_path_buf(),
                source,
            });
        }

        let (flags, data) = parse_mount_options(&mount_data);
        tracing::debug!("overlay: mount_data={}", mount_data);
        nix::mount::mount(
            Some("overlay"),
            merged,
            Some("overlay"),
            flags,
            Some(data.as_str()),
        )
        .map_err(|source| LayerStoreError::Mount {
            target: merged.to_path_buf(),
            source,
        })
    }

    fn mount_with_helper(&self, program: &Path, label: &str, target: &Path) -> Result<()> {
        let output = Command::new(program)
            .arg("-o")
            .arg(label)
            .arg(target)
            .current_dir(self.layout.home())
            .output()
            .map_err(|e| LayerStoreError::path_ctx(program, e))?;
        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                stderr = "<stderr empty>".to_string();
            }
            return Err(LayerStoreError::MountProgram {
                program: program.to_path_buf(),
                stderr,
            });
        }
        Ok(())
    }

    /// Appends ID mappings to a helper label. A single identity range of
    /// size one collapses to the squash form the helpers understand.
    pub(crate) fn opts_append_mappings(
        &self,
        opts: String,
        uid_maps: &[IdMap],
        gid_maps: &[IdMap],
    ) -> String {
        let uid_maps = if uid_maps.is_empty() {
            &self.uid_maps
        } else {
            uid_maps
        };
        let gid_maps = if gid_maps.is_empty() {
            &self.gid_maps
        } else {
            gid_maps
        };
        if uid_maps.is_empty() && gid_maps.is_empty() {
            return opts;
        }
        format!(
            "{},{},{}",
            opts,
            format_mapping("uid", uid_maps),
            format_mapping("gid", gid_maps)
        )
    }

    /// Unmounts the layer's merged directory once the last reference is
    /// released.
    pub fn put(&self, id: &str) -> Result<()> {
        let _lock = self.locker.lock(id);
        self.put_locked(id)
    }

    pub(crate) fn put_locked(&self, id: &str) -> Result<()> {
        let dir = self.layout.dir(id);
        fs::metadata(&dir).map_err(|e| LayerStoreError::path_ctx(&dir, e))?;

        let mountpoint = dir.join("merged");
        if self.ctr.decrement(&mountpoint) > 0 {
            return Ok(());
        }
        match fs::read_to_string(dir.join(LOWER_FILE)) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LayerStoreError::path_ctx(dir.join(LOWER_FILE), e)),
        }

        let mut unmounted = false;
        if self.options.mount_program.is_some() {
            // FUSE mounts are detached with fusermount; fall back to a
            // syncfs so pending changes reach the filesystem even when the
            // unmount has to be lazy.
            for tool in ["fusermount3", "fusermount"] {
                match Command::new(tool).arg("-u").arg(&mountpoint).output() {
                    Ok(output) if output.status.success() => {
                        unmounted = true;
                        break;
                    }
                    Ok(output) => {
                        tracing::debug!(
                            "Error unmounting {} with {}: {}",
                            mountpoint.display(),
                            tool,
                            output.status
                        );
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::debug!(
                            "Error unmounting {} with {}: {}",
                            mountpoint.display(),
                            tool,
                            e
                        );
                    }
                }
            }
            if !unmounted {
                if let Ok(file) = fs::File::open(&mountpoint) {
                    if unsafe { libc::syncfs(file.as_raw_fd()) } != 0 {
                        tracing::debug!(
                            "Error syncing filesystem of {}: {}",
                            mountpoint.display(),
                            std::io::Error::last_os_error()
                        );
                    }
                }
            }
        }

        if !unmounted {
            if let Err(e) = umount2(&mountpoint, MntFlags::MNT_DETACH) {
                if e != Errno::EINVAL && e != Errno::ENOENT {
                    tracing::debug!(
                        "Failed to unmount {} overlay: {} - {}",
                        id,
                        mountpoint.display(),
                        e
                    );
                }
            }
        }

        if let Err(e) = fs::remove_dir(&mountpoint) {
            if e.kind() != ErrorKind::NotFound {
                tracing::debug!(
                    "Failed to remove mountpoint {} overlay: {} - {}",
                    id,
                    mountpoint.display(),
                    e
                );
            }
        }
        Ok(())
    }
}

impl LayerMounter for Driver {
    fn mount_layer(&self, id: &str, options: MountOpts) -> Result<PathBuf> {
        self.get(id, options)
    }

    fn unmount_layer(&self, id: &str) -> Result<()> {
        self.put(id)
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn format_mapping(kind: &str, maps: &[IdMap]) -> String {
    if maps.len() == 1 && maps[0].size == 1 {
        return format!("squash_to_{}={}", kind, maps[0].host_id);
    }
    let triples = maps
        .iter()
        .map(|m| format!("{}:{}:{}", m.container_id, m.host_id, m.size))
        .collect::<Vec<_>>()
        .join(":");
    format!("{}mapping={}", kind, triples)
}
