//! Capability probes and their cache.
//!
//! Probe results live in the volatile run home as `<feature>-true` /
//! `<feature>-false` marker files; a negative marker carries the
//! human-readable reason in its body. The probes themselves do test mounts
//! in a scratch directory inside the driver home, so they exercise the
//! exact filesystem the layers will live on.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{umount2, MntFlags, MsFlags};

use super::mount::{mount_from, page_size};
use super::mkdir_as;
use crate::error::{LayerStoreError, Result};

pub(crate) fn cached_feature_set(feature: &str, set: bool) -> String {
    if set {
        format!("{}-true", feature)
    } else {
        format!("{}-false", feature)
    }
}

/// Looks up a cached probe result. The existence of the marker file encodes
/// the boolean; the content is the recorded reason text.
pub(crate) fn cached_feature_check(run_home: &Path, feature: &str) -> io::Result<(bool, String)> {
    if let Ok(content) = fs::read_to_string(run_home.join(cached_feature_set(feature, true))) {
        return Ok((true, content));
    }
    let content = fs::read_to_string(run_home.join(cached_feature_set(feature, false)))?;
    Ok((false, content))
}

pub(crate) fn cached_feature_record(
    run_home: &Path,
    feature: &str,
    supported: bool,
    text: &str,
) -> io::Result<()> {
    fs::write(run_home.join(cached_feature_set(feature, supported)), text)
}

/// Detaches a probe mount when the probe scope ends, whatever path it took.
struct UnmountGuard<'a>(&'a Path);

impl Drop for UnmountGuard<'_> {
    fn drop(&mut self) {
        let _ = umount2(self.0, MntFlags::MNT_DETACH);
    }
}

/// Checks that reading directory entries populates d_type, which overlay
/// requires from its backing filesystem.
fn supports_dtype(path: &Path) -> Result<bool> {
    use nix::dir::Dir;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    fs::create_dir(path.join("dtype-dir")).map_err(|e| LayerStoreError::path_ctx(path, e))?;
    fs::write(path.join("dtype-file"), b"").map_err(|e| LayerStoreError::path_ctx(path, e))?;

    let mut dir = Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| {
            LayerStoreError::path_ctx(path, io::Error::from_raw_os_error(e as i32))
        })?;
    for entry in dir.iter() {
        let entry = entry.map_err(|e| {
            LayerStoreError::path_ctx(path, io::Error::from_raw_os_error(e as i32))
        })?;
        if entry.file_type().is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Probes whether the kernel can mount overlay with multiple lower
/// directories over this home. Returns the d_type support flag on success.
/// ENOSPC while carving out the scratch directory is surfaced unmodified.
pub(crate) fn supports_overlay(
    home: &Path,
    backing_fs: &str,
    owner: Option<(u32, u32)>,
) -> Result<bool> {
    let _ = Command::new("modprobe").arg("overlay").status();

    let layer_dir = tempfile::Builder::new()
        .prefix("compat")
        .tempdir_in(home)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOSPC) {
                LayerStoreError::path_ctx(home, e)
            } else {
                LayerStoreError::NotSupported(format!(
                    "'overlay' not found as a supported filesystem on this host: {}",
                    e
                ))
            }
        })?;

    let supports_dtype = supports_dtype(layer_dir.path())?;
    if !supports_dtype {
        return Err(LayerStoreError::DTypeNotSupported {
            backing_fs: backing_fs.to_string(),
        });
    }

    let merged = layer_dir.path().join("merged");
    let lower1 = layer_dir.path().join("lower1");
    let lower2 = layer_dir.path().join("lower2");
    let upper = layer_dir.path().join("upper");
    let work = layer_dir.path().join("work");
    for dir in [&merged, &lower1, &lower2, &upper, &work] {
        let _ = mkdir_as(dir, 0o700, owner);
    }
    let _guard = UnmountGuard(&merged);

    let page_size = page_size();
    let flags = format!(
        "lowerdir={}:{},upperdir={},workdir={}",
        lower1.display(),
        lower2.display(),
        upper.display(),
        work.display()
    );
    if flags.len() < page_size {
        match mount_from(
            home.parent().unwrap_or(home),
            "overlay",
            &merged,
            "overlay",
            MsFlags::empty(),
            &flags,
        ) {
            Ok(()) => {
                tracing::debug!("overlay test mount with multiple lowers succeeded");
                return Ok(supports_dtype);
            }
            Err(err) => {
                tracing::debug!("overlay test mount with multiple lowers failed {}", err);
            }
        }
    }

    let flags = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower1.display(),
        upper.display(),
        work.display()
    );
    if flags.len() < page_size {
        match mount_from(
            home.parent().unwrap_or(home),
            "overlay",
            &merged,
            "overlay",
            MsFlags::empty(),
            &flags,
        ) {
            Ok(()) => {
                tracing::error!(
                    "overlay test mount with multiple lowers failed, but succeeded with a single lower"
                );
                return Err(LayerStoreError::NotSupported(
                    "kernel too old to provide multiple lowers feature for overlay".to_string(),
                ));
            }
            Err(err) => {
                tracing::debug!("overlay test mount with a single lower failed {}", err);
            }
        }
    }

    tracing::error!(
        "'overlay' is not supported over {} at {}",
        backing_fs,
        home.display()
    );
    Err(LayerStoreError::IncompatibleFs {
        backing_fs: backing_fs.to_string(),
        home: home.to_path_buf(),
    })
}

/// Detects whether this kernel/option combination stores metadata-only
/// copy-ups: chmod a lower file through the overlay and look for the
/// metacopy xattr on the upper copy.
pub(crate) fn does_metacopy(home: &Path, mount_options: &str) -> Result<bool> {
    let probe = tempfile::Builder::new()
        .prefix("metacopy")
        .tempdir_in(home)
        .map_err(|e| LayerStoreError::path_ctx(home, e))?;

    let lower = probe.path().join("lower");
    let upper = probe.path().join("upper");
    let work = probe.path().join("work");
    let merged = probe.path().join("merged");
    for dir in [&lower, &upper, &work, &merged] {
        fs::create_dir(dir).map_err(|e| LayerStoreError::path_ctx(dir, e))?;
    }
    fs::write(lower.join("f"), b"").map_err(|e| LayerStoreError::path_ctx(&lower, e))?;
    fs::set_permissions(lower.join("f"), fs::Permissions::from_mode(0o700))
        .map_err(|e| LayerStoreError::path_ctx(&lower, e))?;

    let mut opts = format!(
        "lowerdir={},upperdir={},workdir={},metacopy=on",
        lower.display(),
        upper.display(),
        work.display()
    );
    if !mount_options.is_empty() {
        opts = format!("{},{}", mount_options, opts);
    }
    if let Err(err) = nix::mount::mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    ) {
        tracing::debug!("overlay test mount for metacopy check failed: {}", err);
        return Ok(false);
    }
    let _guard = UnmountGuard(&merged);

    fs::set_permissions(merged.join("f"), fs::Permissions::from_mode(0o600))
        .map_err(|e| LayerStoreError::path_ctx(&merged, e))?;

    Ok(matches!(
        xattr::get(upper.join("f"), "trusted.overlay.metacopy"),
        Ok(Some(_))
    ))
}

/// Verifies that upper-directory contents faithfully describe the layer's
/// changes, which is what native diffing reads. Deleting a lower file must
/// leave a character-device whiteout and replacing a lower directory must
/// mark the new upper directory opaque; mount options that break either
/// (metacopy, userxattr) disqualify the fast path outright.
pub(crate) fn supports_native_diff(home: &Path, mount_options: &str) -> Result<()> {
    for option in mount_options.split(',') {
        match option {
            "metacopy=on" => {
                return Err(LayerStoreError::NotSupported(
                    "native diff is not supported with the metacopy=on mount option".to_string(),
                ))
            }
            "userxattr" => {
                return Err(LayerStoreError::NotSupported(
                    "native diff is not supported with the userxattr mount option".to_string(),
                ))
            }
            _ => {}
        }
    }

    let probe = tempfile::Builder::new()
        .prefix("opaque")
        .tempdir_in(home)
        .map_err(|e| LayerStoreError::path_ctx(home, e))?;

    let lower1 = probe.path().join("lower1");
    let lower2 = probe.path().join("lower2");
    let upper = probe.path().join("upper");
    let work = probe.path().join("work");
    let merged = probe.path().join("merged");
    for dir in [&lower1, &lower2, &upper, &work, &merged] {
        fs::create_dir(dir).map_err(|e| LayerStoreError::path_ctx(dir, e))?;
    }
    fs::create_dir(lower2.join("d")).map_err(|e| LayerStoreError::path_ctx(&lower2, e))?;
    fs::write(lower2.join("d").join("f"), b"").map_err(|e| LayerStoreError::path_ctx(&lower2, e))?;
    fs::write(lower2.join("z"), b"").map_err(|e| LayerStoreError::path_ctx(&lower2, e))?;

    let mut opts = format!(
        "lowerdir={}:{},upperdir={},workdir={}",
        lower1.display(),
        lower2.display(),
        upper.display(),
        work.display()
    );
    if !mount_options.is_empty() {
        opts = format!("{},{}", mount_options, opts);
    }
    nix::mount::mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| LayerStoreError::NotSupported(format!("overlay test mount failed: {}", e)))?;
    let _guard = UnmountGuard(&merged);

    // Deleting a lower file must produce a character-device whiteout.
    fs::remove_file(merged.join("z")).map_err(|e| LayerStoreError::path_ctx(&merged, e))?;
    let whiteout: PathBuf = upper.join("z");
    let st = nix::sys::stat::lstat(&whiteout).map_err(|e| {
        LayerStoreError::path_ctx(&whiteout, io::Error::from_raw_os_error(e as i32))
    })?;
    if st.st_mode & libc::S_IFMT != libc::S_IFCHR {
        return Err(LayerStoreError::NotSupported(
            "whiteout for a deleted lower file is not a character device".to_string(),
        ));
    }

    // Replacing a lower directory must mark the new upper directory opaque.
    fs::remove_dir_all(merged.join("d")).map_err(|e| LayerStoreError::path_ctx(&merged, e))?;
    fs::create_dir(merged.join("d")).map_err(|e| LayerStoreError::path_ctx(&merged, e))?;
    match xattr::get(upper.join("d"), "trusted.overlay.opaque") {
        Ok(Some(value)) if value == b"y" => Ok(()),
        _ => Err(LayerStoreError::NotSupported(
            "opaque flag missing on a replaced directory".to_string(),
        )),
    }
}
