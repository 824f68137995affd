//! Filesystem magic numbers, as reported by statfs(2).

use std::path::Path;

use crate::error::{LayerStoreError, Result};

pub const FS_MAGIC_AUFS: i64 = 0x61756673;
pub const FS_MAGIC_BTRFS: i64 = 0x9123683e;
pub const FS_MAGIC_ECRYPTFS: i64 = 0xf15f;
pub const FS_MAGIC_EXTFS: i64 = 0xef53;
pub const FS_MAGIC_F2FS: i64 = 0xf2f52010;
pub const FS_MAGIC_FUSE: i64 = 0x65735546;
pub const FS_MAGIC_NFS: i64 = 0x6969;
pub const FS_MAGIC_OVERLAY: i64 = 0x794c7630;
pub const FS_MAGIC_RAMFS: i64 = 0x858458f6;
pub const FS_MAGIC_TMPFS: i64 = 0x01021994;
pub const FS_MAGIC_XFS: i64 = 0x58465342;
pub const FS_MAGIC_ZFS: i64 = 0x2fc12fc1;

pub fn get_fs_magic(path: &Path) -> Result<i64> {
    let fsbuf = nix::sys::statfs::statfs(path).map_err(|e| LayerStoreError::path_ctx(
        path,
        std::io::Error::from_raw_os_error(e as i32),
    ))?;
    Ok(fsbuf.filesystem_type().0 as i64)
}

pub fn fs_name(magic: i64) -> Option<&'static str> {
    match magic {
        FS_MAGIC_AUFS => Some("aufs"),
        FS_MAGIC_BTRFS => Some("btrfs"),
        FS_MAGIC_ECRYPTFS => Some("ecryptfs"),
        FS_MAGIC_EXTFS => Some("extfs"),
        FS_MAGIC_F2FS => Some("f2fs"),
        FS_MAGIC_FUSE => Some("fuse"),
        FS_MAGIC_NFS => Some("nfs"),
        FS_MAGIC_OVERLAY => Some("overlayfs"),
        FS_MAGIC_RAMFS => Some("ramfs"),
        FS_MAGIC_TMPFS => Some("tmpfs"),
        FS_MAGIC_XFS => Some("xfs"),
        FS_MAGIC_ZFS => Some("zfs"),
        _ => None,
    }
}
