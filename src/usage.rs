use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::Result;

/// Disk usage of a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub size: u64,
    pub inode_count: u64,
}

/// Walks `path` and sums apparent sizes. Hard-linked files are counted once,
/// keyed by (device, inode), so layers that share content via links are not
/// over-reported.
pub fn directory_usage(path: &Path) -> Result<DiskUsage> {
    let mut usage = DiskUsage::default();
    let mut seen: HashSet<(u64, u64)> = HashSet::new();

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_default();
            match e.into_io_error() {
                Some(io) => crate::error::LayerStoreError::path_ctx(path, io),
                None => crate::error::LayerStoreError::path_ctx(
                    path,
                    std::io::Error::other("walk failed"),
                ),
            }
        })?;
        let meta = entry
            .metadata()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        usage.inode_count += 1;
        if meta.is_file() {
            usage.size += meta.len();
        }
    }
    Ok(usage)
}

pub fn directory_size(path: &Path) -> Result<u64> {
    Ok(directory_usage(path)?.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_directory_usage_counts_files_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        fs::write(dir.path().join("b"), b"world!").unwrap();
        fs::hard_link(dir.path().join("a"), dir.path().join("a-link")).unwrap();

        let usage = directory_usage(dir.path()).unwrap();
        assert_eq!(usage.size, 11);
        // root dir + two distinct files
        assert_eq!(usage.inode_count, 3);
    }

    #[test]
    fn test_directory_size_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 0);
    }
}
