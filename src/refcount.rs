//! Per-mountpoint reference counting.
//!
//! Concurrent `get` calls for the same layer share one mount: only the
//! transition to a count of one performs the mount syscall, and only the
//! transition back to zero unmounts. A filesystem-type check seeds the count
//! when the process starts against a mountpoint that is already mounted
//! (left over from a previous run).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Checks whether a path is currently a mountpoint of the expected
/// filesystem by comparing the statfs magic.
pub struct FsChecker {
    magic: i64,
}

impl FsChecker {
    pub fn new(magic: i64) -> Self {
        FsChecker { magic }
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        match nix::sys::statfs::statfs(path) {
            Ok(fsbuf) => fsbuf.filesystem_type().0 as i64 == self.magic,
            Err(_) => false,
        }
    }
}

struct MountInfo {
    count: i64,
    checked: bool,
}

pub struct RefCounter {
    counts: Mutex<HashMap<PathBuf, MountInfo>>,
    checker: FsChecker,
}

impl RefCounter {
    pub fn new(checker: FsChecker) -> Self {
        RefCounter {
            counts: Mutex::new(HashMap::new()),
            checker,
        }
    }

    /// Increments the count for `path` and returns the new count.
    pub fn increment(&self, path: &Path) -> i64 {
        self.count(path, 1)
    }

    /// Decrements the count for `path` and returns the new count.
    pub fn decrement(&self, path: &Path) -> i64 {
        self.count(path, -1)
    }

    fn count(&self, path: &Path, delta: i64) -> i64 {
        let mut counts = self.counts.lock();
        let info = counts.entry(path.to_path_buf()).or_insert(MountInfo {
            count: 0,
            checked: false,
        });
        if !info.checked {
            info.checked = true;
            if self.checker.is_mounted(path) {
                info.count += 1;
            }
        }
        info.count += delta;
        info.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> RefCounter {
        // A magic no real filesystem carries, so nothing reads as mounted.
        RefCounter::new(FsChecker::new(0x7261_7764))
    }

    #[test]
    fn test_first_increment_is_one() {
        let ctr = counter();
        let path = Path::new("/tmp/layerstore-refcount-test");
        assert_eq!(ctr.increment(path), 1);
        assert_eq!(ctr.increment(path), 2);
        assert_eq!(ctr.decrement(path), 1);
        assert_eq!(ctr.decrement(path), 0);
    }

    #[test]
    fn test_paths_are_independent() {
        let ctr = counter();
        assert_eq!(ctr.increment(Path::new("/tmp/a")), 1);
        assert_eq!(ctr.increment(Path::new("/tmp/b")), 1);
    }
}
