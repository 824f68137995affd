//! On-disk path layout.
//!
//! Every layer id maps to a directory holding `diff`, `work`, `merged`, the
//! `link` and `lower` bookkeeping files, and (for parent-less layers) an
//! `empty` sentinel lower. The layout manager is pure path arithmetic; the
//! only filesystem access is the existence probe that redirects reads to an
//! additional read-only image store when the primary directory is absent.

use std::path::{Component, Path, PathBuf};

pub const LINK_DIR: &str = "l";
pub const LOWER_FILE: &str = "lower";
pub const MAX_DEPTH: usize = 128;

// Number of random characters in a short link id. If this value is too long
// the page size limit for the mount data may be exceeded. It is chosen so
// that ((ID_LEN + len(LINK_DIR) + 1) * MAX_DEPTH) <= (page size - 512),
// where 512 is a buffer for label metadata.
pub const ID_LEN: usize = 26;

pub const DEFAULT_PERMS: u32 = 0o555;

pub struct Layout {
    home: PathBuf,
    name: String,
    image_stores: Vec<PathBuf>,
}

impl Layout {
    pub fn new(home: PathBuf, name: impl Into<String>, image_stores: Vec<PathBuf>) -> Self {
        Layout {
            home,
            name: name.into(),
            image_stores,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn image_stores(&self) -> &[PathBuf] {
        &self.image_stores
    }

    pub fn link_dir(&self) -> PathBuf {
        self.home.join(LINK_DIR)
    }

    /// Resolves the layer directory for `id`: the primary path under `home`,
    /// or the first additional image store that has it when the primary does
    /// not exist. Falls back to the (nonexistent) primary path so callers
    /// get a sensible path in their error messages.
    pub fn dir(&self, id: &str) -> PathBuf {
        let primary = self.home.join(id);
        if primary.symlink_metadata().is_err() {
            for store in &self.image_stores {
                let candidate = store.join(&self.name).join(id);
                if candidate.symlink_metadata().is_ok() {
                    return candidate;
                }
            }
        }
        primary
    }

    pub fn diff_dir(&self, id: &str) -> PathBuf {
        self.dir(id).join("diff")
    }

    pub fn lower_file(&self, id: &str) -> PathBuf {
        self.dir(id).join(LOWER_FILE)
    }
}

/// `name` for 0, `name<n>` otherwise. Rotated diff directories count up from
/// `diff1` (older rotations get higher numbers).
pub fn name_with_suffix(name: &str, n: usize) -> String {
    if n == 0 {
        name.to_string()
    } else {
        format!("{}{}", name, n)
    }
}

/// Joins components with `/` without any normalization, so `..` survives
/// and pathname resolution walks through the link-farm symlinks.
pub fn dumb_join(parts: &[&str]) -> String {
    parts.join("/")
}

/// Lexically normalizes a path: drops `.` and resolves `..` against the
/// preceding component. Used on link targets read back from the farm, which
/// are written relative (`../<id>/diff`).
pub fn clean_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(Component::ParentDir);
                }
            }
            other => result.push(other),
        }
    }
    result
}
