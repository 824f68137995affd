//! Interfaces to the archival collaborators.
//!
//! The driver does not read or write tar streams itself. Producing an
//! archive from a `diff` directory, extracting one into it, and computing
//! mount-and-compare diffs are all delegated through the traits below. The
//! types here fix the wire-level vocabulary the driver and its collaborators
//! share: whiteout dialects, change records, and tar options.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::driver::options::MountOpts;
use crate::error::Result;
use crate::idmap::{IdMap, IdMappings};

/// How deletions are represented in a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutFormat {
    /// Kernel overlay convention: 0:0 character device nodes.
    Overlay,
    /// `.wh.<name>` marker files. Used when an unprivileged mount helper
    /// performs the stacking, since mknod is unavailable there.
    Aufs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
}

/// One entry of a layer changeset, path relative to the layer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Options handed to the tar codec for both archiving and extraction.
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    pub ignore_chown_errors: bool,
    pub force_mask: Option<u32>,
    pub whiteout_format: Option<WhiteoutFormat>,
    /// Lower directories the codec needs to resolve overlay whiteout
    /// metadata against when archiving.
    pub whiteout_data: Vec<PathBuf>,
}

/// The tar codec: produces and consumes uncompressed tar streams.
pub trait TarCodec: Send + Sync {
    /// Archive the contents of `dir`.
    fn tar_with_options(&self, dir: &Path, options: &TarOptions) -> Result<Box<dyn Read + Send>>;

    /// Extract an uncompressed tar stream into `dest`.
    fn untar_uncompressed(
        &self,
        diff: &mut dyn Read,
        dest: &Path,
        options: &TarOptions,
    ) -> Result<()>;

    /// Enumerate changes in `diff_dir` against the ordered `lowers`,
    /// interpreting overlay whiteout metadata.
    fn overlay_changes(&self, lowers: &[PathBuf], diff_dir: &Path) -> Result<Vec<Change>>;
}

/// Options for applying a diff stream to a layer.
pub struct ApplyDiffOpts<'a> {
    pub diff: &'a mut (dyn Read + Send),
    pub mappings: Option<&'a IdMappings>,
    pub mount_label: String,
    pub ignore_chown_errors: bool,
    pub force_mask: Option<u32>,
}

/// Mount surface the naive diff driver works against. Implemented by the
/// driver itself; passed by reference so the collaborator needs no
/// back-pointer.
pub trait LayerMounter {
    fn mount_layer(&self, id: &str, options: MountOpts) -> Result<PathBuf>;
    fn unmount_layer(&self, id: &str) -> Result<()>;
}

/// Mount-and-compare diff fallback. Used whenever the requested parent is
/// not the layer's direct lower ancestor, or native diffing is unusable on
/// this kernel/configuration.
pub trait NaiveDiffDriver: Send + Sync {
    fn diff(
        &self,
        layers: &dyn LayerMounter,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<Box<dyn Read + Send>>;

    fn diff_size(
        &self,
        layers: &dyn LayerMounter,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<u64>;

    fn changes(
        &self,
        layers: &dyn LayerMounter,
        id: &str,
        mappings: Option<&IdMappings>,
        parent: &str,
        parent_mappings: Option<&IdMappings>,
        mount_label: &str,
    ) -> Result<Vec<Change>>;

    fn apply_diff(
        &self,
        layers: &dyn LayerMounter,
        id: &str,
        parent: &str,
        options: ApplyDiffOpts<'_>,
    ) -> Result<u64>;
}

/// Direct file access into a layer's diff directory, for tar-split style
/// consumers that want to reassemble archives without re-archiving.
pub trait FileGetter: Send {
    fn get(&self, path: &Path) -> Result<File>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`FileGetter`] rooted at a directory.
pub struct PathFileGetter {
    root: PathBuf,
}

impl PathFileGetter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PathFileGetter { root: root.into() }
    }
}

impl FileGetter for PathFileGetter {
    fn get(&self, path: &Path) -> Result<File> {
        let full = self.root.join(path);
        File::open(&full).map_err(|e| crate::error::LayerStoreError::path_ctx(full, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_path_file_getter_reads_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data"), b"abc").unwrap();

        let getter = PathFileGetter::new(dir.path());
        let mut content = String::new();
        getter
            .get(Path::new("data"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "abc");
        assert!(getter.get(Path::new("missing")).is_err());
    }
}
