//! Link farm management.
//!
//! Mount data references lower layers through short symlinks under `l/`
//! instead of full layer ids, which keeps the data for a deep stack inside
//! one page. Each layer records its own short id in its `link` file so the
//! farm can be rebuilt when the symlinks are lost (volatile storage, sudden
//! reboot).

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use rand::Rng;

use super::layout::{ID_LEN, LINK_DIR};
use super::{mkdir_all_as, Driver};
use crate::error::{LayerStoreError, Result};

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a fresh short link id. Collisions are not detected; with 62^26
/// possible ids the probability is negligible for any realistic layer count.
pub(crate) fn generate_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Reads a layer's short link id from its `link` file. Trailing whitespace
/// (including the optional newline) is not significant.
pub(crate) fn read_link_id(layer_dir: &Path) -> Result<String> {
    let path = layer_dir.join("link");
    let content = fs::read_to_string(&path).map_err(|e| LayerStoreError::path_ctx(path, e))?;
    Ok(content.trim_end().to_string())
}

impl Driver {
    /// Creates the farm symlink for a new layer and records the short id in
    /// the layer's `link` file.
    pub(crate) fn assign_link(&self, id: &str, layer_dir: &Path) -> Result<()> {
        let lid = generate_id(ID_LEN);
        let link_path = self.layout.link_dir().join(&lid);
        let target = Path::new("..").join(id).join("diff");
        symlink(&target, &link_path).map_err(|e| LayerStoreError::path_ctx(link_path, e))?;

        let link_file = layer_dir.join("link");
        super::write_file_with_mode(&link_file, lid.as_bytes(), 0o644)
    }

    /// Walks the driver home and recreates any farm symlink that has gone
    /// missing, using the name recorded in each layer's `link` file.
    /// Existing symlinks are left alone; stat failures other than ENOENT
    /// abort the rebuild.
    pub(crate) fn recreate_symlinks(&self) -> Result<()> {
        let home = self.layout.home();
        let entries =
            fs::read_dir(home).map_err(|e| LayerStoreError::path_ctx(home.to_path_buf(), e))?;
        mkdir_all_as(&self.layout.link_dir(), 0o700, self.root_pair())?;

        for entry in entries {
            let entry = entry.map_err(|e| LayerStoreError::path_ctx(home.to_path_buf(), e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == LINK_DIR || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let lid = read_link_id(&self.layout.dir(&name))?;
            let link_path = self.layout.link_dir().join(&lid);
            match fs::symlink_metadata(&link_path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let target = Path::new("..").join(name.as_ref()).join("diff");
                    symlink(&target, &link_path)
                        .map_err(|e| LayerStoreError::path_ctx(link_path, e))?;
                }
                Err(e) => return Err(LayerStoreError::path_ctx(link_path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn generated_ids_use_the_link_alphabet(len in 1usize..64) {
            let id = generate_id(len);
            prop_assert_eq!(id.len(), len);
            prop_assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_read_link_id_trims_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("link"), "ABCDEF\n").unwrap();
        assert_eq!(read_link_id(dir.path()).unwrap(), "ABCDEF");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_id(ID_LEN);
        let b = generate_id(ID_LEN);
        assert_ne!(a, b);
    }
}
