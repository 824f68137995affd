//! UID/GID mapping types shared with the higher-level store.
//!
//! The driver never rewrites ownership itself; tree-wide chowns are done by
//! an external collaborator implementing [`ChownByMaps`]. What lives here is
//! the mapping data model and the root-pair lookup the driver needs when it
//! creates directories on behalf of a mapped root user.

use std::path::Path;

use crate::error::{LayerStoreError, Result};

/// A single contiguous range of an ID mapping, mirroring one line of
/// `/proc/self/uid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Paired UID and GID mappings for a layer or container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
}

impl IdMappings {
    pub fn new(uid_maps: Vec<IdMap>, gid_maps: Vec<IdMap>) -> Self {
        IdMappings { uid_maps, gid_maps }
    }

    pub fn is_empty(&self) -> bool {
        self.uid_maps.is_empty() && self.gid_maps.is_empty()
    }
}

fn to_host(id: u32, maps: &[IdMap]) -> Result<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    for m in maps {
        if id >= m.container_id && id < m.container_id + m.size {
            return Ok(m.host_id + (id - m.container_id));
        }
    }
    Err(LayerStoreError::RootIdNotMapped)
}

/// Host-side (uid, gid) that container root maps to. With no mappings the
/// process's idea of root (0, 0) is returned unchanged.
pub fn root_uid_gid(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<(u32, u32)> {
    Ok((to_host(0, uid_maps)?, to_host(0, gid_maps)?))
}

/// External collaborator that rewrites ownership of every path under `path`
/// from the `to_container` view to the `to_host` view.
pub trait ChownByMaps: Send + Sync {
    fn chown_path_by_maps(
        &self,
        path: &Path,
        to_container: Option<&IdMappings>,
        to_host: Option<&IdMappings>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_pair_identity_without_maps() {
        assert_eq!(root_uid_gid(&[], &[]).unwrap(), (0, 0));
    }

    #[test]
    fn test_root_pair_mapped() {
        let uids = vec![IdMap {
            container_id: 0,
            host_id: 100000,
            size: 65536,
        }];
        let gids = vec![IdMap {
            container_id: 0,
            host_id: 200000,
            size: 65536,
        }];
        assert_eq!(root_uid_gid(&uids, &gids).unwrap(), (100000, 200000));
    }

    #[test]
    fn test_root_pair_unmapped_root_errors() {
        let uids = vec![IdMap {
            container_id: 1000,
            host_id: 100000,
            size: 1,
        }];
        assert!(root_uid_gid(&uids, &[]).is_err());
    }
}
