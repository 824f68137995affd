//! Project-quota interface.
//!
//! Quota enforcement lives in the backing filesystem and is driven by an
//! external controller; the driver only decides when a quota applies.

use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    /// Maximum size of the writable layer in bytes. Zero means unlimited.
    pub size: u64,
}

/// External collaborator that assigns a project quota to a directory tree.
/// Only meaningful on xfs mounted with `pquota`.
pub trait QuotaController: Send + Sync {
    fn set_quota(&self, path: &Path, quota: Quota) -> Result<()>;
}
