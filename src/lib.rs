pub mod archive;
pub mod driver;
pub mod error;
pub mod idmap;
pub mod locker;
pub mod quota;
pub mod refcount;
pub mod usage;

pub use archive::{
    ApplyDiffOpts, Change, ChangeKind, FileGetter, LayerMounter, NaiveDiffDriver, PathFileGetter,
    TarCodec, TarOptions, WhiteoutFormat,
};
pub use driver::options::{CreateOpts, DriverOptions, MountOpts};
pub use driver::{Driver, InitOptions, MAX_DEPTH};
pub use error::{LayerStoreError, Result};
pub use idmap::{ChownByMaps, IdMap, IdMappings};
pub use quota::{Quota, QuotaController};
pub use usage::DiskUsage;
