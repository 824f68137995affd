use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LayerStoreError>;

#[derive(Error, Debug)]
pub enum LayerStoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("kernel does not support overlay fs: {0}")]
    NotSupported(String),

    #[error("'overlay' is not supported over {backing_fs} at {}", .home.display())]
    IncompatibleFs { backing_fs: String, home: PathBuf },

    #[error("{backing_fs} does not support d_type, which is required by the overlay driver")]
    DTypeNotSupported { backing_fs: String },

    #[error("max depth exceeded")]
    DepthExceeded,

    #[error("cannot mount layer, mount label too large {0}")]
    MountLabelTooLarge(usize),

    #[error("error creating overlay mount to {}: {source}", .target.display())]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("using mount program {}: {stderr}", .program.display())]
    MountProgram { program: PathBuf, stderr: String },

    #[error("error unmounting {}: {source}", .target.display())]
    Unmount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("unknown option {0}")]
    UnknownOption(String),

    #[error("unable to parse key/value option: {0}")]
    MalformedOption(String),

    #[error("invalid value {value:?} for option {key}")]
    InvalidOptionValue { key: String, value: String },

    #[error("invalid size: {0:?}")]
    InvalidSize(String),

    #[error("storage option size is only supported for read-write layers")]
    SizeOnReadOnlyLayer,

    #[error("storage option size only supported over xfs with 'pquota' mount option, found {0}")]
    QuotaUnsupported(String),

    #[error("no mapping for root in supplied ID maps")]
    RootIdNotMapped,
}

impl LayerStoreError {
    /// Attach path context to an I/O error without losing the underlying
    /// errno, so callers can still match on ENOSPC and friends.
    pub fn path_ctx(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LayerStoreError::Path {
            path: path.into(),
            source,
        }
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            LayerStoreError::Io(e) => Some(e),
            LayerStoreError::Path { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_enospc(&self) -> bool {
        match self {
            LayerStoreError::Mount { source, .. } | LayerStoreError::Unmount { source, .. } => {
                *source == nix::errno::Errno::ENOSPC
            }
            other => other
                .io_source()
                .and_then(io::Error::raw_os_error)
                .map_or(false, |errno| errno == libc::ENOSPC),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.io_source()
            .map_or(false, |e| e.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_survives_path_context() {
        let err = LayerStoreError::path_ctx("/some/layer", io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(err.is_enospc());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_detection() {
        let err = LayerStoreError::path_ctx("/gone", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.is_not_found());
        assert!(!err.is_enospc());
    }

    #[test]
    fn test_display_carries_context() {
        let err = LayerStoreError::path_ctx("/l/x", io::Error::from_raw_os_error(libc::ENOENT));
        let message = err.to_string();
        assert!(message.starts_with("/l/x: "));
    }
}
