//! The filesystem error type and its errno mapping.

use nimbus_api::ApiError;
use thiserror::Error;

/// A failure surfaced by the filesystem layers.
///
/// Local-semantic variants come from the item tree, `Memory` from the
/// cache manager, and `Backend` wraps anything the server or transport
/// reported. The bridge adapter converts every variant to an errno via
/// [`FsError::errno`]; local-semantic failures are part of normal
/// operation and are never logged as errors.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// A path component or named item does not exist.
    #[error("item not found")]
    NotFound,

    /// A file was expected but the item is a folder.
    #[error("item is not a file")]
    NotFile,

    /// A folder was expected but the item is a file.
    #[error("item is not a folder")]
    NotFolder,

    /// The target name already exists in the parent.
    #[error("item already exists")]
    Duplicate,

    /// The item cannot be modified this way (e.g. it has no backend id
    /// yet, or it is a synthetic folder).
    #[error("item cannot be modified")]
    Modify,

    /// The storage's write mode rejects this write or truncate.
    #[error("write type unsupported")]
    WriteType,

    /// The operation is not supported by this filesystem.
    #[error("operation unsupported")]
    Unsupported,

    /// The mount, item or filesystem is read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The read goes beyond the end of the file.
    #[error("read out of range")]
    ReadBounds,

    /// An eviction or flush failed while the cache was over budget.
    #[error("cache {0} failure while over limit")]
    Memory(&'static str),

    /// A server- or transport-reported failure.
    #[error(transparent)]
    Backend(#[from] ApiError),
}

impl FsError {
    /// The errno the kernel bridge reports for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFile => libc::EISDIR,
            Self::NotFolder => libc::ENOTDIR,
            Self::NotFound => libc::ENOENT,
            Self::Duplicate => libc::EEXIST,
            Self::Modify | Self::WriteType | Self::Unsupported => libc::ENOTSUP,
            Self::ReadOnly => libc::EROFS,
            Self::ReadBounds | Self::Memory(_) => libc::EIO,
            Self::Backend(api) => match api {
                ApiError::Unsupported => libc::ENOTSUP,
                ApiError::Denied(_) | ApiError::AuthFailed | ApiError::TwoFactor => libc::EACCES,
                ApiError::ReadOnlyFs(_) => libc::EROFS,
                ApiError::NotFound(_) => libc::ENOENT,
                ApiError::Connection(_) => libc::EHOSTDOWN,
                ApiError::Api { .. } | ApiError::Json(_) => libc::EIO,
            },
        }
    }
}
