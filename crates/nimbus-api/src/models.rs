//! Serde models for server records.

use serde::Deserialize;

/// Timestamps attached to every item record, in seconds since the epoch.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ItemDates {
    /// Creation time.
    pub created: f64,
    /// Last modification time, if the server tracks it.
    #[serde(default)]
    pub modified: Option<f64>,
    /// Last access time, if the server tracks it.
    #[serde(default)]
    pub accessed: Option<f64>,
}

/// A file as reported by `files/getfolder` or returned from a mutation.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRecord {
    /// Server-assigned id.
    pub id: String,
    /// Name within the parent folder.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Id of the owning filesystem.
    pub filesystem: String,
    /// Item timestamps.
    #[serde(default)]
    pub dates: ItemDates,
}

/// A folder as reported by `files/getfolder`.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderRecord {
    /// Server-assigned id.
    pub id: String,
    /// Name within the parent folder.
    pub name: String,
    /// Id of the owning filesystem.
    pub filesystem: String,
    /// Item timestamps.
    #[serde(default)]
    pub dates: ItemDates,
}

/// The contents of a folder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderListing {
    /// Files in the folder.
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Sub-folders in the folder.
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
}

/// A filesystem as reported by `files/getfilesystems`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemRecord {
    /// Server-assigned id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Id of the filesystem's root folder.
    pub rootfolder: String,
}

/// Per-filesystem storage parameters from `files/getconfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageRecord {
    /// Maximum bytes the storage accepts per write, 0/absent = unconstrained.
    #[serde(default)]
    pub chunksize: Option<u64>,
    /// Whether the filesystem rejects all writes.
    #[serde(default)]
    pub readonly: bool,
    /// Storage kind, e.g. `S3`, `FTP`, `local`. Determines the write mode.
    pub sttype: String,
}

/// Account-wide limits from `files/getlimits`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountLimits {
    /// Largest request body the server accepts, if constrained.
    #[serde(default)]
    pub upload_maxbytes: Option<u64>,
}

/// Server-wide configuration from `server/getconfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// API protocol version.
    pub apiversion: u32,
    /// Whether the server database is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// The result of `accounts/createsession`.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// The authenticated account id.
    pub account_id: String,
    /// Session id to attach to subsequent calls.
    pub session_id: String,
    /// Session key to attach to subsequent calls.
    pub session_key: String,
}
