//! Per-filesystem storage configuration.

use std::sync::Arc;

use nimbus_api::{ObjectApi, StorageRecord};
use tracing::debug;

use crate::error::FsError;

/// What kinds of writes the underlying storage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteMode {
    /// Object storage: whole-file replacement only.
    Upload,
    /// Writes only at the end of the file, plus zero-size truncate.
    Append,
    /// Arbitrary offsets.
    Random,
}

/// Immutable parameters of one remote filesystem.
///
/// Loaded once per filesystem id and shared by every file on it.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Maximum bytes per write call, 0 = unconstrained.
    pub chunk_size: u64,
    /// Whether the filesystem rejects all writes.
    pub read_only: bool,
    /// The allowed write pattern.
    pub write_mode: WriteMode,
}

impl FsConfig {
    /// Build from a `files/getconfig` record.
    #[must_use]
    pub fn from_record(record: &StorageRecord) -> Self {
        let write_mode = match record.sttype.as_str() {
            "S3" => WriteMode::Upload,
            "FTP" => WriteMode::Append,
            _ => WriteMode::Random,
        };

        Self {
            chunk_size: record.chunksize.unwrap_or(0),
            read_only: record.readonly,
            write_mode,
        }
    }
}

/// One shared [`FsConfig`] per filesystem id.
pub struct FsConfigRegistry {
    configs: scc::HashMap<String, Arc<FsConfig>>,
}

impl FsConfigRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: scc::HashMap::new(),
        }
    }

    /// Return the config for the given filesystem, loading it from the
    /// server on first use.
    pub async fn load(
        &self,
        api: &dyn ObjectApi,
        fs_id: &str,
    ) -> Result<Arc<FsConfig>, FsError> {
        if let Some(config) = self.configs.read_async(fs_id, |_, v| Arc::clone(v)).await {
            return Ok(config);
        }

        let record = api.storage_config(fs_id).await?;
        let config = Arc::new(FsConfig::from_record(&record));
        debug!(fs_id, ?config, "loaded storage config");

        // Another caller may have raced the load; either instance is
        // equivalent since the config is immutable.
        let _ = self
            .configs
            .insert_async(fs_id.to_owned(), Arc::clone(&config))
            .await;

        Ok(config)
    }
}

impl Default for FsConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sttype: &str, chunksize: Option<u64>, readonly: bool) -> StorageRecord {
        StorageRecord {
            chunksize,
            readonly,
            sttype: sttype.to_owned(),
        }
    }

    #[test]
    fn storage_kind_selects_write_mode() {
        assert_eq!(
            FsConfig::from_record(&record("S3", None, false)).write_mode,
            WriteMode::Upload
        );
        assert_eq!(
            FsConfig::from_record(&record("FTP", None, false)).write_mode,
            WriteMode::Append
        );
        assert_eq!(
            FsConfig::from_record(&record("local", None, false)).write_mode,
            WriteMode::Random
        );
    }

    #[test]
    fn chunksize_defaults_to_unconstrained() {
        assert_eq!(FsConfig::from_record(&record("local", None, false)).chunk_size, 0);
        assert_eq!(
            FsConfig::from_record(&record("local", Some(4096), true)).chunk_size,
            4096
        );
    }
}
