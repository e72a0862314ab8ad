//! The in-memory folder/file tree.
//!
//! Items are `Arc` nodes owned by their parent folder's item map; the
//! child-to-parent link is a `Weak`. Handing out `Arc` clones replaces
//! the scope-lock idiom: an item cannot be dropped while any caller
//! holds a handle, and the `deleted` flag tells late holders the item is
//! gone. Deletion drains users by taking the item's (and, for folders,
//! every child's) exclusive metadata lock before marking it deleted.

/// File read/write/truncate/flush on top of the page cache.
pub mod file;
/// Folder contents, diff synchronization and path resolution.
pub mod folder;
/// The synthetic top-level folder flavors.
pub mod folders;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::error::FsError;
use crate::filedata::page_manager::PageManager;
use crate::fsconfig::FsConfig;
use crate::Mount;

/// Metadata common to files and folders.
pub struct ItemMeta {
    /// Server-assigned id; empty until the item exists on the server.
    pub id: String,
    /// Name within the parent folder.
    pub name: String,
    /// Owning filesystem id; empty for synthetic folders.
    pub filesystem: String,
    /// Creation time.
    pub created: SystemTime,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Last access time.
    pub accessed: Option<SystemTime>,
    /// Whether the item itself is read-only.
    pub read_only: bool,
    /// Set when the parent has removed this item; late `Arc` holders
    /// must treat it as gone.
    pub deleted: bool,
    /// The owning folder.
    pub parent: Weak<Item>,
}

/// Per-variant state.
pub enum ItemKind {
    /// A regular file.
    File(FileData),
    /// A folder.
    Folder(FolderData),
}

/// File-variant state.
pub struct FileData {
    /// The owning filesystem's immutable config.
    pub config: Arc<FsConfig>,
    /// The file's page cache.
    pub pages: Arc<PageManager>,
}

/// Which endpoint populates a folder, and whether it may be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderFlavor {
    /// An ordinary server folder.
    Plain,
    /// The root folder of one filesystem.
    FilesystemRoot,
    /// Synthetic list of all filesystems.
    Filesystems,
    /// Synthetic list of items adopted from other accounts.
    Adopted,
    /// The synthetic mount root aggregating the above.
    SuperRoot,
}

impl FolderFlavor {
    /// Whether items can be created, renamed, moved or deleted here.
    #[must_use]
    pub fn mutable(self) -> bool {
        matches!(self, Self::Plain | Self::FilesystemRoot)
    }
}

/// Folder-variant state.
pub struct FolderData {
    /// How this folder populates.
    pub flavor: FolderFlavor,
    /// The item map and its freshness, under the folder's data lock.
    pub contents: RwLock<FolderContents>,
}

/// A folder's name-ordered children and refresh bookkeeping.
#[derive(Default)]
pub struct FolderContents {
    /// Children by name.
    pub items: BTreeMap<String, Arc<Item>>,
    /// Whether the map has ever been populated.
    pub have_items: bool,
    /// When the map was last synchronized against the server.
    pub refreshed: Option<Instant>,
}

/// A node in the mounted tree.
pub struct Item {
    pub(crate) mount: Arc<Mount>,
    pub(crate) kind: ItemKind,
    pub(crate) meta: RwLock<ItemMeta>,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item").finish_non_exhaustive()
    }
}

/// A point-in-time attribute snapshot for the bridge adapter.
#[derive(Debug, Clone)]
pub struct ItemAttrs {
    /// True for folders.
    pub is_folder: bool,
    /// File size (0 for folders).
    pub size: u64,
    /// Creation time.
    pub created: SystemTime,
    /// Modification time, falling back to creation.
    pub modified: SystemTime,
    /// Effective read-only flag (item, filesystem or mount).
    pub read_only: bool,
}

/// Convert a server epoch-seconds stamp to a `SystemTime`.
#[must_use]
pub fn time_from_epoch(seconds: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(seconds.max(0.0))
}

impl Item {
    /// The file-variant state, or `NotFile`.
    pub fn as_file(&self) -> Result<&FileData, FsError> {
        match &self.kind {
            ItemKind::File(data) => Ok(data),
            ItemKind::Folder(_) => Err(FsError::NotFile),
        }
    }

    /// The folder-variant state, or `NotFolder`.
    pub fn as_folder(&self) -> Result<&FolderData, FsError> {
        match &self.kind {
            ItemKind::Folder(data) => Ok(data),
            ItemKind::File(_) => Err(FsError::NotFolder),
        }
    }

    /// True for folders.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Folder(_))
    }

    /// The item's current name.
    pub async fn name(&self) -> String {
        self.meta.read().await.name.clone()
    }

    /// Whether the parent has removed this item.
    pub async fn is_deleted(&self) -> bool {
        self.meta.read().await.deleted
    }

    /// Attribute snapshot for the bridge.
    pub async fn attrs(&self) -> ItemAttrs {
        let meta = self.meta.read().await;
        let (is_folder, size, config_read_only) = match &self.kind {
            ItemKind::File(data) => (false, data.pages.file_size(), data.config.read_only),
            ItemKind::Folder(_) => (true, 0, false),
        };
        ItemAttrs {
            is_folder,
            size,
            created: meta.created,
            modified: meta.modified.unwrap_or(meta.created),
            read_only: meta.read_only || config_read_only || self.mount.options.read_only,
        }
    }

    /// Whether writes to this item must be rejected.
    pub async fn effective_read_only(&self) -> bool {
        if self.mount.options.read_only {
            return true;
        }
        let meta = self.meta.read().await;
        if meta.read_only {
            return true;
        }
        match &self.kind {
            ItemKind::File(data) => data.config.read_only,
            ItemKind::Folder(_) => false,
        }
    }

    /// Mark this item (and any children) deleted, draining users by
    /// taking each exclusive metadata lock, and tear down file caches.
    pub async fn detach(self: &Arc<Self>) {
        // Children first, so no user can re-descend through this node.
        if let ItemKind::Folder(folder) = &self.kind {
            let children: Vec<Arc<Item>> = {
                let contents = folder.contents.read().await;
                contents.items.values().cloned().collect()
            };
            for child in children {
                Box::pin(child.detach()).await;
            }
        }

        {
            let mut meta = self.meta.write().await;
            meta.deleted = true;
        }

        if let ItemKind::File(data) = &self.kind {
            data.pages.shutdown().await;
        }
    }
}
