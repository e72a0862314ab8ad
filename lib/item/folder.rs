//! Folder contents, server synchronization and path resolution.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use nimbus_api::{ApiError, FolderListing, FolderRecord};
use tracing::{debug, info};

use crate::config::CacheMode;
use crate::error::FsError;
use crate::fsconfig::FsConfig;
use crate::item::{
    time_from_epoch, FolderContents, FolderData, FolderFlavor, Item, ItemKind, ItemMeta,
};
use crate::Mount;
use tokio::sync::RwLock;

/// Names that cannot be created, and the path separator they would break.
fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::Duplicate);
    }
    Ok(())
}

impl Item {
    /// Build a folder item from a server record.
    #[must_use]
    pub fn folder_from_record(
        mount: &Arc<Mount>,
        parent: &Arc<Item>,
        record: &FolderRecord,
        flavor: FolderFlavor,
    ) -> Arc<Item> {
        Arc::new(Item {
            mount: Arc::clone(mount),
            kind: ItemKind::Folder(FolderData {
                flavor,
                contents: RwLock::new(FolderContents::default()),
            }),
            meta: RwLock::new(ItemMeta {
                id: record.id.clone(),
                name: record.name.clone(),
                filesystem: record.filesystem.clone(),
                created: time_from_epoch(record.dates.created),
                modified: record.dates.modified.map(time_from_epoch),
                accessed: record.dates.accessed.map(time_from_epoch),
                read_only: false,
                deleted: false,
                parent: Arc::downgrade(parent),
            }),
        })
    }

    /// Build a folder that exists in memory only (memory cache mode).
    #[must_use]
    pub fn folder_local(
        mount: &Arc<Mount>,
        parent: &Arc<Item>,
        name: &str,
        fs_id: &str,
    ) -> Arc<Item> {
        let now = std::time::SystemTime::now();
        Arc::new(Item {
            mount: Arc::clone(mount),
            kind: ItemKind::Folder(FolderData {
                flavor: FolderFlavor::Plain,
                contents: RwLock::new(FolderContents {
                    have_items: true,
                    ..FolderContents::default()
                }),
            }),
            meta: RwLock::new(ItemMeta {
                id: String::new(),
                name: name.to_owned(),
                filesystem: fs_id.to_owned(),
                created: now,
                modified: Some(now),
                accessed: None,
                read_only: false,
                deleted: false,
                parent: Arc::downgrade(parent),
            }),
        })
    }

    /// Resolve a `/`-separated path relative to this folder, loading
    /// folder contents along the way. Returns the scope handle of the
    /// found item.
    pub async fn resolve(self: &Arc<Self>, path: &str) -> Result<Arc<Item>, FsError> {
        let mut current = Arc::clone(self);

        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }

            let next = {
                let folder = match &current.kind {
                    ItemKind::Folder(folder) => folder,
                    ItemKind::File(_) => return Err(FsError::NotFolder),
                };
                let mut contents = folder.contents.write().await;
                current.load_items(&mut contents, true).await?;
                contents
                    .items
                    .get(part)
                    .cloned()
                    .ok_or(FsError::NotFound)?
            };

            if next.is_deleted().await {
                return Err(FsError::NotFound);
            }
            current = next;
        }

        if current.is_deleted().await {
            return Err(FsError::NotFound);
        }
        Ok(current)
    }

    /// Resolve a path that must name a file.
    pub async fn resolve_file(self: &Arc<Self>, path: &str) -> Result<Arc<Item>, FsError> {
        let item = self.resolve(path).await?;
        item.as_file()?;
        Ok(item)
    }

    /// Resolve a path that must name a folder.
    pub async fn resolve_folder(self: &Arc<Self>, path: &str) -> Result<Arc<Item>, FsError> {
        let item = self.resolve(path).await?;
        item.as_folder()?;
        Ok(item)
    }

    /// Snapshot this folder's children, loading them if necessary.
    pub async fn folder_entries(self: &Arc<Self>) -> Result<Vec<(String, Arc<Item>)>, FsError> {
        let folder = self.as_folder()?;
        let mut contents = folder.contents.write().await;
        self.load_items(&mut contents, true).await?;
        Ok(contents
            .items
            .iter()
            .map(|(name, item)| (name.clone(), Arc::clone(item)))
            .collect())
    }

    /// Populate or refresh the item map. Refresh only happens when the
    /// listing has expired, and never in memory cache mode (there is no
    /// server truth to sync against); cache mode `None` refreshes on
    /// every access.
    pub(crate) async fn load_items(
        self: &Arc<Self>,
        contents: &mut FolderContents,
        can_refresh: bool,
    ) -> Result<(), FsError> {
        let folder = self.as_folder()?;
        let options = &self.mount.options;

        let expired = contents
            .refreshed
            .is_none_or(|at| at.elapsed() > options.refresh_interval);

        let need = if contents.have_items {
            can_refresh
                && match options.cache_mode {
                    CacheMode::Memory => false,
                    CacheMode::None => true,
                    CacheMode::Normal => expired,
                }
        } else {
            true
        };
        if !need {
            return Ok(());
        }

        match folder.flavor {
            FolderFlavor::SuperRoot => {
                if !contents.have_items {
                    self.populate_super_root(contents);
                }
            }
            FolderFlavor::Filesystems => self.sync_filesystems(contents).await?,
            FolderFlavor::Adopted => {
                let listing = self.mount.api.list_adopted().await?;
                self.sync_listing(contents, &listing).await?;
            }
            FolderFlavor::Plain | FolderFlavor::FilesystemRoot => {
                if self.mount.options.cache_mode == CacheMode::Memory && contents.have_items {
                    return Ok(());
                }
                let id = self.meta.read().await.id.clone();
                let listing = self.mount.api.get_folder(&id).await?;
                self.sync_listing(contents, &listing).await?;
            }
        }

        contents.have_items = true;
        contents.refreshed = Some(Instant::now());
        Ok(())
    }

    /// Diff a server listing into the item map: refresh matches, insert
    /// newcomers, remove items the server no longer reports — keeping
    /// local files that were never uploaded.
    async fn sync_listing(
        self: &Arc<Self>,
        contents: &mut FolderContents,
        listing: &FolderListing,
    ) -> Result<(), FsError> {
        let parent_id = self.meta.read().await.id.clone();
        let mut incoming: BTreeSet<&str> = BTreeSet::new();

        for record in &listing.folders {
            incoming.insert(record.name.as_str());
            match contents.items.get(&record.name) {
                Some(existing) if existing.is_folder() => {
                    existing.refresh_folder(record).await;
                }
                _ => {
                    let item =
                        Item::folder_from_record(&self.mount, self, record, FolderFlavor::Plain);
                    if let Some(old) = contents.items.insert(record.name.clone(), item) {
                        old.detach().await;
                    }
                }
            }
        }

        for record in &listing.files {
            incoming.insert(record.name.as_str());
            let config = self.storage_config(&record.filesystem).await?;
            match contents.items.get(&record.name) {
                Some(existing) if !existing.is_folder() => {
                    existing.refresh_file(record).await?;
                }
                _ => {
                    let item =
                        Item::file_from_record(&self.mount, self, &parent_id, record, config);
                    if let Some(old) = contents.items.insert(record.name.clone(), item) {
                        old.detach().await;
                    }
                }
            }
        }

        // Items the server stopped reporting were deleted remotely —
        // except local files still waiting for their first flush.
        let vanished: Vec<String> = {
            let mut gone = Vec::new();
            for (name, item) in &contents.items {
                if incoming.contains(name.as_str()) {
                    continue;
                }
                let keep_pending = match &item.kind {
                    ItemKind::File(data) => !data.pages.backend().exists_on_backend(),
                    ItemKind::Folder(_) => false,
                };
                if !keep_pending {
                    gone.push(name.clone());
                }
            }
            gone
        };
        for name in vanished {
            info!(name, "remote deleted");
            if let Some(item) = contents.items.remove(&name) {
                item.detach().await;
            }
        }
        Ok(())
    }

    async fn refresh_folder(self: &Arc<Self>, record: &FolderRecord) {
        let mut meta = self.meta.write().await;
        meta.id = record.id.clone();
        meta.filesystem = record.filesystem.clone();
        meta.created = time_from_epoch(record.dates.created);
        meta.modified = record.dates.modified.map(time_from_epoch);
        meta.accessed = record.dates.accessed.map(time_from_epoch);
    }

    /// The storage config for a filesystem id; memory mode gets a
    /// permissive local default instead of asking the server.
    pub(crate) async fn storage_config(&self, fs_id: &str) -> Result<Arc<FsConfig>, FsError> {
        if self.mount.options.cache_mode == CacheMode::Memory || fs_id.is_empty() {
            return Ok(Arc::new(FsConfig {
                chunk_size: 0,
                read_only: false,
                write_mode: crate::fsconfig::WriteMode::Random,
            }));
        }
        self.mount.configs.load(self.mount.api.as_ref(), fs_id).await
    }

    fn require_mutable(&self) -> Result<(), FsError> {
        let folder = self.as_folder()?;
        if !folder.flavor.mutable() {
            return Err(FsError::Modify);
        }
        Ok(())
    }

    async fn require_writable(&self) -> Result<(), FsError> {
        self.require_mutable()?;
        if self.effective_read_only().await {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Create an empty file. The server learns about it on first flush.
    pub async fn create_file(self: &Arc<Self>, name: &str) -> Result<Arc<Item>, FsError> {
        debug!(name, "create file");
        validate_name(name)?;
        self.require_writable().await?;

        let folder = self.as_folder()?;
        let mut contents = folder.contents.write().await;
        self.load_items(&mut contents, true).await?;

        if contents.items.contains_key(name) {
            return Err(FsError::Duplicate);
        }

        let (parent_id, fs_id) = {
            let meta = self.meta.read().await;
            (meta.id.clone(), meta.filesystem.clone())
        };
        let config = self.storage_config(&fs_id).await?;
        let item = Item::file_pending(&self.mount, self, &parent_id, name, config);
        item.meta.write().await.filesystem = fs_id;

        contents.items.insert(name.to_owned(), Arc::clone(&item));
        Ok(item)
    }

    /// Create a sub-folder on the server.
    pub async fn create_folder(self: &Arc<Self>, name: &str) -> Result<Arc<Item>, FsError> {
        debug!(name, "create folder");
        validate_name(name)?;
        self.require_writable().await?;

        let folder = self.as_folder()?;
        let mut contents = folder.contents.write().await;
        self.load_items(&mut contents, true).await?;

        if contents.items.contains_key(name) {
            return Err(FsError::Duplicate);
        }

        let (parent_id, fs_id) = {
            let meta = self.meta.read().await;
            (meta.id.clone(), meta.filesystem.clone())
        };

        let item = if self.mount.options.cache_mode == CacheMode::Memory {
            Item::folder_local(&self.mount, self, name, &fs_id)
        } else {
            let record = self.mount.api.create_folder(&parent_id, name).await?;
            Item::folder_from_record(&self.mount, self, &record, FolderFlavor::Plain)
        };

        contents.items.insert(name.to_owned(), Arc::clone(&item));
        Ok(item)
    }

    /// Delete a child by name. A `NotFound` from the server is ignored:
    /// the item is already gone, which is what deletion wanted.
    pub async fn delete_item(self: &Arc<Self>, name: &str) -> Result<(), FsError> {
        debug!(name, "delete item");
        self.require_writable().await?;

        let folder = self.as_folder()?;
        let mut contents = folder.contents.write().await;
        self.load_items(&mut contents, true).await?;

        let item = contents.items.get(name).cloned().ok_or(FsError::NotFound)?;

        if self.mount.options.cache_mode != CacheMode::Memory {
            let result = match &item.kind {
                ItemKind::File(data) => {
                    let backend = data.pages.backend();
                    if backend.exists_on_backend() {
                        self.mount.api.delete_file(&backend.file_id()).await
                    } else {
                        Ok(()) // never uploaded, nothing to delete
                    }
                }
                ItemKind::Folder(_) => {
                    let id = item.meta.read().await.id.clone();
                    self.mount.api.delete_folder(&id).await
                }
            };
            match result {
                Ok(()) | Err(ApiError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        item.detach().await;
        contents.items.remove(name);
        Ok(())
    }

    /// Rename a child within this folder.
    pub async fn rename_item(
        self: &Arc<Self>,
        old_name: &str,
        new_name: &str,
        overwrite: bool,
    ) -> Result<(), FsError> {
        debug!(old_name, new_name, "rename item");
        validate_name(new_name)?;
        self.require_writable().await?;

        let folder = self.as_folder()?;
        let mut contents = folder.contents.write().await;
        self.load_items(&mut contents, true).await?;

        let item = contents
            .items
            .get(old_name)
            .cloned()
            .ok_or(FsError::NotFound)?;
        if old_name == new_name {
            return Ok(());
        }

        let duplicate = contents.items.get(new_name).cloned();
        if duplicate.is_some() && !overwrite {
            return Err(FsError::Duplicate);
        }

        if self.mount.options.cache_mode != CacheMode::Memory {
            match &item.kind {
                ItemKind::File(data) => {
                    let backend = data.pages.backend();
                    if backend.exists_on_backend() {
                        self.mount
                            .api
                            .rename_file(&backend.file_id(), new_name, overwrite)
                            .await?;
                    }
                    backend.set_name(new_name);
                }
                ItemKind::Folder(_) => {
                    let id = item.meta.read().await.id.clone();
                    self.mount.api.rename_folder(&id, new_name, overwrite).await?;
                }
            }
        } else if let ItemKind::File(data) = &item.kind {
            data.pages.backend().set_name(new_name);
        }

        item.meta.write().await.name = new_name.to_owned();

        if let Some(old) = duplicate {
            old.detach().await;
        }
        contents.items.remove(old_name);
        contents.items.insert(new_name.to_owned(), item);
        Ok(())
    }

    /// Move a child into another folder, same name. Both folders' data
    /// locks are taken in address order so two concurrent opposite moves
    /// cannot deadlock.
    pub async fn move_item(
        self: &Arc<Self>,
        name: &str,
        dest: &Arc<Item>,
        overwrite: bool,
    ) -> Result<(), FsError> {
        debug!(name, "move item");
        self.require_writable().await?;
        dest.require_writable().await?;

        if Arc::ptr_eq(self, dest) {
            return Ok(());
        }

        let src_folder = self.as_folder()?;
        let dst_folder = dest.as_folder()?;

        let (mut src_contents, mut dst_contents) =
            if (Arc::as_ptr(self) as usize) < (Arc::as_ptr(dest) as usize) {
                let a = src_folder.contents.write().await;
                let b = dst_folder.contents.write().await;
                (a, b)
            } else {
                let b = dst_folder.contents.write().await;
                let a = src_folder.contents.write().await;
                (a, b)
            };

        // No refreshing here: if one folder is nested in the other, a
        // refresh could recurse into the lock we already hold.
        self.load_items(&mut src_contents, false).await?;
        dest.load_items(&mut dst_contents, false).await?;

        let item = src_contents
            .items
            .get(name)
            .cloned()
            .ok_or(FsError::NotFound)?;

        let dest_id = dest.meta.read().await.id.clone();
        if dest_id.is_empty() && self.mount.options.cache_mode != CacheMode::Memory {
            return Err(FsError::Modify);
        }

        let duplicate = dst_contents.items.get(name).cloned();
        if duplicate.is_some() && !overwrite {
            return Err(FsError::Duplicate);
        }

        if self.mount.options.cache_mode != CacheMode::Memory {
            match &item.kind {
                ItemKind::File(data) => {
                    let backend = data.pages.backend();
                    if backend.exists_on_backend() {
                        self.mount
                            .api
                            .move_file(&backend.file_id(), &dest_id, overwrite)
                            .await?;
                    }
                    backend.set_parent(&dest_id);
                }
                ItemKind::Folder(_) => {
                    let id = item.meta.read().await.id.clone();
                    self.mount.api.move_folder(&id, &dest_id, overwrite).await?;
                }
            }
        } else if let ItemKind::File(data) = &item.kind {
            data.pages.backend().set_parent(&dest_id);
        }

        item.meta.write().await.parent = Arc::downgrade(dest);

        if let Some(old) = duplicate {
            old.detach().await;
        }
        src_contents.items.remove(name);
        dst_contents.items.insert(name.to_owned(), item);
        Ok(())
    }

    /// Flush every file in this folder and, recursively, its loaded
    /// sub-folders. Used at unmount; with `nothrow` each file's failure
    /// is logged and skipped so teardown always completes.
    pub async fn flush_tree(self: &Arc<Self>, nothrow: bool) -> Result<(), FsError> {
        let children: Vec<Arc<Item>> = {
            let folder = self.as_folder()?;
            let contents = folder.contents.read().await;
            contents.items.values().cloned().collect()
        };

        for child in children {
            match &child.kind {
                ItemKind::File(_) => child.flush_file(nothrow).await?,
                ItemKind::Folder(_) => Box::pin(child.flush_tree(nothrow)).await?,
            }
        }
        Ok(())
    }
}
