//! The synthetic top-level folders.
//!
//! The mount root is a `SuperRoot` aggregating two synthetic children:
//! `Filesystems` (one sub-folder per remote filesystem, populated from
//! `files/getfilesystems`) and `Adopted` (items shared from other
//! accounts, populated from `files/listadopted`). Filesystem roots then
//! behave like plain folders, listing through `files/getfolder`.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tracing::debug;

use crate::error::FsError;
use crate::item::{
    FolderContents, FolderData, FolderFlavor, Item, ItemKind, ItemMeta,
};
use crate::Mount;
use tokio::sync::RwLock;

fn synthetic_folder(
    mount: &Arc<Mount>,
    parent: Weak<Item>,
    name: &str,
    flavor: FolderFlavor,
) -> Arc<Item> {
    let now = SystemTime::now();
    Arc::new(Item {
        mount: Arc::clone(mount),
        kind: ItemKind::Folder(FolderData {
            flavor,
            contents: RwLock::new(FolderContents::default()),
        }),
        meta: RwLock::new(ItemMeta {
            id: String::new(),
            name: name.to_owned(),
            filesystem: String::new(),
            created: now,
            modified: None,
            accessed: None,
            read_only: true,
            deleted: false,
            parent,
        }),
    })
}

impl Item {
    /// Build the mount root.
    #[must_use]
    pub fn super_root(mount: &Arc<Mount>) -> Arc<Item> {
        synthetic_folder(mount, Weak::new(), "", FolderFlavor::SuperRoot)
    }

    /// Seed the super-root's fixed children. Populated once and never
    /// refreshed.
    pub(crate) fn populate_super_root(self: &Arc<Self>, contents: &mut FolderContents) {
        debug!("populating super root");
        for (name, flavor) in [
            ("filesystems", FolderFlavor::Filesystems),
            ("adopted", FolderFlavor::Adopted),
        ] {
            contents.items.insert(
                name.to_owned(),
                synthetic_folder(&self.mount, Arc::downgrade(self), name, flavor),
            );
        }
    }

    /// Synchronize the filesystems list: one root folder per filesystem,
    /// named after it.
    pub(crate) async fn sync_filesystems(
        self: &Arc<Self>,
        contents: &mut FolderContents,
    ) -> Result<(), FsError> {
        let records = self.mount.api.filesystems().await?;
        debug!(count = records.len(), "synchronizing filesystems");

        let mut incoming = std::collections::BTreeSet::new();
        for record in &records {
            incoming.insert(record.name.clone());

            match contents.items.get(&record.name) {
                Some(existing) if existing.is_folder() => {
                    let mut meta = existing.meta.write().await;
                    meta.id = record.rootfolder.clone();
                    meta.filesystem = record.id.clone();
                }
                _ => {
                    let folder_record = nimbus_api::FolderRecord {
                        id: record.rootfolder.clone(),
                        name: record.name.clone(),
                        filesystem: record.id.clone(),
                        dates: Default::default(),
                    };
                    let item = Item::folder_from_record(
                        &self.mount,
                        self,
                        &folder_record,
                        FolderFlavor::FilesystemRoot,
                    );
                    if let Some(old) = contents.items.insert(record.name.clone(), item) {
                        old.detach().await;
                    }
                }
            }
        }

        let vanished: Vec<String> = contents
            .items
            .keys()
            .filter(|name| !incoming.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(item) = contents.items.remove(&name) {
                item.detach().await;
            }
        }
        Ok(())
    }
}
