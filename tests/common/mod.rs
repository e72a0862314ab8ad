#![allow(dead_code, clippy::unwrap_used, missing_docs)]
//! Shared test fixtures: an in-memory mock server and mount builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use nimbus_api::{
    AccountLimits, ApiError, FileRecord, FilesystemRecord, FolderListing, FolderRecord,
    ItemDates, ObjectApi, ServerConfig, StorageRecord,
};
use nimbus_fs::config::{CacheOptions, ConfigOptions};
use nimbus_fs::filedata::cache_manager::CacheManager;
use nimbus_fs::item::Item;
use nimbus_fs::Mount;

/// One object in the mock store.
#[derive(Debug, Clone)]
struct Obj {
    name: String,
    parent: String,
    folder: bool,
    data: Vec<u8>,
}

struct Store {
    objects: HashMap<String, Obj>,
    next_id: u64,
}

/// In-memory nimbus server with call counters and fault injection.
pub struct MockApi {
    store: Mutex<Store>,
    /// Storage kind reported by `files/getconfig`.
    pub sttype: String,
    /// When set, uploads and writes larger than this fail with a
    /// size-limit error.
    pub body_limit: Mutex<Option<usize>>,

    pub downloads: AtomicU64,
    pub download_ranges: Mutex<Vec<(u64, u64)>>,
    pub uploads: AtomicU64,
    pub write_calls: AtomicU64,
    pub write_log: Mutex<Vec<(u64, usize)>>,
}

impl MockApi {
    pub fn new(sttype: &str) -> Arc<Self> {
        let mut objects = HashMap::new();
        objects.insert(
            "root".to_owned(),
            Obj {
                name: "main".to_owned(),
                parent: String::new(),
                folder: true,
                data: Vec::new(),
            },
        );
        Arc::new(Self {
            store: Mutex::new(Store {
                objects,
                next_id: 1,
            }),
            sttype: sttype.to_owned(),
            body_limit: Mutex::new(None),
            downloads: AtomicU64::new(0),
            download_ranges: Mutex::new(Vec::new()),
            uploads: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
            write_log: Mutex::new(Vec::new()),
        })
    }

    /// Insert a file directly into the store, bypassing the client.
    pub fn seed_file(&self, parent: &str, name: &str, data: &[u8]) -> String {
        let mut store = self.store.lock().unwrap();
        let id = format!("f{}", store.next_id);
        store.next_id += 1;
        store.objects.insert(
            id.clone(),
            Obj {
                name: name.to_owned(),
                parent: parent.to_owned(),
                folder: false,
                data: data.to_vec(),
            },
        );
        id
    }

    /// Remove an object directly (simulates a remote deletion).
    pub fn remove_object(&self, id: &str) {
        self.store.lock().unwrap().objects.remove(id);
    }

    /// (Re)insert a file under a fixed id.
    pub fn seed_with_id(&self, id: &str, parent: &str, name: &str, data: &[u8]) {
        self.store.lock().unwrap().objects.insert(
            id.to_owned(),
            Obj {
                name: name.to_owned(),
                parent: parent.to_owned(),
                folder: false,
                data: data.to_vec(),
            },
        );
    }

    /// The raw stored bytes of a file.
    pub fn stored_data(&self, id: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .objects
            .get(id)
            .map(|o| o.data.clone())
    }

    /// Find a file id by parent and name.
    pub fn find(&self, parent: &str, name: &str) -> Option<String> {
        let store = self.store.lock().unwrap();
        store
            .objects
            .iter()
            .find(|(_, o)| o.parent == parent && o.name == name)
            .map(|(id, _)| id.clone())
    }

    fn check_limit(&self, len: usize) -> Result<(), ApiError> {
        if let Some(limit) = *self.body_limit.lock().unwrap() {
            if len > limit {
                return Err(ApiError::Api {
                    code: 413,
                    message: "INPUT_TOO_LARGE".to_owned(),
                });
            }
        }
        Ok(())
    }

    fn file_record(id: &str, obj: &Obj) -> FileRecord {
        FileRecord {
            id: id.to_owned(),
            name: obj.name.clone(),
            size: obj.data.len() as u64,
            filesystem: "fs1".to_owned(),
            dates: ItemDates::default(),
        }
    }

    fn folder_record(id: &str, obj: &Obj) -> FolderRecord {
        FolderRecord {
            id: id.to_owned(),
            name: obj.name.clone(),
            filesystem: "fs1".to_owned(),
            dates: ItemDates::default(),
        }
    }
}

#[async_trait]
impl ObjectApi for MockApi {
    async fn server_config(&self) -> Result<ServerConfig, ApiError> {
        Ok(ServerConfig {
            apiversion: 2,
            readonly: false,
        })
    }

    async fn account_limits(&self) -> Result<AccountLimits, ApiError> {
        Ok(AccountLimits {
            upload_maxbytes: None,
        })
    }

    async fn storage_config(&self, _fs_id: &str) -> Result<StorageRecord, ApiError> {
        Ok(StorageRecord {
            chunksize: None,
            readonly: false,
            sttype: self.sttype.clone(),
        })
    }

    async fn filesystems(&self) -> Result<Vec<FilesystemRecord>, ApiError> {
        Ok(vec![FilesystemRecord {
            id: "fs1".to_owned(),
            name: "main".to_owned(),
            rootfolder: "root".to_owned(),
        }])
    }

    async fn list_adopted(&self) -> Result<FolderListing, ApiError> {
        Ok(FolderListing::default())
    }

    async fn get_folder(&self, id: &str) -> Result<FolderListing, ApiError> {
        let store = self.store.lock().unwrap();
        if !store.objects.contains_key(id) {
            return Err(ApiError::NotFound("UNKNOWN_FOLDER".to_owned()));
        }

        let mut listing = FolderListing::default();
        for (oid, obj) in &store.objects {
            if obj.parent != id {
                continue;
            }
            if obj.folder {
                listing.folders.push(Self::folder_record(oid, obj));
            } else {
                listing.files.push(Self::file_record(oid, obj));
            }
        }
        Ok(listing)
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<FolderRecord, ApiError> {
        let mut store = self.store.lock().unwrap();
        let id = format!("d{}", store.next_id);
        store.next_id += 1;
        let obj = Obj {
            name: name.to_owned(),
            parent: parent.to_owned(),
            folder: true,
            data: Vec::new(),
        };
        store.objects.insert(id.clone(), obj.clone());
        Ok(Self::folder_record(&id, &obj))
    }

    async fn create_file(&self, parent: &str, name: &str) -> Result<FileRecord, ApiError> {
        let mut store = self.store.lock().unwrap();
        let id = format!("f{}", store.next_id);
        store.next_id += 1;
        let obj = Obj {
            name: name.to_owned(),
            parent: parent.to_owned(),
            folder: false,
            data: Vec::new(),
        };
        store.objects.insert(id.clone(), obj.clone());
        Ok(Self::file_record(&id, &obj))
    }

    async fn upload(
        &self,
        parent: &str,
        name: &str,
        data: Bytes,
        overwrite: bool,
    ) -> Result<FileRecord, ApiError> {
        self.check_limit(data.len())?;
        self.uploads.fetch_add(1, Ordering::Relaxed);

        let mut store = self.store.lock().unwrap();
        let existing = store
            .objects
            .iter()
            .find(|(_, o)| o.parent == parent && o.name == name && !o.folder)
            .map(|(id, _)| id.clone());

        let id = match existing {
            Some(id) if overwrite => id,
            Some(_) => {
                return Err(ApiError::Api {
                    code: 400,
                    message: "ITEM_EXISTS".to_owned(),
                })
            }
            None => {
                let id = format!("f{}", store.next_id);
                store.next_id += 1;
                id
            }
        };

        let obj = Obj {
            name: name.to_owned(),
            parent: parent.to_owned(),
            folder: false,
            data: data.to_vec(),
        };
        store.objects.insert(id.clone(), obj.clone());
        Ok(Self::file_record(&id, &obj))
    }

    async fn write_file(&self, id: &str, offset: u64, data: Bytes) -> Result<FileRecord, ApiError> {
        self.check_limit(data.len())?;
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.write_log
            .lock()
            .unwrap()
            .push((offset, data.len()));

        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;

        let offset = usize::try_from(offset).unwrap();
        if obj.data.len() < offset + data.len() {
            obj.data.resize(offset + data.len(), 0);
        }
        obj.data[offset..offset + data.len()].copy_from_slice(&data);
        let record = Self::file_record(id, obj);
        Ok(record)
    }

    async fn truncate_file(&self, id: &str, size: u64) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;
        obj.data.resize(usize::try_from(size).unwrap(), 0);
        Ok(())
    }

    async fn download(&self, id: &str, fstart: u64, flast: u64) -> Result<Bytes, ApiError> {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.download_ranges.lock().unwrap().push((fstart, flast));

        let store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;

        let start = usize::try_from(fstart).unwrap().min(obj.data.len());
        let end = usize::try_from(flast + 1).unwrap().min(obj.data.len());
        Ok(Bytes::copy_from_slice(&obj.data[start..end]))
    }

    async fn rename_file(&self, id: &str, name: &str, _overwrite: bool) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;
        obj.name = name.to_owned();
        Ok(())
    }

    async fn rename_folder(&self, id: &str, name: &str, _overwrite: bool) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FOLDER".to_owned()))?;
        obj.name = name.to_owned();
        Ok(())
    }

    async fn move_file(&self, id: &str, parent: &str, _overwrite: bool) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;
        obj.parent = parent.to_owned();
        Ok(())
    }

    async fn move_folder(&self, id: &str, parent: &str, _overwrite: bool) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let obj = store
            .objects
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FOLDER".to_owned()))?;
        obj.parent = parent.to_owned();
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        store
            .objects
            .remove(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FILE".to_owned()))?;
        Ok(())
    }

    async fn delete_folder(&self, id: &str) -> Result<(), ApiError> {
        let mut store = self.store.lock().unwrap();
        let dead = store
            .objects
            .remove(id)
            .ok_or_else(|| ApiError::NotFound("UNKNOWN_FOLDER".to_owned()))?;
        debug_assert!(dead.folder);
        // The server deletes recursively.
        let children: Vec<String> = store
            .objects
            .iter()
            .filter(|(_, o)| o.parent == id)
            .map(|(oid, _)| oid.clone())
            .collect();
        for child in children {
            store.objects.remove(&child);
        }
        Ok(())
    }
}

/// One assembled mount over a mock server.
pub struct Fixture {
    pub api: Arc<MockApi>,
    pub mount: Arc<Mount>,
    pub root: Arc<Item>,
    pub cache: Arc<CacheManager>,
}

impl Fixture {
    /// Random-write storage, 4 KiB pages, roomy cache.
    pub fn new() -> Self {
        Self::with(
            "local",
            ConfigOptions {
                page_size: 4096,
                ..ConfigOptions::default()
            },
            CacheOptions::default(),
        )
    }

    pub fn with(sttype: &str, options: ConfigOptions, cache_opts: CacheOptions) -> Self {
        let api = MockApi::new(sttype);
        let cache = CacheManager::spawn(cache_opts);
        let mount = Mount::new(
            Arc::clone(&api) as Arc<dyn ObjectApi>,
            options,
            Arc::clone(&cache),
            None,
        );
        let root = Item::super_root(&mount);
        Self {
            api,
            mount,
            root,
            cache,
        }
    }

    /// The root folder of the single mock filesystem.
    pub async fn fs_root(&self) -> Arc<Item> {
        self.root
            .resolve_folder("filesystems/main")
            .await
            .expect("filesystem root")
    }
}

/// Give background cache workers a moment to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
