//! FUSE adapter: maps kernel callbacks onto the item tree.
//!
//! The kernel speaks inode numbers; the item tree speaks paths. A
//! bidirectional inode↔path table bridges the two, with folder renames
//! rebasing the paths of everything beneath them. Each callback enters
//! the async core through a runtime handle and converts any [`FsError`]
//! to `-errno` on the way out.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, instrument, warn};

use crate::error::FsError;
use crate::item::{Item, ItemAttrs};
use crate::Mount;

/// Kernel attribute cache TTL.
const TTL: Duration = Duration::from_secs(1);

/// The root inode number FUSE reserves.
const ROOT_INO: u64 = 1;

/// Bidirectional inode↔path mapping.
///
/// Two lock-free maps; the forward map is inserted first so any observer
/// that finds an inode through `bwd` can immediately resolve it.
struct InodeTable {
    fwd: scc::HashMap<u64, String>,
    bwd: scc::HashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let table = Self {
            fwd: scc::HashMap::new(),
            bwd: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        let _ = table.fwd.insert(ROOT_INO, String::new());
        let _ = table.bwd.insert(String::new(), ROOT_INO);
        table
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.fwd.read(&ino, |_, path| path.clone())
    }

    fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.bwd.read(path, |_, &ino| ino) {
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        let _ = self.fwd.insert(ino, path.to_owned());
        let _ = self.bwd.insert(path.to_owned(), ino);
        ino
    }

    /// Forget a path and everything beneath it.
    fn remove_tree(&self, path: &str) {
        let prefix = format!("{path}/");
        let mut dead = Vec::new();
        self.bwd.scan(|p, &ino| {
            if p == path || p.starts_with(&prefix) {
                dead.push((p.clone(), ino));
            }
        });
        for (p, ino) in dead {
            self.bwd.remove(&p);
            self.fwd.remove(&ino);
        }
    }

    /// Rewrite a path and everything beneath it after a rename or move,
    /// keeping inode numbers stable.
    fn rebase(&self, old_path: &str, new_path: &str) {
        let prefix = format!("{old_path}/");
        let mut moves = Vec::new();
        self.bwd.scan(|p, &ino| {
            if p == old_path {
                moves.push((p.clone(), new_path.to_owned(), ino));
            } else if p.starts_with(&prefix) {
                let rewritten = format!("{new_path}/{}", &p[prefix.len()..]);
                moves.push((p.clone(), rewritten, ino));
            }
        });
        for (old, new, ino) in moves {
            self.bwd.remove(&old);
            // A stale mapping for the destination loses to the move.
            self.bwd.remove(&new);
            let _ = self.fwd.insert(ino, new.clone());
            let _ = self.bwd.insert(new, ino);
        }
    }
}

/// The `fuser::Filesystem` implementation for one mount.
pub struct FuseAdapter {
    mount: Arc<Mount>,
    root: Arc<Item>,
    runtime: tokio::runtime::Handle,
    inodes: InodeTable,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    /// Wrap the mount root for FUSE dispatch.
    #[must_use]
    pub fn new(mount: Arc<Mount>, root: Arc<Item>, runtime: tokio::runtime::Handle) -> Self {
        // The mount presents as owned by the daemon's user.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            mount,
            root,
            runtime,
            inodes: InodeTable::new(),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
        }
    }

    fn attr_for(&self, ino: u64, attrs: &ItemAttrs) -> FileAttr {
        let perm = match (attrs.is_folder, attrs.read_only) {
            (true, false) => 0o755,
            (true, true) => 0o555,
            (false, false) => 0o644,
            (false, true) => 0o444,
        };
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: attrs.modified,
            mtime: attrs.modified,
            ctime: attrs.modified,
            crtime: attrs.created,
            kind: if attrs.is_folder {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: u32::try_from(self.mount.options.page_size).unwrap_or(4096),
            flags: 0,
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, FsError> {
        let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
        let name = name.to_str().ok_or(FsError::NotFound)?;
        if parent_path.is_empty() {
            Ok(name.to_owned())
        } else {
            Ok(format!("{parent_path}/{name}"))
        }
    }

    fn resolve_sync(&self, path: &str) -> Result<Arc<Item>, FsError> {
        let root = Arc::clone(&self.root);
        let path = path.to_owned();
        self.runtime.block_on(async move { root.resolve(&path).await })
    }
}

/// Log the failure the way its severity deserves: local-semantic errors
/// are normal operation, transport and internal ones are not.
fn report(op: &str, err: &FsError) -> i32 {
    let errno = err.errno();
    if errno == libc::EIO || errno == libc::EHOSTDOWN {
        error!(op, error = %err, "request failed");
    } else {
        debug!(op, error = %err, "request rejected");
    }
    errno
}

impl fuser::Filesystem for FuseAdapter {
    #[instrument(skip_all, fields(parent = parent, name = ?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = (|| {
            let path = self.child_path(parent, name)?;
            let item = self.resolve_sync(&path)?;
            let attrs = self.runtime.block_on(async { item.attrs().await });
            Ok((self.inodes.ino_for(&path), attrs))
        })();

        match result {
            Ok((ino, attrs)) => reply.entry(&TTL, &self.attr_for(ino, &attrs), 0),
            Err(e) => reply.error(report("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;
            Ok(self.runtime.block_on(async { item.attrs().await }))
        })();

        match result {
            Ok(attrs) => reply.attr(&TTL, &self.attr_for(ino, &attrs)),
            Err(e) => reply.error(report("getattr", &e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // The server has no mode or ownership concept; optionally
        // pretend these succeed so tools like cp -p keep working.
        if mode.is_some() && !self.mount.options.fake_chmod {
            reply.error(libc::ENOTSUP);
            return;
        }
        if (uid.is_some() || gid.is_some()) && !self.mount.options.fake_chown {
            reply.error(libc::ENOTSUP);
            return;
        }

        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;

            self.runtime.block_on(async {
                if let Some(new_size) = size {
                    item.truncate_file(new_size).await?;
                }

                if atime.is_some() || mtime.is_some() {
                    let resolve_time = |t: TimeOrNow| match t {
                        TimeOrNow::SpecificTime(t) => t,
                        TimeOrNow::Now => SystemTime::now(),
                    };
                    let mut meta = item.meta.write().await;
                    if let Some(t) = atime {
                        meta.accessed = Some(resolve_time(t));
                    }
                    if let Some(t) = mtime {
                        meta.modified = Some(resolve_time(t));
                    }
                }

                Ok::<_, FsError>(item.attrs().await)
            })
        })();

        match result {
            Ok(attrs) => reply.attr(&TTL, &self.attr_for(ino, &attrs)),
            Err(e) => reply.error(report("setattr", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = (|| {
            let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
            let name = name.to_str().ok_or(FsError::NotFound)?.to_owned();
            let folder = self.resolve_sync(&parent_path)?;

            let attrs = self.runtime.block_on(async {
                let item = folder.create_folder(&name).await?;
                Ok::<_, FsError>(item.attrs().await)
            })?;

            let path = self.child_path(parent, OsStr::new(&name))?;
            Ok((self.inodes.ino_for(&path), attrs))
        })();

        match result {
            Ok((ino, attrs)) => reply.entry(&TTL, &self.attr_for(ino, &attrs), 0),
            Err(e) => reply.error(report("mkdir", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = (|| {
            let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
            let name = name.to_str().ok_or(FsError::NotFound)?.to_owned();
            let folder = self.resolve_sync(&parent_path)?;

            let attrs = self.runtime.block_on(async {
                let item = folder.create_file(&name).await?;
                Ok::<_, FsError>(item.attrs().await)
            })?;

            let path = self.child_path(parent, OsStr::new(&name))?;
            Ok((self.inodes.ino_for(&path), attrs))
        })();

        match result {
            Ok((ino, attrs)) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                reply.created(&TTL, &self.attr_for(ino, &attrs), 0, fh, 0);
            }
            Err(e) => reply.error(report("create", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = (|| {
            let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
            let child = self.child_path(parent, name)?;
            let name = name.to_str().ok_or(FsError::NotFound)?.to_owned();
            let folder = self.resolve_sync(&parent_path)?;

            self.runtime.block_on(async {
                let item = folder.resolve(&name).await?;
                item.as_file()?;
                folder.delete_item(&name).await
            })?;

            self.inodes.remove_tree(&child);
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = (|| {
            let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
            let child = self.child_path(parent, name)?;
            let name = name.to_str().ok_or(FsError::NotFound)?.to_owned();
            let folder = self.resolve_sync(&parent_path)?;

            self.runtime.block_on(async {
                let item = folder.resolve(&name).await?;
                item.as_folder()?;
                folder.delete_item(&name).await
            })?;

            self.inodes.remove_tree(&child);
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("rmdir", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        #[cfg(target_os = "linux")]
        if flags & libc::RENAME_EXCHANGE != 0 {
            reply.error(libc::ENOTSUP);
            return;
        }
        #[cfg(target_os = "linux")]
        let overwrite = flags & libc::RENAME_NOREPLACE == 0;
        #[cfg(not(target_os = "linux"))]
        let overwrite = flags == 0;

        let result = (|| {
            let name = name.to_str().ok_or(FsError::NotFound)?.to_owned();
            let newname = newname.to_str().ok_or(FsError::NotFound)?.to_owned();
            let old_child = self.child_path(parent, OsStr::new(&name))?;
            let new_child = self.child_path(newparent, OsStr::new(&newname))?;

            let parent_path = self.inodes.path_of(parent).ok_or(FsError::NotFound)?;
            let newparent_path = self.inodes.path_of(newparent).ok_or(FsError::NotFound)?;

            if parent == newparent {
                let folder = self.resolve_sync(&parent_path)?;
                self.runtime
                    .block_on(async { folder.rename_item(&name, &newname, overwrite).await })?;
            } else if name == newname {
                let source = self.resolve_sync(&parent_path)?;
                let dest = self.resolve_sync(&newparent_path)?;
                self.runtime
                    .block_on(async { source.move_item(&name, &dest, overwrite).await })?;
            } else {
                // A combined rename-and-move would need a compound server
                // transaction that does not exist yet.
                warn!("simultaneous rename and move is unsupported");
                return Err(FsError::Backend(nimbus_api::ApiError::Api {
                    code: 0,
                    message: "rename+move".to_owned(),
                }));
            }

            self.inodes.rebase(&old_child, &new_child);
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;
            item.as_file()?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.opened(self.next_fh.fetch_add(1, Ordering::Relaxed), 0),
            Err(e) => reply.error(report("open", &e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;
            let offset = u64::try_from(offset).map_err(|_| FsError::ReadBounds)?;
            self.runtime
                .block_on(async { item.read_bytes(offset, size as usize).await })
        })();

        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(report("read", &e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;
            let offset = u64::try_from(offset).map_err(|_| FsError::ReadBounds)?;
            self.runtime
                .block_on(async { item.write_bytes(offset, data).await })?;
            Ok(u32::try_from(data.len()).unwrap_or(u32::MAX))
        })();

        match result {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(report("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.fsync_common(ino, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.fsync_common(ino, reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // The last reference is going away; push dirty data out but never
        // fail the close.
        if let Some(path) = self.inodes.path_of(ino) {
            if let Ok(item) = self.resolve_sync(&path) {
                let _ = self
                    .runtime
                    .block_on(async { item.flush_file(true).await });
            }
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let folder = self.resolve_sync(&path)?;
            let entries = self
                .runtime
                .block_on(async { folder.folder_entries().await })?;

            let mut listing: Vec<(u64, FileType, String)> = Vec::with_capacity(entries.len() + 2);
            for (name, item) in entries {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                let kind = if item.is_folder() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                listing.push((self.inodes.ino_for(&child_path), kind, name));
            }
            listing.push((ino, FileType::Directory, ".".to_owned()));
            listing.push((ino, FileType::Directory, "..".to_owned()));
            Ok(listing)
        })();

        match result {
            Ok(listing) => {
                let start = usize::try_from(offset).unwrap_or(0);
                for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(start) {
                    if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(report("readdir", &e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // The server does not report capacity; only the name limit is
        // meaningful.
        reply.statfs(0, 0, 0, 0, 0, 4096, 255, 4096);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            let read_only = (|| {
                let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
                let item = self.resolve_sync(&path)?;
                Ok::<_, FsError>(self.runtime.block_on(async { item.effective_read_only().await }))
            })();
            match read_only {
                Ok(true) => {
                    reply.error(libc::EROFS);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    reply.error(report("access", &e));
                    return;
                }
            }
        }
        reply.ok();
    }
}

impl FuseAdapter {
    fn fsync_common(&mut self, ino: u64, reply: ReplyEmpty) {
        let result = (|| {
            let path = self.inodes.path_of(ino).ok_or(FsError::NotFound)?;
            let item = self.resolve_sync(&path)?;
            if item.is_folder() {
                return Ok(());
            }
            self.runtime.block_on(async { item.flush_file(false).await })
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("flush", &e)),
        }
    }
}

/// Mount the adapter and serve kernel requests until unmounted.
///
/// # Errors
/// Any `fuser` session setup failure.
pub fn serve(
    adapter: FuseAdapter,
    mountpoint: &Path,
    read_only: bool,
    extra_options: &[String],
) -> std::io::Result<()> {
    let mut options = vec![
        MountOption::FSName("nimbus-fs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if read_only {
        options.push(MountOption::RO);
    }
    for opt in extra_options {
        options.push(match opt.as_str() {
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            other => MountOption::CUSTOM(other.to_owned()),
        });
    }

    fuser::mount2(adapter, mountpoint, &options)
}
