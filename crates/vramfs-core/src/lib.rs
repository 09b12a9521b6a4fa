#![forbid(unsafe_code)]
//! The vramfs engine.
//!
//! An in-memory filesystem index whose file contents live in device
//! buffers reached only through an asynchronous command queue. [`VramFs`]
//! is the facade a host filesystem adapter drives: path-based metadata
//! operations plus handle-based read/write/fsync on open files.
//!
//! # Concurrency
//!
//! One global mutex serializes every operation. The single concession to
//! reader throughput is inside [`VramFs::read`], which releases the lock
//! around each per-block device transfer and re-acquires it before
//! touching shared state again. Open-file sessions hold strong references
//! to their entry, so reads and writes keep working after an unlink.

mod block;
mod entry;
mod file;
mod pool;

pub use block::Block;
pub use pool::BlockPool;

use entry::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;
use vramfs_device::ComputeDevice;
use vramfs_error::{Result, VramError};
use vramfs_types::{EntryKind, FsStats, KindFilter, BLOCK_SIZE, NAME_MAX, STAT_BLOCK_UNIT};

/// Stat-shaped view of one entry.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub kind: EntryKind,
    pub size: u64,
    /// 512-byte stat units, reported for files only.
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub block_size: u32,
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

struct FsInner {
    next_handle: u64,
    /// Open-file sessions; the strong reference keeps unlinked files
    /// readable and writable until release.
    handles: HashMap<u64, Arc<Entry>>,
}

/// The engine facade.
pub struct VramFs {
    root: Arc<Entry>,
    pool: BlockPool,
    inner: Mutex<FsInner>,
}

/// Split an absolute path into its parent directory and final name.
fn split_path(path: &OsStr) -> (OsString, OsString) {
    let bytes = path.as_bytes();
    match bytes.iter().rposition(|byte| *byte == b'/') {
        Some(pos) => {
            let dir = if pos == 0 { b"/".to_vec() } else { bytes[..pos].to_vec() };
            (
                OsString::from_vec(dir),
                OsString::from_vec(bytes[pos + 1..].to_vec()),
            )
        }
        None => (OsString::from("/"), path.to_owned()),
    }
}

fn count_entries(entry: &Arc<Entry>) -> u64 {
    let mut count = 1;
    if let Some(dir) = entry.as_dir() {
        let children: Vec<Arc<Entry>> = dir.lock().children.values().cloned().collect();
        for child in &children {
            count += count_entries(child);
        }
    }
    count
}

impl VramFs {
    /// Build an empty filesystem on `device`.
    ///
    /// The root is owned by uid/gid 0 until the adapter assigns the
    /// mounting user via [`VramFs::chown`]. Reserve VRAM with
    /// [`VramFs::reserve`] before mounting.
    #[must_use]
    pub fn new(device: Arc<dyn ComputeDevice>) -> Self {
        Self {
            root: Entry::root(0, 0),
            pool: BlockPool::new(device),
            inner: Mutex::new(FsInner {
                next_handle: 1,
                handles: HashMap::new(),
            }),
        }
    }

    /// Pre-allocate pool buffers for `bytes` of file content.
    ///
    /// Returns the bytes actually reserved, which is less than requested
    /// when the device runs out of memory.
    pub fn reserve(&self, bytes: u64) -> u64 {
        let _guard = self.inner.lock();
        self.pool.grow(bytes)
    }

    pub fn statfs(&self) -> FsStats {
        let _guard = self.inner.lock();
        FsStats {
            block_size: BLOCK_SIZE as u32,
            total_blocks: self.pool.total_blocks(),
            free_blocks: self.pool.free_blocks(),
            entries: count_entries(&self.root),
            name_max: NAME_MAX,
        }
    }

    pub fn getattr(&self, path: &OsStr) -> Result<Attributes> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::ANY)?;
        Ok(Self::attributes(&entry))
    }

    pub fn readlink(&self, path: &OsStr) -> Result<OsString> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::SYMLINK)?;
        let target = entry
            .symlink_target()
            .ok_or(VramError::NotPermitted)?
            .to_owned();
        Ok(target)
    }

    pub fn chmod(&self, path: &OsStr, mode: u32) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(
            &self.root,
            path,
            KindFilter::FILE | KindFilter::DIRECTORY,
        )?;
        {
            let mut meta = entry.meta.lock();
            meta.mode = mode & 0o7777;
            meta.ctime = SystemTime::now();
        }
        Ok(())
    }

    pub fn chown(&self, path: &OsStr, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(
            &self.root,
            path,
            KindFilter::FILE | KindFilter::DIRECTORY,
        )?;
        {
            let mut meta = entry.meta.lock();
            if let Some(uid) = uid {
                meta.uid = uid;
            }
            if let Some(gid) = gid {
                meta.gid = gid;
            }
            meta.ctime = SystemTime::now();
        }
        Ok(())
    }

    /// Set access and modification times verbatim; ctime follows the clock.
    pub fn utimens(
        &self,
        path: &OsStr,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(
            &self.root,
            path,
            KindFilter::FILE | KindFilter::DIRECTORY,
        )?;
        {
            let mut meta = entry.meta.lock();
            if let Some(atime) = atime {
                meta.atime = atime;
            }
            if let Some(mtime) = mtime {
                meta.mtime = mtime;
            }
            meta.ctime = SystemTime::now();
        }
        Ok(())
    }

    /// List a directory: `.`, `..`, then each child.
    pub fn readdir(&self, path: &OsStr) -> Result<Vec<DirEntry>> {
        let _guard = self.inner.lock();
        let dir = Entry::resolve(&self.root, path, KindFilter::DIRECTORY)?;

        let mut entries = vec![
            DirEntry {
                name: OsString::from("."),
                kind: EntryKind::Directory,
            },
            DirEntry {
                name: OsString::from(".."),
                kind: EntryKind::Directory,
            },
        ];
        // The directory filter guarantees a directory body.
        if let Some(body) = dir.as_dir() {
            for (name, child) in &body.lock().children {
                entries.push(DirEntry {
                    name: name.clone(),
                    kind: child.kind(),
                });
            }
        }
        dir.touch_atime();
        Ok(entries)
    }

    /// Create a file and open a session on it.
    ///
    /// An existing file or symlink at `path` is replaced; a directory is
    /// an error.
    pub fn create(&self, path: &OsStr, mode: u32, uid: u32, gid: u32) -> Result<u64> {
        let mut inner = self.inner.lock();

        match Entry::resolve(&self.root, path, KindFilter::ANY) {
            Ok(existing) => {
                if existing.kind() == EntryKind::Directory {
                    return Err(VramError::IsDirectory);
                }
                existing.detach();
            }
            Err(VramError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let (parent_path, name) = split_path(path);
        let parent = Entry::resolve(&self.root, &parent_path, KindFilter::DIRECTORY)?;
        parent.touch_mtime_ctime();

        let entry = Entry::new_file(&parent, &name, mode & 0o7777, uid, gid);
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, entry);
        Ok(handle)
    }

    pub fn mkdir(&self, path: &OsStr, mode: u32, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.inner.lock();

        match Entry::resolve(&self.root, path, KindFilter::ANY) {
            Ok(_) => return Err(VramError::Exists),
            Err(VramError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let (parent_path, name) = split_path(path);
        let parent = Entry::resolve(&self.root, &parent_path, KindFilter::DIRECTORY)?;
        parent.touch_mtime_ctime();

        Entry::new_dir(&parent, &name, mode & 0o7777, uid, gid);
        Ok(())
    }

    /// Create a symlink; the target is stored uninterpreted.
    pub fn symlink(&self, target: &OsStr, path: &OsStr, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.inner.lock();

        match Entry::resolve(&self.root, path, KindFilter::ANY) {
            Ok(_) => return Err(VramError::Exists),
            Err(VramError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let (parent_path, name) = split_path(path);
        let parent = Entry::resolve(&self.root, &parent_path, KindFilter::DIRECTORY)?;
        parent.touch_mtime_ctime();

        Entry::new_symlink(&parent, &name, target, uid, gid);
        Ok(())
    }

    pub fn unlink(&self, path: &OsStr) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::FILE | KindFilter::SYMLINK)?;
        entry.detach();
        Ok(())
    }

    pub fn rmdir(&self, path: &OsStr) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::DIRECTORY)?;
        // The directory filter guarantees a directory body.
        if let Some(body) = entry.as_dir() {
            if !body.lock().children.is_empty() {
                return Err(VramError::NotEmpty);
            }
        }
        entry.detach();
        Ok(())
    }

    /// Move `from` to `to`, replacing any entry already at `to`.
    pub fn rename(&self, from: &OsStr, to: &OsStr) -> Result<()> {
        let _guard = self.inner.lock();

        let entry = Entry::resolve(&self.root, from, KindFilter::ANY)?;
        if Arc::ptr_eq(&entry, &self.root) {
            return Err(VramError::NotPermitted);
        }

        let (parent_path, new_name) = split_path(to);
        let new_parent = Entry::resolve(&self.root, &parent_path, KindFilter::DIRECTORY)?;
        new_parent.touch_mtime_ctime();

        if let Ok(existing) = Entry::resolve(&self.root, to, KindFilter::ANY) {
            if !Arc::ptr_eq(&existing, &entry) {
                existing.detach();
            }
        }

        entry.move_to(&new_parent, &new_name);
        entry.touch_ctime();
        Ok(())
    }

    /// Open a session on an existing file.
    pub fn open(&self, path: &OsStr) -> Result<u64> {
        let mut inner = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::FILE)?;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, entry);
        Ok(handle)
    }

    /// Read up to `len` bytes at `offset`, clamped to the file size.
    ///
    /// Unpopulated ranges read as zeros. The global lock is released
    /// around each per-block device transfer.
    pub fn read(&self, handle: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock();
        let entry = guard
            .handles
            .get(&handle)
            .cloned()
            .ok_or(VramError::BadHandle)?;
        let file = entry.as_file().ok_or(VramError::BadHandle)?;

        let file_size = file.lock().size();
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let len = len.min(file_size - offset);
        let mut out = vec![0_u8; len as usize];

        let bs = BLOCK_SIZE as u64;
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let block_start = (pos / bs) * bs;
            let block_off = pos - block_start;
            let slice_len = (bs - block_off).min(end - pos);
            let block = file.lock().block_at(block_start);

            // Let independent operations at the index while the transfer
            // is on the wire; a hole needs no transfer and `out` is
            // already zeroed.
            drop(guard);
            if let Some(block) = &block {
                let filled = (pos - offset) as usize;
                block.read(
                    block_off as usize,
                    &mut out[filled..filled + slice_len as usize],
                )?;
            }
            guard = self.inner.lock();

            pos += slice_len;
        }

        entry.touch_atime();
        Ok(out)
    }

    /// Write `data` at `offset`.
    ///
    /// Returns the bytes written, which is less than `data.len()` when the
    /// pool runs dry mid-walk; `OutOfVram` is returned only when nothing
    /// could be written at all.
    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let guard = self.inner.lock();
        let entry = guard
            .handles
            .get(&handle)
            .cloned()
            .ok_or(VramError::BadHandle)?;
        let file = entry.as_file().ok_or(VramError::BadHandle)?;

        let bs = BLOCK_SIZE as u64;
        let end = offset + data.len() as u64;
        let mut pos = offset;

        {
            let mut body = file.lock();
            while pos < end {
                let block_start = (pos / bs) * bs;
                let block_off = pos - block_start;
                let slice_len = (bs - block_off).min(end - pos);
                let Some(block) = body.block_at_or_alloc(block_start, &self.pool) else {
                    debug!(
                        target: "vramfs::fs",
                        written = pos - offset,
                        requested = data.len(),
                        "write stopped, out of VRAM"
                    );
                    break;
                };
                let consumed = (pos - offset) as usize;
                block.write(
                    block_off as usize,
                    &data[consumed..consumed + slice_len as usize],
                    false,
                )?;
                body.note_write(block_start, &block);
                pos += slice_len;
            }
            if pos > offset {
                body.grow_to(pos);
            }
        }

        let written = (pos - offset) as usize;
        if written == 0 {
            if pos < end {
                return Err(VramError::OutOfVram);
            }
            return Ok(0);
        }
        entry.touch_mtime();
        Ok(written)
    }

    /// Wait until the session's most recent write has hit the device.
    pub fn fsync(&self, handle: u64) -> Result<()> {
        let guard = self.inner.lock();
        let entry = guard
            .handles
            .get(&handle)
            .cloned()
            .ok_or(VramError::BadHandle)?;
        let file = entry.as_file().ok_or(VramError::BadHandle)?;
        let result = file.lock().sync();
        result
    }

    /// Close a session. The entry's blocks return to the pool once the
    /// last reference is gone.
    pub fn release(&self, handle: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.handles.remove(&handle);
        Ok(())
    }

    pub fn truncate(&self, path: &OsStr, size: u64) -> Result<()> {
        let _guard = self.inner.lock();
        let entry = Entry::resolve(&self.root, path, KindFilter::FILE)?;
        let file = entry.as_file().ok_or(VramError::NotFound)?;
        file.lock().truncate(size);
        entry.touch_mtime_ctime();
        Ok(())
    }

    fn attributes(entry: &Arc<Entry>) -> Attributes {
        let kind = entry.kind();
        let size = entry.size();
        let meta = entry.meta.lock();
        Attributes {
            kind,
            size,
            blocks: if kind == EntryKind::File {
                size.div_ceil(STAT_BLOCK_UNIT)
            } else {
                0
            },
            mode: meta.mode,
            nlink: if kind == EntryKind::Directory { 2 } else { 1 },
            uid: meta.uid,
            gid: meta.gid,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            block_size: BLOCK_SIZE as u32,
        }
    }
}
