//! The filesystem entry tree.
//!
//! Tagged-variant nodes (file, directory, symlink) with shared metadata.
//! Parents own their children through the directory map; the child's back
//! reference is a `Weak`, so reachability from the root is the only thing
//! keeping a subtree alive (plus any open-file session handles).
//!
//! All structural mutation happens under the engine's global lock; the
//! per-entry mutexes only satisfy interior mutability.

use crate::file::FileBody;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use vramfs_error::{Result, VramError};
use vramfs_types::{EntryKind, KindFilter};

pub(crate) struct Metadata {
    pub name: OsString,
    pub parent: Weak<Entry>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

pub(crate) struct DirBody {
    pub children: HashMap<OsString, Arc<Entry>>,
}

pub(crate) enum Body {
    File(Mutex<FileBody>),
    Directory(Mutex<DirBody>),
    Symlink(OsString),
}

/// Reported size of every directory.
const DIR_SIZE: u64 = 4096;

pub struct Entry {
    pub(crate) meta: Mutex<Metadata>,
    pub(crate) body: Body,
}

impl Entry {
    fn alloc(name: &OsStr, parent: Weak<Entry>, mode: u32, uid: u32, gid: u32, body: Body) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new(Self {
            meta: Mutex::new(Metadata {
                name: name.to_owned(),
                parent,
                mode,
                uid,
                gid,
                atime: now,
                mtime: now,
                ctime: now,
            }),
            body,
        })
    }

    fn link(parent: &Arc<Entry>, name: &OsStr, child: &Arc<Entry>) {
        if let Body::Directory(dir) = &parent.body {
            dir.lock().children.insert(name.to_owned(), Arc::clone(child));
        }
    }

    /// The root directory. Its name is empty and it has no parent.
    pub(crate) fn root(uid: u32, gid: u32) -> Arc<Self> {
        Self::alloc(
            OsStr::new(""),
            Weak::new(),
            0o755,
            uid,
            gid,
            Body::Directory(Mutex::new(DirBody {
                children: HashMap::new(),
            })),
        )
    }

    /// Create a file entry linked under `parent`.
    ///
    /// The caller must have checked the name is free.
    pub(crate) fn new_file(
        parent: &Arc<Entry>,
        name: &OsStr,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        let entry = Self::alloc(
            name,
            Arc::downgrade(parent),
            mode,
            uid,
            gid,
            Body::File(Mutex::new(FileBody::new())),
        );
        Self::link(parent, name, &entry);
        entry
    }

    pub(crate) fn new_dir(
        parent: &Arc<Entry>,
        name: &OsStr,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        let entry = Self::alloc(
            name,
            Arc::downgrade(parent),
            mode,
            uid,
            gid,
            Body::Directory(Mutex::new(DirBody {
                children: HashMap::new(),
            })),
        );
        Self::link(parent, name, &entry);
        entry
    }

    /// Symlinks carry a fixed 0777 mode; the target is immutable.
    pub(crate) fn new_symlink(
        parent: &Arc<Entry>,
        name: &OsStr,
        target: &OsStr,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        let entry = Self::alloc(
            name,
            Arc::downgrade(parent),
            0o777,
            uid,
            gid,
            Body::Symlink(target.to_owned()),
        );
        Self::link(parent, name, &entry);
        entry
    }

    pub(crate) fn kind(&self) -> EntryKind {
        match &self.body {
            Body::File(_) => EntryKind::File,
            Body::Directory(_) => EntryKind::Directory,
            Body::Symlink(_) => EntryKind::Symlink,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match &self.body {
            Body::File(file) => file.lock().size(),
            Body::Directory(_) => DIR_SIZE,
            Body::Symlink(target) => target.as_bytes().len() as u64,
        }
    }

    pub(crate) fn as_file(&self) -> Option<&Mutex<FileBody>> {
        match &self.body {
            Body::File(file) => Some(file),
            _ => None,
        }
    }

    pub(crate) fn as_dir(&self) -> Option<&Mutex<DirBody>> {
        match &self.body {
            Body::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub(crate) fn symlink_target(&self) -> Option<&OsStr> {
        match &self.body {
            Body::Symlink(target) => Some(target),
            _ => None,
        }
    }

    /// Resolve an absolute `/`-separated path starting at `root`, then check
    /// the found entry's kind against `filter`.
    ///
    /// An excluded kind maps to the most specific error: a file where a
    /// symlink was acceptable is `NotFound`, a directory where a file was
    /// expected is `IsDirectory`, a file where a directory was expected is
    /// `NotDirectory`, and symlink operations on anything else are
    /// `NotPermitted`. An empty filter matches nothing.
    pub(crate) fn resolve(
        root: &Arc<Entry>,
        path: &OsStr,
        filter: KindFilter,
    ) -> Result<Arc<Entry>> {
        if filter.is_empty() {
            return Err(VramError::NotFound);
        }

        let bytes = path.as_bytes();
        let rel = bytes.strip_prefix(b"/").unwrap_or(bytes);

        let mut current = Arc::clone(root);
        for part in rel.split(|byte| *byte == b'/') {
            if part.is_empty() {
                continue;
            }
            let next = match &current.body {
                Body::Directory(dir) => dir.lock().children.get(OsStr::from_bytes(part)).cloned(),
                _ => return Err(VramError::NotDirectory),
            };
            current = next.ok_or(VramError::NotFound)?;
        }

        let kind = current.kind();
        if !filter.contains(kind) {
            return Err(Self::filter_mismatch(kind, filter));
        }
        Ok(current)
    }

    fn filter_mismatch(kind: EntryKind, filter: KindFilter) -> VramError {
        match kind {
            EntryKind::File => {
                if filter.intersects(KindFilter::SYMLINK) {
                    VramError::NotFound
                } else {
                    // A directory was expected here.
                    VramError::NotDirectory
                }
            }
            EntryKind::Directory => {
                if filter.intersects(KindFilter::FILE) {
                    // A file was expected here.
                    VramError::IsDirectory
                } else {
                    VramError::NotPermitted
                }
            }
            EntryKind::Symlink => VramError::NotPermitted,
        }
    }

    /// Detach this entry from its parent and bump the parent's mtime/ctime.
    ///
    /// The entry stays alive while session handles reference it.
    pub(crate) fn detach(self: &Arc<Entry>) {
        let (parent, name) = {
            let meta = self.meta.lock();
            (meta.parent.upgrade(), meta.name.clone())
        };
        let Some(parent) = parent else { return };

        if let Body::Directory(dir) = &parent.body {
            dir.lock().children.remove(&name);
        }
        let now = SystemTime::now();
        let mut pm = parent.meta.lock();
        pm.mtime = now;
        pm.ctime = now;
        self.meta.lock().parent = Weak::new();
    }

    /// Move this entry under `new_parent` as `new_name`.
    ///
    /// Any previous occupant of the destination name must already be gone.
    pub(crate) fn move_to(self: &Arc<Entry>, new_parent: &Arc<Entry>, new_name: &OsStr) {
        let (old_parent, old_name) = {
            let meta = self.meta.lock();
            (meta.parent.upgrade(), meta.name.clone())
        };
        if let Some(old_parent) = old_parent {
            if let Body::Directory(dir) = &old_parent.body {
                dir.lock().children.remove(&old_name);
            }
        }

        {
            let mut meta = self.meta.lock();
            meta.parent = Arc::downgrade(new_parent);
            meta.name = new_name.to_owned();
        }
        Self::link(new_parent, new_name, self);
    }

    pub(crate) fn touch_atime(&self) {
        self.meta.lock().atime = SystemTime::now();
    }

    pub(crate) fn touch_mtime(&self) {
        self.meta.lock().mtime = SystemTime::now();
    }

    pub(crate) fn touch_ctime(&self) {
        self.meta.lock().ctime = SystemTime::now();
    }

    pub(crate) fn touch_mtime_ctime(&self) {
        let now = SystemTime::now();
        let mut meta = self.meta.lock();
        meta.mtime = now;
        meta.ctime = now;
    }
}
