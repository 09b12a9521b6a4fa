#![forbid(unsafe_code)]
//! FUSE adapter for vramfs.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via
//! the `fuser` crate, get forwarded to the path-based [`VramFs`] facade,
//! and errors are mapped through [`VramError::to_errno()`]. The kernel
//! speaks inode numbers while the engine speaks absolute paths, so the
//! adapter keeps an inode table mapping each handed-out inode to its path;
//! renames rewrite the paths of the moved subtree.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::raw::c_int;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;
use vramfs_core::{Attributes, VramFs};
use vramfs_error::VramError;
use vramfs_types::EntryKind;

/// TTL for cached attributes and entries. The tree is fully mutable, so
/// keep it short.
const ATTR_TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(ino: u64, attr: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.block_size,
        flags: 0,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

// ── Inode table ─────────────────────────────────────────────────────────────

/// Bidirectional ino ↔ absolute-path table. The root is ino 1 at `/`.
struct InodeTable {
    paths: HashMap<u64, OsString>,
    inos: HashMap<OsString, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, OsString::from("/"));
        table.inos.insert(OsString::from("/"), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<OsString> {
        self.paths.get(&ino).cloned()
    }

    /// The inode for `path`, handing out a fresh one on first sight.
    fn intern(&mut self, path: OsString) -> u64 {
        if let Some(ino) = self.inos.get(&path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.clone());
        self.inos.insert(path, ino);
        ino
    }

    /// Join a parent inode and child name into an absolute path.
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<OsString> {
        let parent_path = self.paths.get(&parent)?;
        let mut bytes = parent_path.as_bytes().to_vec();
        if bytes.last() != Some(&b'/') {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(name.as_bytes());
        Some(OsString::from_vec(bytes))
    }

    /// Parent path of an interned path (`/` for top-level entries).
    fn parent_path(path: &OsStr) -> OsString {
        let bytes = path.as_bytes();
        match bytes.iter().rposition(|byte| *byte == b'/') {
            Some(0) | None => OsString::from("/"),
            Some(pos) => OsString::from_vec(bytes[..pos].to_vec()),
        }
    }

    fn forget_path(&mut self, path: &OsStr) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Rewrite `old` and every path below it after a rename.
    fn rename_tree(&mut self, old: &OsStr, new: &OsStr) {
        let old_bytes = old.as_bytes();
        let mut prefix = old_bytes.to_vec();
        prefix.push(b'/');

        let moved: Vec<(u64, OsString)> = self
            .paths
            .iter()
            .filter_map(|(ino, path)| {
                let bytes = path.as_bytes();
                if bytes == old_bytes {
                    Some((*ino, new.to_owned()))
                } else if bytes.starts_with(&prefix) {
                    let mut rebased = new.as_bytes().to_vec();
                    rebased.extend_from_slice(&bytes[old_bytes.len()..]);
                    Some((*ino, OsString::from_vec(rebased)))
                } else {
                    None
                }
            })
            .collect();

        for (ino, new_path) in moved {
            if let Some(old_path) = self.paths.insert(ino, new_path.clone()) {
                self.inos.remove(&old_path);
            }
            self.inos.insert(new_path, ino);
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating every operation to the [`VramFs`] facade.
///
/// Unimplemented operations return `ENOSYS` via fuser's default method
/// implementations.
pub struct VramFuse {
    fs: Arc<VramFs>,
    inodes: InodeTable,
}

impl VramFuse {
    #[must_use]
    pub fn new(fs: Arc<VramFs>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn attr_reply(&mut self, path: OsString, reply: ReplyEntry) {
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.intern(path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attr), 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }
}

impl Filesystem for VramFuse {
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        // The engine starts with a root owned by uid/gid 0; hand it to the
        // mounting user.
        if let Err(err) = self
            .fs
            .chown(OsStr::new("/"), Some(req.uid()), Some(req.gid()))
        {
            warn!(error = %err, "failed to assign root ownership");
        }
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.intern(path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attr), 0);
            }
            Err(err) => {
                // ENOENT is expected for missing entries — don't warn for that.
                if err.to_errno() != libc::ENOENT {
                    warn!(parent, ?name, error = %err, "lookup failed");
                }
                reply.error(err.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attr)),
            Err(err) => {
                warn!(ino, error = %err, "getattr failed");
                reply.error(err.to_errno());
            }
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
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            self.fs.getattr(&path)
        })();

        match result {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attr)),
            Err(err) => {
                warn!(ino, error = %err, "setattr failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => {
                warn!(ino, error = %err, "readlink failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.mkdir(&path, mode, req.uid(), req.gid()) {
            Ok(()) => self.attr_reply(path, reply),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .fs
            .symlink(target.as_os_str(), &path, req.uid(), req.gid())
        {
            Ok(()) => self.attr_reply(path, reply),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.inodes.child_path(parent, name),
            self.inodes.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.forget_path(&to);
                self.inodes.rename_tree(&from, &to);
                reply.ok();
            }
            Err(err) => {
                warn!(?from, ?to, error = %err, "rename failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => {
                warn!(ino, error = %err, "open failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.create(&path, mode, req.uid(), req.gid()) {
            Ok(fh) => match self.fs.getattr(&path) {
                Ok(attr) => {
                    let ino = self.inodes.intern(path);
                    reply.created(&ATTR_TTL, &to_file_attr(ino, &attr), 0, fh, 0);
                }
                Err(err) => reply.error(err.to_errno()),
            },
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // Clamp negative offsets to 0 (shouldn't happen in practice).
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.read(fh, byte_offset, u64::from(size)) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                warn!(ino, offset, size, error = %err, "read failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write(fh, byte_offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(err) => {
                if !matches!(err, VramError::OutOfVram) {
                    warn!(ino, offset, len = data.len(), error = %err, "write failed");
                }
                reply.error(err.to_errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Nothing buffered host-side; writes are already on the queue.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(err) => {
                warn!(ino, error = %err, "fsync failed");
                reply.error(err.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless directory handles.
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(ino, error = %err, "readdir failed");
                reply.error(err.to_errno());
                return;
            }
        };

        let start = usize::try_from(offset).unwrap_or(0);
        for (index, entry) in entries.iter().enumerate().skip(start) {
            let entry_ino = if entry.name == OsStr::new(".") {
                ino
            } else if entry.name == OsStr::new("..") {
                self.inodes.intern(InodeTable::parent_path(&path))
            } else {
                match self.inodes.child_path(ino, &entry.name) {
                    Some(child) => self.inodes.intern(child),
                    None => continue,
                }
            };
            let full = reply.add(
                entry_ino,
                i64::try_from(index + 1).unwrap_or(i64::MAX),
                to_fuser_file_type(entry.kind),
                &entry.name,
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.free_blocks,
            stats.entries,
            u64::MAX - stats.entries,
            stats.block_size,
            stats.name_max,
            stats.block_size,
        );
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

/// Build a list of `fuser::MountOption` from our `MountOptions`.
///
/// `DefaultPermissions` delegates access checks to the host kernel; the
/// engine only stores mode and ownership.
fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("vramfs".to_owned()),
        MountOption::Subtype("vram".to_owned()),
        MountOption::DefaultPermissions,
    ];

    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount a vramfs filesystem at the given mountpoint (blocking).
///
/// This function blocks until the filesystem is unmounted.
pub fn mount(
    fs: Arc<VramFs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(VramFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background, returning a session handle.
///
/// The filesystem is unmounted when the returned `BackgroundSession` drops.
pub fn mount_background(
    fs: Arc<VramFs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(VramFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use vramfs_device::HostDevice;

    #[test]
    fn file_type_conversion() {
        assert_eq!(to_fuser_file_type(EntryKind::File), FileType::RegularFile);
        assert_eq!(
            to_fuser_file_type(EntryKind::Directory),
            FileType::Directory
        );
        assert_eq!(to_fuser_file_type(EntryKind::Symlink), FileType::Symlink);
    }

    #[test]
    fn attributes_to_file_attr_conversion() {
        let attr = Attributes {
            kind: EntryKind::File,
            size: 1024,
            blocks: 2,
            mode: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            block_size: 131_072,
        };
        let fattr = to_file_attr(42, &attr);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.blocks, 2);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.nlink, 1);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.gid, 1000);
        assert_eq!(fattr.blksize, 131_072);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn inode_table_root_and_children() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(OsString::from("/")));

        let path = table.child_path(ROOT_INO, OsStr::new("a")).expect("path");
        assert_eq!(path, OsString::from("/a"));
        let ino = table.intern(path.clone());
        assert_eq!(table.intern(path.clone()), ino);
        assert_eq!(table.path(ino), Some(path.clone()));

        let nested = table.child_path(ino, OsStr::new("b")).expect("path");
        assert_eq!(nested, OsString::from("/a/b"));
    }

    #[test]
    fn inode_table_forget() {
        let mut table = InodeTable::new();
        let path = OsString::from("/gone");
        let ino = table.intern(path.clone());
        table.forget_path(&path);
        assert_eq!(table.path(ino), None);
        // The path interns to a new inode afterwards.
        assert_ne!(table.intern(path), ino);
    }

    #[test]
    fn inode_table_rename_rewrites_subtree() {
        let mut table = InodeTable::new();
        let dir = table.intern(OsString::from("/dir"));
        let inner = table.intern(OsString::from("/dir/inner"));
        let deep = table.intern(OsString::from("/dir/inner/deep"));
        let other = table.intern(OsString::from("/director"));

        table.rename_tree(OsStr::new("/dir"), OsStr::new("/moved"));

        assert_eq!(table.path(dir), Some(OsString::from("/moved")));
        assert_eq!(table.path(inner), Some(OsString::from("/moved/inner")));
        assert_eq!(table.path(deep), Some(OsString::from("/moved/inner/deep")));
        // A sibling sharing the name prefix is untouched.
        assert_eq!(table.path(other), Some(OsString::from("/director")));
        assert_eq!(table.intern(OsString::from("/moved")), dir);
    }

    #[test]
    fn parent_path_cases() {
        assert_eq!(
            InodeTable::parent_path(OsStr::new("/a")),
            OsString::from("/")
        );
        assert_eq!(
            InodeTable::parent_path(OsStr::new("/a/b")),
            OsString::from("/a")
        );
        assert_eq!(InodeTable::parent_path(OsStr::new("/")), OsString::from("/"));
    }

    #[test]
    fn mount_options_defaults() {
        let opts = MountOptions::default();
        assert!(!opts.allow_other);
        assert!(opts.auto_unmount);

        let mount_opts = build_mount_options(&opts);
        assert!(mount_opts.contains(&MountOption::DefaultPermissions));
        assert!(mount_opts.contains(&MountOption::AutoUnmount));
        assert!(!mount_opts.contains(&MountOption::AllowOther));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let fs = Arc::new(VramFs::new(Arc::new(HostDevice::new())));
        let err = mount(fs, "", &MountOptions::default()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
