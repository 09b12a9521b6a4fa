//! End-to-end engine scenarios against the host-memory backend.
//!
//! Each scenario pins the pool to a known block count so the out-of-space
//! and accounting behavior is exact.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use vramfs_core::VramFs;
use vramfs_device::HostDevice;
use vramfs_error::VramError;
use vramfs_types::{EntryKind, BLOCK_SIZE};

const BS: u64 = BLOCK_SIZE as u64;

fn fs_with_blocks(blocks: u64) -> VramFs {
    let fs = VramFs::new(Arc::new(HostDevice::new()));
    assert_eq!(fs.reserve(blocks * BS), blocks * BS);
    fs
}

fn path(p: &str) -> &OsStr {
    OsStr::new(p)
}

#[test]
fn create_write_read_roundtrip() {
    let fs = fs_with_blocks(4);
    let fh = fs.create(path("/a"), 0o644, 0, 0).expect("create");
    assert_eq!(fs.write(fh, 0, b"hello").expect("write"), 5);
    assert_eq!(fs.read(fh, 0, 5).expect("read"), b"hello");
    assert_eq!(fs.getattr(path("/a")).expect("attr").size, 5);
}

#[test]
fn sparse_hole_reads_zeros() {
    let fs = fs_with_blocks(4);
    let fh = fs.create(path("/b"), 0o644, 0, 0).expect("create");
    assert_eq!(fs.write(fh, 200_000, b"xyz").expect("write"), 3);

    assert_eq!(fs.getattr(path("/b")).expect("attr").size, 200_003);
    assert_eq!(fs.read(fh, 0, 5).expect("read"), [0, 0, 0, 0, 0]);
    assert_eq!(fs.read(fh, 200_000, 3).expect("read"), b"xyz");
    assert_eq!(fs.read(fh, 200_003, 10).expect("read"), b"");
}

#[test]
fn out_of_space_is_a_short_write_then_enospc() {
    let fs = fs_with_blocks(2);
    let fh = fs.create(path("/c"), 0o644, 0, 0).expect("create");

    let payload = vec![0x42_u8; 300_000];
    // Two full blocks fit; the third allocation fails mid-walk.
    assert_eq!(fs.write(fh, 0, &payload).expect("short write"), 262_144);
    assert_eq!(fs.getattr(path("/c")).expect("attr").size, 262_144);

    // Nothing left at all: now the error surfaces.
    assert!(matches!(
        fs.write(fh, 262_144, b"z"),
        Err(VramError::OutOfVram)
    ));

    // Writes inside the populated range still work.
    assert_eq!(fs.write(fh, 0, b"ok").expect("write"), 2);
}

#[test]
fn rename_over_existing_replaces_and_frees() {
    let fs = fs_with_blocks(4);

    let fa = fs.create(path("/a"), 0o644, 0, 0).expect("create a");
    fs.write(fa, 0, b"contents of a").expect("write a");
    fs.release(fa).expect("release a");

    let fb = fs.create(path("/b"), 0o644, 0, 0).expect("create b");
    fs.write(fb, 0, b"doomed").expect("write b");
    fs.release(fb).expect("release b");

    assert_eq!(fs.statfs().free_blocks, 2);

    fs.rename(path("/a"), path("/b")).expect("rename");

    assert!(matches!(fs.getattr(path("/a")), Err(VramError::NotFound)));
    let fh = fs.open(path("/b")).expect("open");
    assert_eq!(fs.read(fh, 0, 13).expect("read"), b"contents of a");
    fs.release(fh).expect("release");

    // /b's old block went back to the pool; /a's block moved with it.
    assert_eq!(fs.statfs().free_blocks, 3);
}

#[test]
fn rename_preserves_identity_and_bumps_ctime() {
    let fs = fs_with_blocks(2);
    let fh = fs.create(path("/a"), 0o640, 42, 43).expect("create");
    fs.write(fh, 0, b"payload").expect("write");
    fs.release(fh).expect("release");

    let before = fs.getattr(path("/a")).expect("attr");
    std::thread::sleep(Duration::from_millis(5));
    fs.rename(path("/a"), path("/q")).expect("rename");
    let after = fs.getattr(path("/q")).expect("attr");

    assert_eq!(after.size, before.size);
    assert_eq!(after.mode, before.mode);
    assert_eq!(after.uid, before.uid);
    assert_eq!(after.gid, before.gid);
    assert_eq!(after.mtime, before.mtime);
    assert!(after.ctime > before.ctime);
}

#[test]
fn rmdir_refuses_non_empty() {
    let fs = fs_with_blocks(1);
    fs.mkdir(path("/d"), 0o755, 0, 0).expect("mkdir");
    let fh = fs.create(path("/d/x"), 0o644, 0, 0).expect("create");
    fs.release(fh).expect("release");

    assert!(matches!(fs.rmdir(path("/d")), Err(VramError::NotEmpty)));
    fs.unlink(path("/d/x")).expect("unlink");
    fs.rmdir(path("/d")).expect("rmdir");
    assert!(matches!(fs.getattr(path("/d")), Err(VramError::NotFound)));
}

#[test]
fn symlink_and_readlink() {
    let fs = fs_with_blocks(1);
    fs.symlink(path("target/path"), path("/l"), 0, 0)
        .expect("symlink");

    let attr = fs.getattr(path("/l")).expect("attr");
    assert_eq!(attr.kind, EntryKind::Symlink);
    assert_eq!(attr.mode, 0o777);
    assert_eq!(attr.size, 11);

    let target = fs.readlink(path("/l")).expect("readlink");
    assert_eq!(target, OsStr::new("target/path"));

    // readlink on a non-link maps to the filter table.
    let fh = fs.create(path("/f"), 0o644, 0, 0).expect("create");
    fs.release(fh).expect("release");
    assert!(matches!(fs.readlink(path("/f")), Err(VramError::NotFound)));
    fs.mkdir(path("/d"), 0o755, 0, 0).expect("mkdir");
    assert!(matches!(
        fs.readlink(path("/d")),
        Err(VramError::NotPermitted)
    ));
}

#[test]
fn truncate_then_getattr_sees_the_size() {
    let fs = fs_with_blocks(4);
    let fh = fs.create(path("/t"), 0o644, 0, 0).expect("create");
    fs.write(fh, 0, &vec![1_u8; (2 * BS + 10) as usize])
        .expect("write");
    fs.release(fh).expect("release");

    fs.truncate(path("/t"), 123).expect("truncate");
    assert_eq!(fs.getattr(path("/t")).expect("attr").size, 123);
    // Blocks 1 and 2 were dropped.
    assert_eq!(fs.statfs().free_blocks, 3);

    // Truncate can also grow, sparsely.
    fs.truncate(path("/t"), 10 * BS).expect("truncate up");
    assert_eq!(fs.getattr(path("/t")).expect("attr").size, 10 * BS);
    assert_eq!(fs.statfs().free_blocks, 3);

    let fh = fs.open(path("/t")).expect("open");
    let tail = fs.read(fh, 10 * BS - 4, 4).expect("read tail");
    assert_eq!(tail, [0, 0, 0, 0]);
    fs.release(fh).expect("release");
}

#[test]
fn write_fsync_read_sees_the_write() {
    let fs = fs_with_blocks(1);
    let fh = fs.create(path("/s"), 0o644, 0, 0).expect("create");
    fs.write(fh, 0, b"durable").expect("write");
    fs.fsync(fh).expect("fsync");
    assert_eq!(fs.read(fh, 0, 7).expect("read"), b"durable");
    // fsync with nothing new written stays a no-op.
    fs.fsync(fh).expect("fsync again");
    fs.release(fh).expect("release");
}

#[test]
fn unlink_then_getattr_is_enoent_and_recreate_works() {
    let fs = fs_with_blocks(1);
    let fh = fs.create(path("/p"), 0o644, 0, 0).expect("create");
    fs.release(fh).expect("release");

    fs.unlink(path("/p")).expect("unlink");
    assert!(matches!(fs.getattr(path("/p")), Err(VramError::NotFound)));

    let fh = fs.create(path("/p"), 0o644, 0, 0).expect("recreate");
    fs.release(fh).expect("release");
    assert!(fs.getattr(path("/p")).is_ok());
}

#[test]
fn disjoint_writes_and_zeros_elsewhere() {
    let fs = fs_with_blocks(4);
    let fh = fs.create(path("/w"), 0o644, 0, 0).expect("create");

    let off1 = 10_u64;
    let a = b"AAAA";
    let off2 = BS + 77;
    let b = b"BBBBBBB";
    fs.write(fh, off1, a).expect("write a");
    fs.write(fh, off2, b).expect("write b");

    let size = fs.getattr(path("/w")).expect("attr").size;
    assert_eq!(size, off2 + b.len() as u64);

    let full = fs.read(fh, 0, size).expect("full read");
    assert_eq!(&full[off1 as usize..off1 as usize + a.len()], a);
    assert_eq!(&full[off2 as usize..off2 as usize + b.len()], b);
    for (index, byte) in full.iter().enumerate() {
        let in_a = (off1 as usize..off1 as usize + a.len()).contains(&index);
        let in_b = (off2 as usize..off2 as usize + b.len()).contains(&index);
        if !in_a && !in_b {
            assert_eq!(*byte, 0, "expected zero at {index}");
        }
    }
    fs.release(fh).expect("release");
}

#[test]
fn concurrent_readers_writers_and_metadata() {
    let fs = Arc::new(fs_with_blocks(16));
    let fh = fs.create(path("/big"), 0o644, 0, 0).expect("create");
    let payload: Vec<u8> = (0..4 * BS).map(|i| (i % 251) as u8).collect();
    fs.write(fh, 0, &payload).expect("write");

    let mut workers = Vec::new();
    for worker in 0..4 {
        let fs = Arc::clone(&fs);
        workers.push(std::thread::spawn(move || {
            let fh = fs.open(path("/big")).expect("open");
            for round in 0..32 {
                let offset = ((worker * 7 + round) as u64 * 4096) % (3 * BS);
                let got = fs.read(fh, offset, 4096).expect("read");
                assert_eq!(got.len(), 4096);
                for (index, byte) in got.iter().enumerate() {
                    assert_eq!(*byte, ((offset as usize + index) % 251) as u8);
                }
            }
            fs.release(fh).expect("release");
        }));
    }
    // Metadata traffic interleaved with the readers.
    for round in 0..32 {
        let name = format!("/meta-{round}");
        fs.mkdir(OsStr::new(&name), 0o755, 0, 0).expect("mkdir");
        fs.readdir(path("/")).expect("readdir");
        fs.rmdir(OsStr::new(&name)).expect("rmdir");
    }
    for worker in workers {
        worker.join().expect("worker");
    }
    fs.release(fh).expect("release");
}

#[test]
fn pool_accounting_at_rest() {
    let fs = fs_with_blocks(8);
    let stats = fs.statfs();
    assert_eq!(stats.free_blocks, stats.total_blocks);

    let fh = fs.create(path("/x"), 0o644, 0, 0).expect("create");
    fs.write(fh, 0, &vec![0_u8; (3 * BS) as usize]).expect("write");
    let stats = fs.statfs();
    assert_eq!(stats.free_blocks + 3, stats.total_blocks);

    fs.unlink(path("/x")).expect("unlink");
    fs.release(fh).expect("release");
    let stats = fs.statfs();
    assert_eq!(stats.free_blocks, stats.total_blocks);
}
