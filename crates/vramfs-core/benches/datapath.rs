//! Data-path benchmarks against the host-memory backend, isolating engine
//! overhead from device latency.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::ffi::OsStr;
use std::sync::Arc;
use vramfs_core::VramFs;
use vramfs_device::HostDevice;
use vramfs_types::BLOCK_SIZE;

const IO_SIZE: usize = 1024 * 1024;

fn bench_write(c: &mut Criterion) {
    let fs = VramFs::new(Arc::new(HostDevice::new()));
    fs.reserve(64 * BLOCK_SIZE as u64);
    let fh = fs.create(OsStr::new("/bench"), 0o644, 0, 0).expect("create");
    let payload = vec![0xA5_u8; IO_SIZE];

    let mut group = c.benchmark_group("datapath");
    group.throughput(Throughput::Bytes(IO_SIZE as u64));
    group.bench_function("write_1m", |b| {
        b.iter(|| {
            let written = fs.write(fh, 0, &payload).expect("write");
            assert_eq!(written, IO_SIZE);
        });
    });
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let fs = VramFs::new(Arc::new(HostDevice::new()));
    fs.reserve(64 * BLOCK_SIZE as u64);
    let fh = fs.create(OsStr::new("/bench"), 0o644, 0, 0).expect("create");
    fs.write(fh, 0, &vec![0x5A_u8; IO_SIZE]).expect("write");

    let mut group = c.benchmark_group("datapath");
    group.throughput(Throughput::Bytes(IO_SIZE as u64));
    group.bench_function("read_1m", |b| {
        b.iter(|| {
            let data = fs.read(fh, 0, IO_SIZE as u64).expect("read");
            assert_eq!(data.len(), IO_SIZE);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
