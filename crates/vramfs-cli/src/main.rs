#![forbid(unsafe_code)]
//! The `vramfs` binary: reserve a slice of GPU memory and mount a
//! filesystem on it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vramfs_core::VramFs;
use vramfs_device::{list_devices, ComputeDevice, GpuDevice};
use vramfs_fuse::MountOptions;
use vramfs_types::{parse_byte_size, BLOCK_SIZE};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vramfs",
    about = "vramfs — filesystem backed by GPU video memory",
    after_help = "Sizes accept K/M/G (binary) and KB/MB/GB (decimal) suffixes."
)]
struct Cli {
    /// Directory to mount the filesystem at.
    #[arg(required_unless_present = "list_devices")]
    mountdir: Option<PathBuf>,

    /// Amount of VRAM to reserve, e.g. 512M, 2G, 1500MB.
    #[arg(required_unless_present = "list_devices")]
    size: Option<String>,

    /// Index of the GPU to use (see --list-devices).
    #[arg(short = 'd', long = "device", default_value_t = 0)]
    device: usize,

    /// Mount even if less VRAM than requested could be reserved.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// List available GPUs and exit.
    #[arg(short = 'l', long = "list-devices")]
    list_devices: bool,

    /// Output the device listing as JSON.
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        return list(cli.json);
    }

    let mountdir = cli.mountdir.context("missing mount directory")?;
    let size_arg = cli.size.context("missing size")?;
    let bytes = parse_byte_size(&size_arg)
        .with_context(|| format!("invalid size {size_arg:?}"))?;
    if bytes < BLOCK_SIZE as u64 {
        bail!("size must be at least one block (128K)");
    }

    let device = GpuDevice::open(cli.device).context("failed to open compute device")?;
    info!(device = device.name(), "initializing vramfs");

    let fs = Arc::new(VramFs::new(Arc::new(device)));
    let reserved = fs.reserve(bytes);
    if reserved < bytes {
        warn!(requested = bytes, reserved, "could not reserve all requested VRAM");
        if !cli.force {
            bail!(
                "only {reserved} of {bytes} bytes of VRAM could be reserved \
                 (pass -f to mount anyway)"
            );
        }
    }

    let options = MountOptions {
        allow_other: cli.allow_other,
        ..MountOptions::default()
    };
    info!(mountdir = %mountdir.display(), reserved, "mounting");
    vramfs_fuse::mount(fs, &mountdir, &options).context("mount failed")?;
    Ok(())
}

fn list(json: bool) -> Result<()> {
    let devices = list_devices();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("serialize device list")?
        );
        return Ok(());
    }
    if devices.is_empty() {
        println!("no compatible GPUs found");
        return Ok(());
    }
    for device in &devices {
        println!(
            "{}: {} ({}, {})",
            device.index, device.name, device.backend, device.device_type
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_form() {
        let cli = Cli::try_parse_from(["vramfs", "/mnt/vram", "512M", "-d", "1", "-f"])
            .expect("parse");
        assert_eq!(cli.mountdir, Some(PathBuf::from("/mnt/vram")));
        assert_eq!(cli.size.as_deref(), Some("512M"));
        assert_eq!(cli.device, 1);
        assert!(cli.force);
        assert!(!cli.allow_other);
    }

    #[test]
    fn mountdir_and_size_are_required_without_listing() {
        assert!(Cli::try_parse_from(["vramfs"]).is_err());
        assert!(Cli::try_parse_from(["vramfs", "/mnt/vram"]).is_err());
        assert!(Cli::try_parse_from(["vramfs", "--list-devices"]).is_ok());
    }

    #[test]
    fn json_requires_listing() {
        assert!(Cli::try_parse_from(["vramfs", "/mnt", "1G", "--json"]).is_err());
        assert!(Cli::try_parse_from(["vramfs", "--list-devices", "--json"]).is_ok());
    }
}
