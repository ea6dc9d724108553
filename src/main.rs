//! `flytecfs` binary: open the instrument's serial line, wrap it in the
//! proxy and cache, and mount the virtual tree.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use fuser::MountOption;
use log::info;

use flytecfs::cache::FlytecCache;
use flytecfs::infra::serial::tty::TtyPort;
use flytecfs::protocol::device::Flytec;
use flytecfs::vfs::{fuse, Tree};

const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

/// Mount a Flytec/Brauniger flight instrument as a filesystem.
#[derive(Debug, Parser)]
#[command(name = "flytecfs", version, about)]
struct Args {
    /// Directory to mount the instrument on.
    mountpoint: PathBuf,
    /// Mount options, comma-separated. `device=PATH` selects the serial
    /// device; everything else is passed through to the FUSE mount.
    #[arg(short = 'o', value_name = "OPT[,OPT...]")]
    options: Vec<String>,
}

/// Split `-o` values into the device path and pass-through mount options.
fn parse_options(raw: &[String]) -> (PathBuf, Vec<MountOption>) {
    let mut device = PathBuf::from(DEFAULT_DEVICE);
    let mut options = vec![MountOption::FSName("flytecfs".to_string())];
    for option in raw.iter().flat_map(|value| value.split(',')) {
        if let Some(path) = option.strip_prefix("device=") {
            device = PathBuf::from(path);
        } else if !option.is_empty() {
            options.push(MountOption::CUSTOM(option.to_string()));
        }
    }
    (device, options)
}

fn cache_base() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".flytecfs").join("cache"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let (device, options) = parse_options(&args.options);
    if !args.mountpoint.is_dir() {
        bail!("mountpoint {} is not a directory", args.mountpoint.display());
    }
    let port = TtyPort::open(&device)
        .with_context(|| format!("cannot open device {}", device.display()))?;
    let cache = FlytecCache::new(Flytec::new(port), &cache_base()?)
        .context("cannot read instrument identity")?;
    info!(
        "{} serial {} pilot {}",
        cache.snp().instrument,
        cache.snp().serial_number,
        cache.snp().pilot_name.trim()
    );
    fuse::mount(Tree::new(Arc::new(cache)), &args.mountpoint, &options)
        .context("mount failed")?;
    Ok(())
}
