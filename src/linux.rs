extern crate block_utils;
use crate::device::{looks_like_raw_device, DeviceError};
use crate::metadata::DeviceGeometry;
use crate::Args;
use anyhow::Context as _;
use nix::errno::Errno;
use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsRawFd, IntoRawFd},
        raw::c_int,
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub partition: Option<u64>,
    pub device: block_utils::Device,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = PathBuf::from(s);
        if !looks_like_raw_device(&path) {
            anyhow::bail!("{s} does not look like a raw block device");
        }
        let (partition, device) = block_utils::get_device_from_path(s)?;
        Ok(Self {
            path,
            partition,
            device: device.ok_or(anyhow::anyhow!(
                "The device to inspect must be a valid block device."
            ))?,
        })
    }
}

pub(crate) fn sanity_checks(
    args: &Args,
    partition: Option<u64>,
    device_path: &Path,
    _device: &block_utils::Device,
) -> anyhow::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("You must be root to run this");
    }
    if partition.is_some() {
        if !args.allow_any_block_device {
            anyhow::bail!("Device is not a whole disk but a partition - pass --allow-any-block-device to inspect it anyway.");
        } else {
            warn!(
                ?partition,
                ?device_path,
                "Inspecting a partition rather than a whole disk."
            );
        }
    }
    Ok(())
}

mod ioctl {
    use std::os::raw::c_int;

    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), c_int);
}

fn query_error(path: &Path, request: &'static str, errno: Errno) -> DeviceError {
    match errno {
        Errno::ENOTBLK | Errno::EOPNOTSUPP | Errno::ENOTTY => DeviceError::NotBlockDevice {
            path: path.to_path_buf(),
        },
        errno => DeviceError::Query {
            path: path.to_path_buf(),
            request,
            source: io::Error::from(errno),
        },
    }
}

/// Asks the kernel for the device's size and logical sector size.
pub(crate) fn query_geometry(path: &Path) -> Result<DeviceGeometry, DeviceError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::fcntl::OFlag::O_SYNC.bits())
        .open(path)
        .map_err(|source| DeviceError::from_open(path, source))?;
    let fd = file.as_raw_fd();

    let mut total_size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe { ioctl::blkgetsize64(fd, &mut total_size) }
        .map_err(|errno| query_error(path, "ioctl(BLKGETSIZE64)", errno))?;

    let mut sector_size: c_int = 0;
    // SAFETY: BLKSSZGET writes a single int through the pointer.
    unsafe { ioctl::blksszget(fd, &mut sector_size) }
        .map_err(|errno| query_error(path, "ioctl(BLKSSZGET)", errno))?;

    close(file).map_err(|source| DeviceError::Close {
        path: path.to_path_buf(),
        source,
    })?;
    let sector_size = u64::try_from(sector_size).unwrap_or(0);
    DeviceGeometry::new(path, total_size, sector_size)
}

const MOUNT_TABLE: &str = "/proc/mounts";

/// The kernel's table of mounted filesystems.
pub(crate) fn mount_table() -> anyhow::Result<String> {
    std::fs::read_to_string(MOUNT_TABLE).with_context(|| format!("Reading {MOUNT_TABLE}"))
}

/// Whether an open failure means there is no medium behind the device node.
pub(crate) fn is_no_medium(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENODEV | Errno::ENXIO | Errno::ENOMEDIUM)
    )
}

/// Closes the file, surfacing the error that dropping it would swallow.
pub(crate) fn close(file: File) -> io::Result<()> {
    nix::unistd::close(file.into_raw_fd()).map_err(io::Error::from)
}
