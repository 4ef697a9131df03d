use std::{
    fs::{File, OpenOptions},
    io::{self, Seek},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::device::{looks_like_raw_device, DeviceError, MIN_SECTOR_SIZE};
use crate::metadata::DeviceGeometry;
use crate::Args;

#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceMetadata;

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub partition: Option<u64>,
    pub device: DeviceMetadata,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = PathBuf::from(s);
        if !looks_like_raw_device(&path) {
            anyhow::bail!("{s} does not look like a raw block device");
        }
        Ok(Self {
            path,
            partition: None,
            device: DeviceMetadata,
        })
    }
}

pub(crate) fn sanity_checks(
    args: &Args,
    _partition: Option<u64>,
    device_path: &Path,
    _device: &DeviceMetadata,
) -> anyhow::Result<()> {
    if args.i_know_what_im_doing_let_me_skip_sanity_checks {
        Ok(())
    } else {
        anyhow::bail!("I have no way to run sanity checks on this platform. Run with --i-know-what-im-doing-let-me-skip-sanity-checks if you want to inspect {:?} anyway.", device_path);
    }
}

/// Seeks to the end of the device to find its size; the sector size is assumed to be the minimum.
pub(crate) fn query_geometry(path: &Path) -> Result<DeviceGeometry, DeviceError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| DeviceError::from_open(path, source))?;
    let total_size = file
        .seek(io::SeekFrom::End(0))
        .map_err(|source| DeviceError::Query {
            path: path.to_path_buf(),
            request: "seek to end",
            source,
        })?;
    close(file).map_err(|source| DeviceError::Close {
        path: path.to_path_buf(),
        source,
    })?;
    DeviceGeometry::new(path, total_size, MIN_SECTOR_SIZE)
}

/// There is no mount table we know how to read here, so refuse rather than guess.
pub(crate) fn mount_table() -> anyhow::Result<String> {
    anyhow::bail!("Checking for mounted filesystems is not available on this platform, so the read/write size test cannot safely be done");
}

pub(crate) fn is_no_medium(_error: &io::Error) -> bool {
    false
}

pub(crate) fn close(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}
