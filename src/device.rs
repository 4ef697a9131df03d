//! Positional, sector-aligned access to the device under test.
//!
//! Every read or write is a complete unit: the device is opened, positioned,
//! transferred to or from, flushed to media and closed again. Nothing is
//! retried; a short transfer or a seek that lands elsewhere is an error.

use crate::platform;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Smallest sector size a device may have.
///
/// [`DeviceFile`] checks every address and length against this rather than
/// the device's own sector size, since GPT discovery reads 512-byte sectors
/// before that size is known.
pub(crate) const MIN_SECTOR_SIZE: u64 = 512;

/// Largest sector size currently in use by real devices.
pub(crate) const MAX_SECTOR_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub(crate) enum DeviceError {
    #[error("No device connected at {path:?}")]
    NoDevice { path: PathBuf },

    #[error("{path:?} does not exist")]
    NotFound { path: PathBuf },

    #[error("You aren't allowed to open {path:?}")]
    PermissionDenied { path: PathBuf },

    #[error("{path:?} does not seem to be a block device")]
    NotBlockDevice { path: PathBuf },

    #[error("{path:?} reports an unsupported sector size of {sector_size} bytes")]
    UnsupportedSectorSize { path: PathBuf, sector_size: u64 },

    #[error("Error opening {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{request} on {path:?} failed")]
    Query {
        path: PathBuf,
        request: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{len} bytes at offset {address} on {path:?} are not sector-aligned")]
    Misaligned {
        path: PathBuf,
        address: u64,
        len: usize,
    },

    #[error("Seek to address {address} on {path:?} failed")]
    Seek {
        path: PathBuf,
        address: u64,
        #[source]
        source: io::Error,
    },

    #[error("Seek to {address} on {path:?} went to {actual} instead")]
    SeekMismatch {
        path: PathBuf,
        address: u64,
        actual: u64,
    },

    #[error("Reading {len} bytes at offset {address} from {path:?} failed")]
    Read {
        path: PathBuf,
        address: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("Reading {len} bytes at offset {address} from {path:?} read {actual} bytes instead")]
    ShortRead {
        path: PathBuf,
        address: u64,
        len: usize,
        actual: usize,
    },

    #[error("Writing {len} bytes at offset {address} to {path:?} failed")]
    Write {
        path: PathBuf,
        address: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("Writing {len} bytes at offset {address} to {path:?} wrote {actual} bytes instead")]
    ShortWrite {
        path: PathBuf,
        address: u64,
        len: usize,
        actual: usize,
    },

    #[error("Error fsync'ing {path:?}")]
    Sync {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Error closing {path:?}")]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    /// Sorts an error from opening the device into the kinds we report distinctly.
    pub(crate) fn from_open(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ if platform::is_no_medium(&source) => Self::NoDevice { path },
            _ => Self::Open { path, source },
        }
    }
}

/// Positional access to sector-addressed storage.
///
/// Implementations must transfer exactly `buf.len()` bytes or fail, and a
/// successful write must have reached the media before returning.
pub(crate) trait BlockAccess {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_at(&mut self, address: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

/// Returns true if the path looks like it names a raw block device.
pub(crate) fn looks_like_raw_device(path: &Path) -> bool {
    path.is_absolute() && path.starts_with("/dev/")
}

/// A block device that gets opened anew for every transfer.
#[derive(Debug, Clone)]
pub(crate) struct DeviceFile {
    path: PathBuf,
}

impl DeviceFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<File, DeviceError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| DeviceError::from_open(&self.path, source))
    }

    fn check_alignment(&self, address: u64, len: usize) -> Result<(), DeviceError> {
        if address % MIN_SECTOR_SIZE != 0 || len as u64 % MIN_SECTOR_SIZE != 0 {
            return Err(DeviceError::Misaligned {
                path: self.path.clone(),
                address,
                len,
            });
        }
        Ok(())
    }

    fn seek_to(&self, file: &mut File, address: u64) -> Result<(), DeviceError> {
        let actual = file
            .seek(SeekFrom::Start(address))
            .map_err(|source| DeviceError::Seek {
                path: self.path.clone(),
                address,
                source,
            })?;
        if actual != address {
            return Err(DeviceError::SeekMismatch {
                path: self.path.clone(),
                address,
                actual,
            });
        }
        Ok(())
    }

    /// Flushes the device to media and closes it, reporting failures of either.
    fn finish(&self, file: File) -> Result<(), DeviceError> {
        file.sync_all().map_err(|source| DeviceError::Sync {
            path: self.path.clone(),
            source,
        })?;
        platform::close(file).map_err(|source| DeviceError::Close {
            path: self.path.clone(),
            source,
        })
    }
}

impl BlockAccess for DeviceFile {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check_alignment(address, buf.len())?;
        let mut file = self.open()?;
        self.seek_to(&mut file, address)?;
        let len = buf.len();
        let actual = file.read(buf).map_err(|source| DeviceError::Read {
            path: self.path.clone(),
            address,
            len,
            source,
        })?;
        if actual != len {
            return Err(DeviceError::ShortRead {
                path: self.path.clone(),
                address,
                len,
                actual,
            });
        }
        self.finish(file)
    }

    fn write_at(&mut self, address: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.check_alignment(address, buf.len())?;
        let mut file = self.open()?;
        self.seek_to(&mut file, address)?;
        let len = buf.len();
        let actual = file.write(buf).map_err(|source| DeviceError::Write {
            path: self.path.clone(),
            address,
            len,
            source,
        })?;
        if actual != len {
            return Err(DeviceError::ShortWrite {
                path: self.path.clone(),
                address,
                len,
                actual,
            });
        }
        self.finish(file)
    }
}
