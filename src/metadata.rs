//! Meta-information about devices under test.

use crate::device::{DeviceError, MAX_SECTOR_SIZE, MIN_SECTOR_SIZE};
use std::path::Path;

/// What the device claims about itself. Queried once and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceGeometry {
    /// Reported capacity in bytes.
    pub total_size: u64,
    /// Reported logical sector size in bytes.
    pub sector_size: u64,
}

impl DeviceGeometry {
    /// Accepts the reported values if the sector size is one we know how to test with.
    pub(crate) fn new(path: &Path, total_size: u64, sector_size: u64) -> Result<Self, DeviceError> {
        if !is_supported_sector_size(sector_size) {
            return Err(DeviceError::UnsupportedSectorSize {
                path: path.to_path_buf(),
                sector_size,
            });
        }
        Ok(Self {
            total_size,
            sector_size,
        })
    }

    pub(crate) fn sector_len(&self) -> usize {
        self.sector_size as usize
    }
}

pub(crate) fn is_supported_sector_size(size: u64) -> bool {
    size.is_power_of_two() && (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&size)
}
