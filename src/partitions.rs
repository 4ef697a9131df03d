//! Walking a GPT partition table that may span any number of sectors.

use crate::device::{BlockAccess, DeviceError};
use crate::gpt::{le_u64, GptError};

const START_LBA: u64 = 32;
const END_LBA: u64 = 40;
/// Bytes of each entry we need to look at.
const DECODED_LEN: u64 = 48;

/// Where a partition table lives and how it is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableLocation {
    /// Byte address of the first entry.
    pub address: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

impl TableLocation {
    /// Byte address just past the last entry.
    pub(crate) fn end(&self) -> u64 {
        self.address
            .saturating_add(u64::from(self.entry_count) * u64::from(self.entry_size))
    }
}

/// A partition's extent, as byte addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartitionEntry {
    pub start: u64,
    pub end: u64,
}

/// Prepares to walk the table, refusing ones that can't be decoded or don't fit on the device.
pub(crate) fn walk<D: BlockAccess>(
    dev: &mut D,
    sector_size: u64,
    location: TableLocation,
    total_size: u64,
) -> Result<PartitionTable<'_, D>, GptError> {
    if u64::from(location.entry_size) < DECODED_LEN {
        return Err(GptError::EntrySize {
            entry_size: location.entry_size,
        });
    }
    if location.end() > total_size {
        return Err(GptError::TableOutOfRange {
            start: location.address,
            end: location.end(),
            total_size,
        });
    }
    Ok(PartitionTable {
        dev,
        sector_size,
        location,
        next: 0,
        window_start: 0,
        window: Vec::new(),
    })
}

/// Yields the non-empty entries of a partition table, in table order.
///
/// Sectors are read as the walk reaches them; an entry whose decoded fields
/// cross a sector boundary gets both sectors read.
pub(crate) struct PartitionTable<'a, D> {
    dev: &'a mut D,
    sector_size: u64,
    location: TableLocation,
    next: u32,
    window_start: u64,
    window: Vec<u8>,
}

impl<D: BlockAccess> PartitionTable<'_, D> {
    /// Makes sure the entry at `address` is in the window, returning its offset there.
    fn fetch(&mut self, address: u64) -> Result<usize, DeviceError> {
        let needed_end = address + DECODED_LEN;
        let window_end = self.window_start + self.window.len() as u64;
        if self.window.is_empty() || address < self.window_start || needed_end > window_end {
            let first = address - address % self.sector_size;
            let last = needed_end.div_ceil(self.sector_size) * self.sector_size;
            self.window.resize((last - first) as usize, 0);
            self.dev.read_at(first, &mut self.window)?;
            self.window_start = first;
        }
        Ok((address - self.window_start) as usize)
    }
}

impl<D: BlockAccess> Iterator for PartitionTable<'_, D> {
    type Item = Result<PartitionEntry, DeviceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.location.entry_count {
            let address = self.location.address
                + u64::from(self.next) * u64::from(self.location.entry_size);
            self.next += 1;
            let offset = match self.fetch(address) {
                Ok(offset) => offset,
                Err(error) => {
                    self.next = self.location.entry_count;
                    return Some(Err(error));
                }
            };
            let start = le_u64(&self.window, offset + START_LBA as usize);
            let end = le_u64(&self.window, offset + END_LBA as usize);
            if start != end {
                return Some(Ok(PartitionEntry {
                    start: start.saturating_mul(self.sector_size),
                    end: end.saturating_mul(self.sector_size),
                }));
            }
        }
        None
    }
}
