//! In-memory device images for tests, with optional simulated defects.

use crate::device::{BlockAccess, DeviceError};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;

/// What is wrong with the simulated device.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    /// Addresses at or above `modulo` land on `address % modulo`. Reads alias
    /// too when `reads` is set.
    Alias { modulo: u64, reads: bool },
    /// Writes at or above this address are silently discarded.
    DropWritesFrom(u64),
    /// Every write is also copied to the bytes directly after it.
    SpillWrites,
}

pub(crate) struct ImageDevice {
    data: Vec<u8>,
    fault: Option<Fault>,
    pub(crate) writes: usize,
}

impl ImageDevice {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0; len],
            fault: None,
            writes: 0,
        }
    }

    /// An image full of deterministic noise, so that overwrites are visible.
    pub(crate) fn random(len: usize, seed: u64) -> Self {
        let mut image = Self::zeroed(len);
        ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut image.data);
        image
    }

    pub(crate) fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn map(&self, address: u64, reading: bool) -> u64 {
        match self.fault {
            Some(Fault::Alias { modulo, reads }) if address >= modulo && (reads || !reading) => {
                address % modulo
            }
            _ => address,
        }
    }

    fn path() -> PathBuf {
        PathBuf::from("<image>")
    }

    /// Fails the way a device does when asked to transfer past its end.
    fn check_bounds(&self, address: u64, len: usize, writing: bool) -> Result<(), DeviceError> {
        let start = usize::try_from(address).unwrap_or(usize::MAX);
        if start.saturating_add(len) <= self.data.len() {
            return Ok(());
        }
        let path = Self::path();
        let actual = self.data.len().saturating_sub(start);
        Err(if writing {
            DeviceError::ShortWrite {
                path,
                address,
                len,
                actual,
            }
        } else {
            DeviceError::ShortRead {
                path,
                address,
                len,
                actual,
            }
        })
    }
}

impl BlockAccess for ImageDevice {
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check_bounds(address, buf.len(), false)?;
        for (n, byte) in buf.iter_mut().enumerate() {
            *byte = self.data[self.map(address + n as u64, true) as usize];
        }
        Ok(())
    }

    fn write_at(&mut self, address: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.check_bounds(address, buf.len(), true)?;
        self.writes += 1;
        match self.fault {
            Some(Fault::DropWritesFrom(limit)) if address >= limit => return Ok(()),
            Some(Fault::SpillWrites) => {
                let spill = address as usize + buf.len();
                if spill < self.data.len() {
                    let end = (spill + buf.len()).min(self.data.len());
                    self.data[spill..end].copy_from_slice(&buf[..end - spill]);
                }
            }
            _ => {}
        }
        for (n, &byte) in buf.iter().enumerate() {
            let target = self.map(address + n as u64, false) as usize;
            self.data[target] = byte;
        }
        Ok(())
    }
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) const ENTRY_COUNT: u32 = 128;
pub(crate) const ENTRY_SIZE: u32 = 128;

/// The usable range and table location a header describes, all in sectors.
pub(crate) struct HeaderFields {
    pub own_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub table_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

/// Writes a GPT header sector at `lba`.
pub(crate) fn put_header(data: &mut [u8], sector_size: u64, lba: u64, fields: &HeaderFields) {
    let base = (lba * sector_size) as usize;
    let sector = &mut data[base..base + sector_size as usize];
    sector.fill(0);
    sector[..8].copy_from_slice(b"EFI PART");
    put_u32(sector, 8, 0x0001_0000);
    put_u32(sector, 12, 92);
    put_u64(sector, 24, fields.own_lba);
    put_u64(sector, 32, fields.backup_lba);
    put_u64(sector, 40, fields.first_usable_lba);
    put_u64(sector, 48, fields.last_usable_lba);
    put_u64(sector, 72, fields.table_lba);
    put_u32(sector, 80, fields.entry_count);
    put_u32(sector, 84, fields.entry_size);
}

/// Writes partition entries with the given (start, end) sectors into a table at `address`.
pub(crate) fn put_entries(data: &mut [u8], address: u64, entry_size: u32, entries: &[(u64, u64)]) {
    for (n, &(start, end)) in entries.iter().enumerate() {
        let offset = address as usize + n * entry_size as usize;
        put_u64(data, offset + 32, start);
        put_u64(data, offset + 40, end);
    }
}

/// Lays out a protective MBR plus primary and backup GPT covering the whole image.
pub(crate) fn write_gpt(data: &mut [u8], sector_size: u64, partitions: &[(u64, u64)]) {
    data[450] = 0xEE;
    let sectors = data.len() as u64 / sector_size;
    let table_sectors = u64::from(ENTRY_COUNT * ENTRY_SIZE) / sector_size;
    let last = sectors - 1;
    let backup_table = last - table_sectors;
    let mut fields = HeaderFields {
        own_lba: 1,
        backup_lba: last,
        first_usable_lba: 2 + table_sectors,
        last_usable_lba: backup_table - 1,
        table_lba: 2,
        entry_count: ENTRY_COUNT,
        entry_size: ENTRY_SIZE,
    };
    let table_len = (table_sectors * sector_size) as usize;
    for table in [2, backup_table] {
        let start = (table * sector_size) as usize;
        data[start..start + table_len].fill(0);
        put_entries(data, table * sector_size, ENTRY_SIZE, partitions);
    }
    put_header(data, sector_size, 1, &fields);
    fields.own_lba = last;
    fields.backup_lba = 1;
    fields.table_lba = backup_table;
    put_header(data, sector_size, last, &fields);
}
