//! Locating and decoding GUID Partition Table headers.
//!
//! The header lives in the second sector of the device, but we don't trust the
//! reported sector size: the header is looked for at every supported sector
//! size, and the size it is found at is the one used to scale its fields.

use crate::device::{BlockAccess, DeviceError, MAX_SECTOR_SIZE, MIN_SECTOR_SIZE};
use crate::partitions::TableLocation;
use thiserror::Error;
use tracing::{debug, info, warn};

pub(crate) const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Offset of the first partition's type byte in a legacy MBR.
const MBR_PARTITION_TYPE: usize = 450;
const GPT_PROTECTIVE_TYPE: u8 = 0xEE;

// Header field offsets.
const OWN_LBA: usize = 24;
const BACKUP_LBA: usize = 32;
const FIRST_USABLE_LBA: usize = 40;
const LAST_USABLE_LBA: usize = 48;
const TABLE_LBA: usize = 72;
const ENTRY_COUNT: usize = 80;
const ENTRY_SIZE: usize = 84;
const HEADER_LEN: usize = 88;

#[derive(Debug, Error)]
pub(crate) enum GptError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("GPT header at address {address} has invalid signature {found:#X}")]
    Signature { address: u64, found: u64 },

    #[error("GPT header at address {address} is only {len} bytes long")]
    Truncated { address: u64, len: usize },

    #[error("GPT header address {address} is beyond the end of the device ({total_size} bytes)")]
    HeaderOutOfRange { address: u64, total_size: u64 },

    #[error("Partition entries of {entry_size} bytes are too small to hold start and end blocks")]
    EntrySize { entry_size: u32 },

    #[error("Partition table from {start} to {end} extends past the end of the device ({total_size} bytes)")]
    TableOutOfRange { start: u64, end: u64, total_size: u64 },
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// A decoded GPT header. Block addresses are in sectors, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GptHeader {
    pub signature: [u8; 8],
    pub own_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub partition_table_lba: u64,
    pub partition_count: u32,
    pub partition_entry_size: u32,
}

impl GptHeader {
    /// Decodes the header sector read from `address`, which must carry the GPT signature.
    pub(crate) fn decode(address: u64, sector: &[u8]) -> Result<Self, GptError> {
        if sector.len() < HEADER_LEN {
            return Err(GptError::Truncated {
                address,
                len: sector.len(),
            });
        }
        let mut signature = [0; 8];
        signature.copy_from_slice(&sector[..8]);
        if signature != GPT_SIGNATURE {
            return Err(GptError::Signature {
                address,
                found: le_u64(sector, 0),
            });
        }
        Ok(Self {
            signature,
            own_lba: le_u64(sector, OWN_LBA),
            backup_lba: le_u64(sector, BACKUP_LBA),
            first_usable_lba: le_u64(sector, FIRST_USABLE_LBA),
            last_usable_lba: le_u64(sector, LAST_USABLE_LBA),
            partition_table_lba: le_u64(sector, TABLE_LBA),
            partition_count: le_u32(sector, ENTRY_COUNT),
            partition_entry_size: le_u32(sector, ENTRY_SIZE),
        })
    }

    pub(crate) fn own_address(&self, sector_size: u64) -> u64 {
        self.own_lba.saturating_mul(sector_size)
    }

    pub(crate) fn backup_address(&self, sector_size: u64) -> u64 {
        self.backup_lba.saturating_mul(sector_size)
    }

    pub(crate) fn first_usable_address(&self, sector_size: u64) -> u64 {
        self.first_usable_lba.saturating_mul(sector_size)
    }

    pub(crate) fn last_usable_address(&self, sector_size: u64) -> u64 {
        self.last_usable_lba.saturating_mul(sector_size)
    }

    pub(crate) fn table(&self, sector_size: u64) -> TableLocation {
        TableLocation {
            address: self.partition_table_lba.saturating_mul(sector_size),
            entry_count: self.partition_count,
            entry_size: self.partition_entry_size,
        }
    }
}

/// Checks the legacy MBR for the protective partition that marks a GPT disk.
pub(crate) fn has_protective_mbr<D: BlockAccess>(dev: &mut D) -> Result<bool, DeviceError> {
    let mut mbr = vec![0; MIN_SECTOR_SIZE as usize];
    dev.read_at(0, &mut mbr)?;
    Ok(mbr[MBR_PARTITION_TYPE] == GPT_PROTECTIVE_TYPE)
}

/// Finds the primary GPT header, returning the sector size it was found at.
///
/// Not finding a header is not an error; only failing I/O is.
pub(crate) fn find_gpt_header<D: BlockAccess>(
    dev: &mut D,
) -> Result<Option<(u64, GptHeader)>, DeviceError> {
    if !has_protective_mbr(dev)? {
        info!("No protective MBR, so no GPT partitioning");
        return Ok(None);
    }
    info!("Device appears to have GPT partitioning");
    let mut size = MIN_SECTOR_SIZE;
    while size <= MAX_SECTOR_SIZE {
        let mut sector = vec![0; size as usize];
        dev.read_at(size, &mut sector)?;
        match GptHeader::decode(size, &sector) {
            Ok(header) => return Ok(Some((size, header))),
            Err(error) => debug!(%error, size, "No GPT header at this sector size"),
        }
        size *= 2;
    }
    warn!("Could not find GPT header");
    Ok(None)
}

/// Reads and decodes the header at `address`, e.g. the backup header.
pub(crate) fn read_header<D: BlockAccess>(
    dev: &mut D,
    address: u64,
    sector_size: u64,
) -> Result<GptHeader, GptError> {
    let mut sector = vec![0; sector_size as usize];
    dev.read_at(address, &mut sector)?;
    GptHeader::decode(address, &sector)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::{write_gpt, ImageDevice};
    use tracing_test::traced_test;

    const IMAGE_LEN: usize = 1024 * 1024;

    #[traced_test]
    #[test]
    fn finds_header_at_each_sector_size() {
        for sector_size in [512, 1024, 2048, 4096] {
            let mut dev = ImageDevice::zeroed(IMAGE_LEN);
            write_gpt(dev.data_mut(), sector_size, &[(34, 2047)]);
            let (found, header) = find_gpt_header(&mut dev)
                .expect("no io errors")
                .expect("a header");
            assert_eq!(found, sector_size);
            assert_eq!(header.signature, GPT_SIGNATURE);
            assert_eq!(header.own_lba, 1);
            assert_eq!(header.own_address(found), sector_size);
            let last = IMAGE_LEN as u64 / sector_size - 1;
            assert_eq!(header.backup_address(found), last * sector_size);
            assert_eq!(header.table(found).address, 2 * sector_size);
            assert_eq!(header.partition_count, 128);
            assert_eq!(header.partition_entry_size, 128);
        }
    }

    #[test]
    fn decodes_fields_at_their_offsets() {
        let mut sector = vec![0u8; 512];
        sector[..8].copy_from_slice(b"EFI PART");
        sector[24..32].copy_from_slice(&3u64.to_le_bytes());
        sector[32..40].copy_from_slice(&0x1_0000_0001u64.to_le_bytes());
        sector[40..48].copy_from_slice(&40u64.to_le_bytes());
        sector[48..56].copy_from_slice(&9000u64.to_le_bytes());
        sector[72..80].copy_from_slice(&5u64.to_le_bytes());
        sector[80..84].copy_from_slice(&77u32.to_le_bytes());
        sector[84..88].copy_from_slice(&256u32.to_le_bytes());
        let header = GptHeader::decode(512, &sector).expect("valid header");
        assert_eq!(header.own_address(2048), 3 * 2048);
        assert_eq!(header.backup_address(512), 0x1_0000_0001 * 512);
        assert_eq!(header.first_usable_address(4096), 40 * 4096);
        assert_eq!(header.last_usable_address(512), 9000 * 512);
        let table = header.table(1024);
        assert_eq!(table.address, 5 * 1024);
        assert_eq!(table.entry_count, 77);
        assert_eq!(table.entry_size, 256);
    }

    #[test]
    fn rejects_bad_signatures() {
        let mut sector = vec![0u8; 512];
        sector[..8].copy_from_slice(b"EFI PARU");
        assert!(matches!(
            GptHeader::decode(512, &sector),
            Err(GptError::Signature { address: 512, .. })
        ));
        assert!(matches!(
            GptHeader::decode(512, &sector[..40]),
            Err(GptError::Truncated { len: 40, .. })
        ));
    }

    #[traced_test]
    #[test]
    fn no_gpt_without_protective_mbr() {
        let mut dev = ImageDevice::zeroed(IMAGE_LEN);
        write_gpt(dev.data_mut(), 512, &[]);
        dev.data_mut()[450] = 0x83;
        assert_eq!(find_gpt_header(&mut dev).expect("no io errors"), None);
        assert!(logs_contain("No protective MBR"));
    }

    #[traced_test]
    #[test]
    fn header_not_found_is_not_fatal() {
        let mut dev = ImageDevice::zeroed(IMAGE_LEN);
        dev.data_mut()[450] = 0xEE;
        assert_eq!(find_gpt_header(&mut dev).expect("no io errors"), None);
        assert!(logs_contain("Could not find GPT header"));
    }

    #[test]
    fn io_failures_are_propagated() {
        let mut dev = ImageDevice::zeroed(256);
        assert!(matches!(
            find_gpt_header(&mut dev),
            Err(DeviceError::ShortRead { .. })
        ));
    }

    #[test]
    fn reads_backup_header() {
        let mut dev = ImageDevice::zeroed(IMAGE_LEN);
        write_gpt(dev.data_mut(), 512, &[]);
        let backup_address = IMAGE_LEN as u64 - 512;
        let backup = read_header(&mut dev, backup_address, 512).expect("valid backup");
        assert_eq!(backup.own_address(512), backup_address);
        assert_eq!(backup.backup_address(512), 512);

        dev.data_mut()[backup_address as usize] = b'X';
        assert!(matches!(
            read_header(&mut dev, backup_address, 512),
            Err(GptError::Signature { .. })
        ));
    }
}
