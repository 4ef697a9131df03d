//! Reporting what the GPT on a device says about its layout.

use crate::device::{BlockAccess, DeviceError};
use crate::gpt::{self, GptError, GptHeader};
use crate::metadata::DeviceGeometry;
use crate::partitions::{self, TableLocation};
use tracing::{info, warn};

/// What the report found, for callers that want more than the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GptSummary {
    /// The sector size the main header was found at.
    pub sector_size: u64,
    /// Non-empty entries in the main table, if it could be walked.
    pub main_partitions: Option<usize>,
    /// Non-empty entries in the backup table, if it was valid and could be walked.
    pub backup_partitions: Option<usize>,
}

fn log_usable_range(which: &str, header: &GptHeader, sector_size: u64) {
    info!(
        address = header.own_address(sector_size),
        "GPT {which} header reports its own address"
    );
    info!(
        address = header.first_usable_address(sector_size),
        "GPT {which} header reports first usable block"
    );
    info!(
        address = header.last_usable_address(sector_size),
        "GPT {which} header reports last usable block"
    );
}

/// Logs the table's non-empty entries, returning how many there were.
///
/// Tables that can't be decoded are skipped with a warning.
fn walk_table<D: BlockAccess>(
    which: &str,
    dev: &mut D,
    sector_size: u64,
    location: TableLocation,
    total_size: u64,
) -> Result<Option<usize>, DeviceError> {
    info!(
        count = location.entry_count,
        entry_size = location.entry_size,
        start = location.address,
        end = location.end(),
        "GPT {which} partition table (empty partitions omitted)"
    );
    let table = match partitions::walk(dev, sector_size, location, total_size) {
        Ok(table) => table,
        Err(GptError::Device(error)) => return Err(error),
        Err(error) => {
            warn!(%error, "Skipping GPT {which} partition table");
            return Ok(None);
        }
    };
    let mut found = 0;
    for entry in table {
        let entry = entry?;
        info!("    from {} to {}", entry.start, entry.end);
        found += 1;
    }
    Ok(Some(found))
}

/// Finds and reports the main and backup GPT headers and their partition tables.
///
/// Returns `None` if the device has no GPT. Structural problems are logged
/// and skipped; only I/O failures are errors.
pub(crate) fn gpt<D: BlockAccess>(
    dev: &mut D,
    geometry: DeviceGeometry,
) -> Result<Option<GptSummary>, DeviceError> {
    let Some((sector_size, header)) = gpt::find_gpt_header(dev)? else {
        return Ok(None);
    };
    info!(sector_size, "GPT header sector size");
    if sector_size != geometry.sector_size {
        warn!(
            gpt = sector_size,
            reported = geometry.sector_size,
            "GPT sector size differs from the reported sector size"
        );
    }
    info!(address = sector_size, "GPT main header location");
    log_usable_range("main", &header, sector_size);
    let main_partitions = walk_table(
        "main",
        dev,
        sector_size,
        header.table(sector_size),
        geometry.total_size,
    )?;

    let backup_address = header.backup_address(sector_size);
    info!(
        address = backup_address,
        "GPT main header reports backup header address"
    );
    let backup = if backup_address.saturating_add(sector_size) > geometry.total_size {
        Err(GptError::HeaderOutOfRange {
            address: backup_address,
            total_size: geometry.total_size,
        })
    } else {
        gpt::read_header(dev, backup_address, sector_size)
    };
    let backup = match backup {
        Ok(backup) => backup,
        Err(GptError::Device(error)) => return Err(error),
        Err(error) => {
            warn!(%error, "GPT backup header invalid");
            return Ok(Some(GptSummary {
                sector_size,
                main_partitions,
                backup_partitions: None,
            }));
        }
    };
    info!(
        address = backup.own_address(sector_size),
        "GPT backup header reports its own address"
    );
    info!(
        address = backup.backup_address(sector_size),
        "GPT backup header reports main header address"
    );
    info!(
        address = backup.first_usable_address(sector_size),
        "GPT backup header reports first usable block"
    );
    info!(
        address = backup.last_usable_address(sector_size),
        "GPT backup header reports last usable block"
    );
    let backup_partitions = walk_table(
        "backup",
        dev,
        sector_size,
        backup.table(sector_size),
        geometry.total_size,
    )?;
    Ok(Some(GptSummary {
        sector_size,
        main_partitions,
        backup_partitions,
    }))
}
