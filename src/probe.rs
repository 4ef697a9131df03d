//! Finding out how much storage a device really has, by writing to it.
//!
//! Counterfeit devices often ignore the high bits of an address, so a write
//! near the advertised end silently lands somewhere near the start. We probe
//! one sector below each power of two up to the reported size, then bisect
//! towards the reported size, and at each address check that the data we
//! wrote reads back and that the address it would alias onto was left alone.
//! Everything touched is put back afterwards.

use crate::device::{BlockAccess, DeviceError, MAX_SECTOR_SIZE};
use crate::metadata::DeviceGeometry;
use crate::PROGRESS_STYLE;
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Where the walk starts, and how close to the reported size the bisection gets.
pub(crate) const PROBE_BASE: u64 = 1024 * 1024;

/// How many differing bytes get reported individually per check.
const REPORT_LIMIT: usize = 9;

/// One address to test, and the modulo it might alias under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeStep {
    pub address: u64,
    pub modulo: u64,
    pub iteration: u32,
}

/// The outcome of probing one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeRecord {
    pub address: u64,
    pub modulo: u64,
    pub iteration: u32,
    /// Bytes that did not read back as written.
    pub mismatch_count: usize,
    /// Bytes at the shadow address that changed because of our write.
    pub corruption_count: usize,
}

impl ProbeRecord {
    pub(crate) fn passed(&self) -> bool {
        self.mismatch_count == 0 && self.corruption_count == 0
    }
}

#[derive(Debug, Error)]
pub(crate) enum ProbeError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(
        "Probe at address {} found {} mismatched and {} corrupted bytes",
        .0.address,
        .0.mismatch_count,
        .0.corruption_count
    )]
    Failed(ProbeRecord),
}

/// Lays out the addresses to probe for a device of `total_size` bytes.
///
/// First every power of two from [`PROBE_BASE`] up to the total size, each
/// checked modulo half its address. Then, unless the total size was itself
/// reached, midpoints between the last power of two and the total size,
/// checked modulo that power of two, until within [`PROBE_BASE`] of the end.
pub(crate) fn plan(total_size: u64, sector_size: u64) -> Vec<ProbeStep> {
    let mut steps = Vec::new();
    let mut iteration = 0;
    let mut address = PROBE_BASE;
    while address <= total_size {
        steps.push(ProbeStep {
            address,
            modulo: address / 2,
            iteration,
        });
        iteration += 1;
        match address.checked_mul(2) {
            Some(next) => address = next,
            None => break,
        }
    }

    let Some(modulo) = steps.last().map(|step| step.address) else {
        return steps;
    };
    let mut address = modulo;
    while total_size - address > PROBE_BASE {
        let midpoint = address + (total_size - address) / 2;
        address = midpoint - midpoint % sector_size;
        steps.push(ProbeStep {
            address,
            modulo,
            iteration,
        });
        iteration += 1;
    }
    steps
}

/// Counts the bytes where `actual` differs from `expected`, passing the first
/// few to `report` and warning once that the rest are not shown.
fn count_differences(
    expected: &[u8],
    actual: &[u8],
    mut report: impl FnMut(usize, u8, u8),
) -> usize {
    let mut count = 0;
    for (offset, (&want, &got)) in expected.iter().zip(actual).enumerate() {
        if want != got {
            count += 1;
            if count <= REPORT_LIMIT {
                report(offset, want, got);
            } else if count == REPORT_LIMIT + 1 {
                warn!("...");
            }
        }
    }
    count
}

/// The byte pattern written on a given iteration: byte n is `iteration + n`, wrapping.
fn fill_pattern(pattern: &mut [u8], iteration: u32) {
    for (n, byte) in pattern.iter_mut().enumerate() {
        *byte = (iteration as usize).wrapping_add(n) as u8;
    }
}

/// Runs the write/verify/restore protocol against one device.
///
/// The buffers are sized once for the device and reused by every probe.
pub(crate) struct Prober<'a, D> {
    dev: &'a mut D,
    geometry: DeviceGeometry,
    shadow_before: Vec<u8>,
    shadow_after: Vec<u8>,
    original: Vec<u8>,
    pattern: Vec<u8>,
    expected: Vec<u8>,
    read_back: Vec<u8>,
}

impl<'a, D: BlockAccess> Prober<'a, D> {
    pub(crate) fn new(dev: &'a mut D, geometry: DeviceGeometry) -> Self {
        let sector = geometry.sector_len();
        let window = MAX_SECTOR_SIZE.max(geometry.sector_size) as usize;
        Self {
            dev,
            geometry,
            shadow_before: vec![0; sector],
            shadow_after: vec![0; sector],
            original: vec![0; window],
            pattern: vec![0; sector],
            expected: vec![0; window],
            read_back: vec![0; window],
        }
    }

    /// How many bytes from `working` to verify: at least one sector, at most
    /// the largest sector size, never past the reported end of the device.
    fn window_len(&self, working: u64) -> usize {
        let sector_size = self.geometry.sector_size;
        let room = self.geometry.total_size.saturating_sub(working);
        let len = MAX_SECTOR_SIZE.min(room) / sector_size * sector_size;
        len.max(sector_size) as usize
    }

    /// Probes the sector just below `step.address`.
    ///
    /// Device errors abort the probe immediately and may leave the test
    /// pattern in place; a returned record means both addresses were restored
    /// as far as the device lets us.
    pub(crate) fn probe(&mut self, step: ProbeStep) -> Result<ProbeRecord, DeviceError> {
        let sector = self.geometry.sector_len();
        let working = step.address - self.geometry.sector_size;
        let shadow = working % step.modulo;
        let window = self.window_len(working);

        self.dev.read_at(shadow, &mut self.shadow_before)?;
        self.dev.read_at(working, &mut self.original[..window])?;
        fill_pattern(&mut self.pattern, step.iteration);
        self.dev.write_at(working, &self.pattern)?;
        self.dev.read_at(working, &mut self.read_back[..window])?;

        // Past the first sector, nothing should have changed.
        self.expected[..sector].copy_from_slice(&self.pattern);
        self.expected[sector..window].copy_from_slice(&self.original[sector..window]);
        let original = &self.original;
        let mismatch_count = count_differences(
            &self.expected[..window],
            &self.read_back[..window],
            |offset, written, read| {
                warn!(
                    "Wrote {written:#X} at address {}, read back {read:#X}, original data was {:#X}",
                    working + offset as u64,
                    original[offset],
                );
            },
        );

        // A device that aliases reads as well as writes would hide the
        // corruption once the working sector is restored, so look now.
        self.dev.read_at(shadow, &mut self.shadow_after)?;
        let pattern = &self.pattern;
        let mut corruption_count = count_differences(
            &self.shadow_before,
            &self.shadow_after,
            |offset, before, after| {
                warn!(
                    "Writing {:#X} to address {} corrupted address {} from {before:#X} to {after:#X}",
                    pattern[offset],
                    working + offset as u64,
                    shadow + offset as u64,
                );
            },
        );

        let restore_len = if mismatch_count > 0 { window } else { sector };
        self.dev.write_at(working, &self.original[..restore_len])?;

        self.dev.read_at(shadow, &mut self.shadow_after)?;
        let lingering = count_differences(
            &self.shadow_before,
            &self.shadow_after,
            |offset, before, after| {
                warn!(
                    "Restoring address {} left address {} changed from {before:#X} to {after:#X}",
                    working + offset as u64,
                    shadow + offset as u64,
                );
            },
        );
        corruption_count = corruption_count.max(lingering);
        if corruption_count > 0 {
            warn!(shadow, "Trying to write back the original data at the corrupted address");
            self.dev.write_at(shadow, &self.shadow_before)?;
        }

        Ok(ProbeRecord {
            address: step.address,
            modulo: step.modulo,
            iteration: step.iteration,
            mismatch_count,
            corruption_count,
        })
    }
}

/// What a completed size test established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeSummary {
    pub probes: usize,
    /// The highest address that was probed successfully.
    pub verified_up_to: u64,
}

/// Walks the whole plan, stopping at the first probe that fails.
#[tracing::instrument(name = "size test", skip(dev, geometry), fields(total_size = geometry.total_size))]
pub(crate) fn run<D: BlockAccess>(
    dev: &mut D,
    geometry: DeviceGeometry,
) -> Result<ProbeSummary, ProbeError> {
    let steps = plan(geometry.total_size, geometry.sector_size);

    let bar_span = info_span!("probing");
    bar_span.pb_set_style(&PROGRESS_STYLE);
    bar_span.pb_set_length(geometry.total_size);
    let _bar_span_handle = bar_span.enter();

    let mut prober = Prober::new(dev, geometry);
    let mut verified_up_to = 0;
    for step in &steps {
        let record = prober.probe(*step)?;
        if !record.passed() {
            error!(
                record.address,
                record.modulo,
                record.iteration,
                record.mismatch_count,
                record.corruption_count,
                "DEVICE IS SMALLER THAN IT CLAIMS OR FAULTY"
            );
            return Err(ProbeError::Failed(record));
        }
        info!(
            address = record.address,
            modulo = record.modulo,
            "Verified"
        );
        bar_span.pb_inc(record.address - verified_up_to);
        verified_up_to = record.address;
    }
    Ok(ProbeSummary {
        probes: steps.len(),
        verified_up_to,
    })
}
