use anyhow::Context;
use clap::Parser;
use indicatif::{HumanBytes, ProgressStyle};
use tracing::{info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[macro_use]
extern crate lazy_static;

mod device;
mod gpt;
#[cfg(test)]
mod image;
mod metadata;
mod mounts;
mod partitions;
mod probe;
mod prompt;
mod report;

#[cfg_attr(target_os = "linux", path = "linux.rs")]
#[cfg_attr(not(target_os = "linux"), path = "other_os.rs")]
mod platform;

use device::DeviceFile;
use platform::{sanity_checks, ValidDevice};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw block device to inspect.
    ///
    /// This should be a whole disk (e.g. /dev/sdb,
    /// /dev/disk/by-id/usb-...), not a partition on it.
    #[clap(value_parser = clap::value_parser!(ValidDevice))]
    device: ValidDevice,

    /// Only report the device geometry and GPT; don't offer the read/write size test.
    #[clap(long)]
    skip_size_test: bool,

    /// Run even if the given path is a block device but not
    /// a disk (e.g. a single partition).
    #[clap(long)]
    allow_any_block_device: bool,

    /// Inspect the device even though this platform has no sanity checks.
    #[cfg(not(target_os = "linux"))]
    #[clap(long)]
    i_know_what_im_doing_let_me_skip_sanity_checks: bool,
}

const SIZE_TEST_WARNING: &str = "\
The read/write size test will check the real amount of storage
on the device. It tries not to corrupt the data on the device
but this cannot be guaranteed. It should only be run when
you suspect that the reported size of a new device is wrong.";

fn main() -> anyhow::Result<()> {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
    let args = Args::parse();

    sanity_checks(
        &args,
        args.device.partition,
        &args.device.path,
        &args.device.device,
    )?;
    let ValidDevice {
        device,
        partition,
        path,
    } = &args.device;
    info!(?partition, ?device, ?path, "Inspecting device");

    let geometry = platform::query_geometry(path).context("Querying the device geometry")?;
    info!(
        total_size = geometry.total_size,
        "{path:?} reports its total size as {}",
        HumanBytes(geometry.total_size)
    );
    info!(sector_size = geometry.sector_size, "{path:?} reports its sector size");

    let mut dev = DeviceFile::new(path);
    report::gpt(&mut dev, geometry).context("Reading the GPT")?;

    if args.skip_size_test {
        return Ok(());
    }
    if mounts::is_mounted(path)? {
        warn!(
            ?path,
            "Read/write size test cannot safely be done because the device has a mounted partition"
        );
        return Ok(());
    }
    println!("{SIZE_TEST_WARNING}");
    if !prompt::confirm("Do you want to do a read/write size test (Y/N)?")? {
        return Ok(());
    }
    if !prompt::confirm("Are you sure?")? {
        return Ok(());
    }

    let summary = probe::run(&mut dev, geometry).context("During read/write size test")?;
    info!(
        probes = summary.probes,
        verified_up_to = summary.verified_up_to,
        "Size test passed: {} verified",
        HumanBytes(summary.verified_up_to)
    );
    Ok(())
}

lazy_static! {
    pub(crate) static ref PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.white/grey} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta_precise}) {msg}",
    ).expect("Internal error in indicatif progress bar template syntax");
}
