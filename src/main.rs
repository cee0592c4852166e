use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use ykush_fwupdate::transport::HidApiBackend;
use ykush_fwupdate::update::{UpdateOptions, update};

#[derive(Parser, Debug)]
#[command(
    name = "ykush-fwupdate",
    version,
    about = "Firmware update tool for Yepkit YKUSH hubs",
    long_about = "Firmware update tool for Yepkit YKUSH hubs.\n\n\
        Switches the hub into its bootloader if needed, then erases, programs, verifies and \
        signs the given Intel HEX image. --settle-secs only needs changing for hubs that take \
        unusually long to re-enumerate."
)]
struct Opt {
    /// The input Intel HEX file
    infile: PathBuf,

    /// USB serial number of the device to update
    #[arg(short, long)]
    serial: Option<String>,

    /// Seconds to wait for the device to reappear after switching it to bootloader mode
    #[arg(long, default_value_t = 3, value_name = "SECONDS")]
    settle_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("YKUSH_FWUPDATE_LOG", "info")
            .write_style("YKUSH_FWUPDATE_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    // Open the image up front so a typo in the path never gets as far as the device.
    let file = File::open(&opt.infile)
        .with_context(|| format!("could not open {}", opt.infile.display()))?;

    let options = UpdateOptions {
        serial: opt.serial,
        settle_delay: Duration::from_secs(opt.settle_secs),
        ..UpdateOptions::default()
    };

    let mut backend = HidApiBackend::new()?;
    let summary = update(&mut backend, BufReader::new(file), &options)?;

    if !summary.program_failures.is_empty() {
        warn!(
            "{} chunk(s) holding only erased bytes could not be written: {:#x?}",
            summary.program_failures.len(),
            summary.program_failures
        );
    }
    if !summary.reset_acknowledged {
        warn!("Device did not acknowledge the reset; unplug and replug it if it does not restart");
    }

    info!(
        "Firmware updated on {}",
        summary.serial_number.as_deref().unwrap_or("INVALID")
    );
    Ok(())
}
