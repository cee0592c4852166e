use crate::application::ApplicationSession;
use crate::device_ids::{DeviceMode, YKUSH_VID};
use crate::ihex::{self, HexError};
use crate::image::{self, MemoryLayout};
use crate::protocol::{self, BootloaderSession, RetryPolicy};
use crate::transport::{DEFAULT_TIMEOUT, DeviceDescriptor, HidBackend, TransportError};
use log::{info, warn};
use std::fmt::Display;
use std::io::BufRead;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Settings for one firmware update run.
#[derive(Clone, Debug)]
pub struct UpdateOptions {
    /// Only touch the device with this USB serial number.
    pub serial: Option<String>,
    /// How long to wait for a device to come back in bootloader mode after asking it to switch.
    pub settle_delay: Duration,
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            serial: None,
            settle_delay: Duration::from_secs(3),
            response_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// The steps of an update, in the order they run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Enumerate,
    OpenBootloader,
    Query,
    Import,
    Erase,
    Program,
    Verify,
    Sign,
    Reset,
}

impl Phase {
    pub const COUNT: usize = 9;

    /// 1-based position in the sequence, for progress output.
    pub fn step(self) -> usize {
        self as usize + 1
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            Phase::Enumerate => "enumerating devices",
            Phase::OpenBootloader => "opening device in bootloader mode",
            Phase::Query => "querying bootloader",
            Phase::Import => "importing firmware image",
            Phase::Erase => "erasing device",
            Phase::Program => "programming device",
            Phase::Verify => "verifying written data",
            Phase::Sign => "signing image",
            Phase::Reset => "resetting device",
        };
        f.write_str(label)
    }
}

/// What a successful update did.
#[derive(Clone, Debug)]
pub struct UpdateSummary {
    pub serial_number: Option<String>,
    pub layout: MemoryLayout,
    /// Chunks that could not be written. Only erased-pattern chunks can end up here without
    /// failing verification.
    pub program_failures: Vec<u32>,
    /// Whether the reset command went through without a USB error.
    pub reset_acknowledged: bool,
}

fn announce(phase: Phase) {
    info!("{}/{}. {}...", phase.step(), Phase::COUNT, capitalize(phase));
}

fn capitalize(phase: Phase) -> String {
    let label = phase.to_string();
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => label,
    }
}

fn matches(device: &DeviceDescriptor, mode: DeviceMode, serial: Option<&str>) -> bool {
    if device.mode() != Some(mode) {
        return false;
    }

    match serial {
        Some(serial) => device.serial_number.as_deref() == Some(serial),
        None => true,
    }
}

/// Flash the Intel HEX image read from `firmware` onto a YKUSH, switching it into bootloader mode
/// first if it is running its normal firmware. The image is parsed before anything is erased.
pub fn update<B: HidBackend>(
    backend: &mut B,
    firmware: impl BufRead,
    options: &UpdateOptions,
) -> Result<UpdateSummary, Error> {
    announce(Phase::Enumerate);
    if request_bootloader(backend, options)? {
        info!(
            "Device switching to bootloader mode, waiting {:?} for it to settle",
            options.settle_delay
        );
        sleep(options.settle_delay);
    }

    announce(Phase::OpenBootloader);
    let device = find_device(backend, DeviceMode::Bootloader, options.serial.as_deref())?;
    let port = backend.open(&device).map_err(|source| Error::DeviceBusy {
        mode: DeviceMode::Bootloader,
        path: device.path.to_string_lossy().into_owned(),
        source,
    })?;
    info!(
        "Selected device serial number {}",
        device.serial_number.as_deref().unwrap_or("INVALID")
    );

    let mut session = BootloaderSession::new(port)
        .with_timeout(options.response_timeout)
        .with_retry_policy(options.retry);
    let in_phase = |phase: Phase| move |source: protocol::Error| Error::Phase { phase, source };

    announce(Phase::Query);
    let layout = session.query().map_err(in_phase(Phase::Query))?;

    // Everything that can be wrong with the image is caught here, before the erase.
    announce(Phase::Import);
    let image = image::build(
        layout,
        ihex::records(firmware, layout.bytes_per_address_unit),
    )?;

    announce(Phase::Erase);
    session.erase().map_err(in_phase(Phase::Erase))?;

    announce(Phase::Program);
    let report = session.program(&image).map_err(in_phase(Phase::Program))?;

    announce(Phase::Verify);
    session.verify(&image).map_err(in_phase(Phase::Verify))?;

    announce(Phase::Sign);
    session.sign().map_err(in_phase(Phase::Sign))?;

    announce(Phase::Reset);
    let reset_acknowledged = session.reset().map_err(in_phase(Phase::Reset))?;

    Ok(UpdateSummary {
        serial_number: device.serial_number,
        layout,
        program_failures: report.failed_addresses,
        reset_acknowledged,
    })
}

/// Ask the first matching application-mode device that supports it to restart into its
/// bootloader. Returns whether one did.
fn request_bootloader<B: HidBackend>(
    backend: &mut B,
    options: &UpdateOptions,
) -> Result<bool, Error> {
    let devices = backend.enumerate(YKUSH_VID).map_err(Error::Enumeration)?;

    for device in devices
        .iter()
        .filter(|d| matches(d, DeviceMode::Application, options.serial.as_deref()))
    {
        let port = match backend.open(device) {
            Ok(port) => port,
            Err(e) => {
                warn!(
                    "Could not open {} ({}): {e}",
                    device.path.to_string_lossy(),
                    device.usb_id()
                );
                continue;
            }
        };

        let mut app = ApplicationSession::new(port).with_timeout(options.response_timeout);
        let version = app.firmware_version().map_err(|source| Error::Phase {
            phase: Phase::Enumerate,
            source,
        })?;

        if version.supports_bootloader_command() {
            info!("Device located (firmware {version}), requesting bootloader mode");
            app.enter_bootloader().map_err(|source| Error::Phase {
                phase: Phase::Enumerate,
                source,
            })?;
            return Ok(true);
        }

        warn!(
            "Device {} runs firmware {version}, which cannot switch to bootloader mode by itself",
            device.serial_number.as_deref().unwrap_or("INVALID")
        );
    }

    Ok(false)
}

fn find_device<B: HidBackend>(
    backend: &mut B,
    mode: DeviceMode,
    serial: Option<&str>,
) -> Result<DeviceDescriptor, Error> {
    let devices = backend.enumerate(YKUSH_VID).map_err(Error::Enumeration)?;
    let mut candidates = devices.into_iter().filter(|d| matches(d, mode, serial));

    match candidates.next() {
        None => Err(Error::DeviceNotFound(mode)),
        Some(device) => {
            if candidates.next().is_some() {
                Err(Error::MultipleDevices(mode))
            } else {
                Ok(device)
            }
        }
    }
}

/// Everything that can abort an update. Anything after the erase leaves the device in bootloader
/// mode, from where the update can simply be run again.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("could not enumerate HID devices")]
    Enumeration(#[source] TransportError),

    #[error("no YKUSH found in {0} mode (only firmware v2 and later can enter it on request)")]
    DeviceNotFound(DeviceMode),

    #[error("multiple YKUSH devices found in {0} mode; pick one by serial number")]
    MultipleDevices(DeviceMode),

    #[error("found a YKUSH in {mode} mode at {path}, but could not open it; is it in use?")]
    DeviceBusy {
        mode: DeviceMode,
        path: String,
        source: TransportError,
    },

    #[error("invalid firmware image")]
    Image(#[from] HexError),

    #[error("failed while {phase}")]
    Phase {
        phase: Phase,
        source: protocol::Error,
    },
}
