use crate::device_ids::{DeviceMode, UsbId, identify_device};
use byteorder::{LE, WriteBytesExt};
use hidapi::{DeviceInfo, HidApi, HidDevice, HidError};
use log::trace;
use std::ffi::CString;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

/// Every report exchanged with a YKUSH, in either mode, is exactly this long.
pub const REPORT_SIZE: usize = 64;

/// How long to wait for the device to answer a command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

pub type Report = [u8; REPORT_SIZE];

/// Metadata about an enumerated HID device, detached from whichever backend found it.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub path: CString,
    pub product_string: Option<String>,
    pub release_number: u16,
}

impl DeviceDescriptor {
    pub fn usb_id(&self) -> UsbId {
        UsbId {
            vid: self.vendor_id,
            pid: self.product_id,
        }
    }

    pub fn mode(&self) -> Option<DeviceMode> {
        identify_device(self.usb_id())
    }
}

impl From<&DeviceInfo> for DeviceDescriptor {
    fn from(info: &DeviceInfo) -> Self {
        DeviceDescriptor {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial_number: info.serial_number().map(str::to_owned),
            path: info.path().to_owned(),
            product_string: info.product_string().map(str::to_owned),
            release_number: info.release_number(),
        }
    }
}

/// An open device that exchanges fixed-size reports. Closing happens on drop.
pub trait ReportPort {
    fn write_report(&self, report: &Report) -> Result<(), TransportError>;

    /// Wait up to `timeout` for a report. [None] means nothing (or a truncated report) arrived.
    fn read_report(&self, timeout: Duration) -> Result<Option<Report>, TransportError>;
}

/// Finds and opens devices. The protocol code only ever sees this trait, so the HID library is
/// chosen in one place.
pub trait HidBackend {
    type Port: ReportPort;

    /// List devices with the given vendor ID, refreshing the backend's view of the bus first.
    fn enumerate(&mut self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>, TransportError>;

    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Port, TransportError>;
}

/// Build a zero-padded report starting with `command`. `fill` writes any command-specific fields
/// that follow it.
pub fn build_report(command: u8, fill: impl FnOnce(&mut Cursor<&mut [u8]>)) -> Report {
    let mut report = [0u8; REPORT_SIZE];
    let mut cursor = Cursor::new(&mut report[..]);
    cursor.write_u8(command).unwrap();
    fill(&mut cursor);
    report
}

/// Write a little-endian address field; used by several bootloader commands.
pub(crate) fn write_address(cursor: &mut Cursor<&mut [u8]>, address: u32) {
    cursor.write_u32::<LE>(address).unwrap();
}

/// Send one report and wait for the device's answer.
pub fn transact<P: ReportPort + ?Sized>(
    port: &P,
    request: &Report,
    timeout: Duration,
) -> Result<Option<Report>, TransportError> {
    trace!("Sending report {:02x?}", &request[..]);
    port.write_report(request)?;
    let response = port.read_report(timeout)?;
    match &response {
        Some(report) => trace!("Received report {:02x?}", &report[..]),
        None => trace!("No response within {timeout:?}"),
    }
    Ok(response)
}

/// The production backend, built on the system's hidapi.
pub struct HidApiBackend {
    api: HidApi,
}

impl HidApiBackend {
    pub fn new() -> Result<Self, TransportError> {
        Ok(HidApiBackend {
            api: HidApi::new_without_enumerate()?,
        })
    }
}

impl HidBackend for HidApiBackend {
    type Port = HidApiPort;

    fn enumerate(&mut self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.api.reset_devices()?;
        self.api.add_devices(vendor_id, 0)?;
        Ok(self.api.device_list().map(DeviceDescriptor::from).collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Port, TransportError> {
        let device = self.api.open_path(&device.path)?;
        device.set_blocking_mode(true)?;
        Ok(HidApiPort { device })
    }
}

pub struct HidApiPort {
    device: HidDevice,
}

impl ReportPort for HidApiPort {
    fn write_report(&self, report: &Report) -> Result<(), TransportError> {
        // The YKUSH doesn't number its reports, so hidapi wants a leading zero report ID.
        let mut buf = [0u8; 1 + REPORT_SIZE];
        buf[1..].copy_from_slice(report);
        self.device.write(&buf)?;
        Ok(())
    }

    fn read_report(&self, timeout: Duration) -> Result<Option<Report>, TransportError> {
        // Leave room for a report ID some platforms prepend.
        let mut buf = [0u8; 1 + REPORT_SIZE];
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let size = self.device.read_timeout(&mut buf, timeout_ms)?;
        Ok(frame(&buf, size))
    }
}

/// Cut a report out of the first `size` bytes of `buf`, dropping a leading report ID if there is
/// one. Anything shorter than a full report is discarded.
fn frame(buf: &[u8], size: usize) -> Option<Report> {
    let start = match size {
        REPORT_SIZE => 0,
        n if n == REPORT_SIZE + 1 => 1,
        0 => return None,
        n => {
            trace!("Discarding {n} byte report, expected {REPORT_SIZE}");
            return None;
        }
    };

    let mut report = [0u8; REPORT_SIZE];
    report.copy_from_slice(&buf[start..start + REPORT_SIZE]);
    Some(report)
}

/// Failures of the underlying HID link.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("HID error")]
    Hid(#[from] HidError),

    #[error("{0}")]
    Backend(String),
}
