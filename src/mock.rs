//! Simulated YKUSH devices for exercising the protocol code without hardware.

use crate::transport::{
    DeviceDescriptor, HidBackend, REPORT_SIZE, Report, ReportPort, TransportError,
};
use byteorder::{ByteOrder, LE};
use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::CString;
use std::rc::Rc;
use std::time::Duration;

enum Firmware {
    /// Normal hub firmware; `None` for versions predating the version command.
    Application { version: Option<(u8, u8)> },
    Bootloader { base: u32, flash: Vec<u8> },
}

struct FailureRule {
    command: u8,
    address: Option<u32>,
    remaining: u32,
}

struct DeviceState {
    firmware: Firmware,
    writes: Vec<Report>,
    pending: Option<Report>,
    failures: Vec<FailureRule>,
    read_failures: Vec<FailureRule>,
    fail_next_read: bool,
    muted: HashSet<u8>,
    bootloader_requested: bool,
    signed: bool,
}

/// A scripted device. Clones share state, so a test can keep one handle while the code under test
/// owns another.
#[derive(Clone)]
pub(crate) struct SimulatedDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl SimulatedDevice {
    fn with_firmware(firmware: Firmware) -> Self {
        SimulatedDevice {
            state: Rc::new(RefCell::new(DeviceState {
                firmware,
                writes: Vec::new(),
                pending: None,
                failures: Vec::new(),
                read_failures: Vec::new(),
                fail_next_read: false,
                muted: HashSet::new(),
                bootloader_requested: false,
                signed: false,
            })),
        }
    }

    pub fn application(version: Option<(u8, u8)>) -> Self {
        Self::with_firmware(Firmware::Application { version })
    }

    /// A bootloader with one byte per address and a freshly erased window.
    pub fn bootloader(base: u32, length: u32) -> Self {
        Self::with_firmware(Firmware::Bootloader {
            base,
            flash: vec![0xff; length as usize],
        })
    }

    /// Make the next `count` writes of `command` fail. With `address`, only PROGRAM_DEVICE packets
    /// for that address count.
    pub fn fail_writes(&self, command: u8, address: Option<u32>, count: u32) {
        self.state.borrow_mut().failures.push(FailureRule {
            command,
            address,
            remaining: count,
        });
    }

    /// Make reading the reply fail for the next `count` sends of `command`. The command itself
    /// still reaches the device.
    pub fn fail_reads(&self, command: u8, count: u32) {
        self.state.borrow_mut().read_failures.push(FailureRule {
            command,
            address: None,
            remaining: count,
        });
    }

    /// Never answer `command`.
    pub fn mute(&self, command: u8) {
        self.state.borrow_mut().muted.insert(command);
    }

    /// Overwrite one byte of simulated flash, as if it had been programmed wrongly.
    pub fn poke(&self, address: u32, value: u8) {
        if let Firmware::Bootloader { base, flash } = &mut self.state.borrow_mut().firmware {
            flash[(address - *base) as usize] = value;
        }
    }

    pub fn flash(&self) -> Vec<u8> {
        match &self.state.borrow().firmware {
            Firmware::Bootloader { flash, .. } => flash.clone(),
            Firmware::Application { .. } => Vec::new(),
        }
    }

    /// Every report the host managed to send, in order.
    pub fn writes(&self) -> Vec<Report> {
        self.state.borrow().writes.clone()
    }

    /// First byte of every successfully sent report.
    pub fn commands(&self) -> Vec<u8> {
        self.writes().iter().map(|r| r[0]).collect()
    }

    pub fn bootloader_requested(&self) -> bool {
        self.state.borrow().bootloader_requested
    }

    pub fn is_signed(&self) -> bool {
        self.state.borrow().signed
    }
}

fn take_failure(rules: &mut [FailureRule], report: &Report) -> bool {
    let address = LE::read_u32(&report[1..5]);
    let rule = rules.iter_mut().find(|rule| {
        rule.remaining > 0
            && rule.command == report[0]
            && rule.address.is_none_or(|a| a == address)
    });
    match rule {
        Some(rule) => {
            rule.remaining -= 1;
            true
        }
        None => false,
    }
}

impl DeviceState {
    fn handle(&mut self, request: &Report) -> Option<Report> {
        let mut response = [0u8; REPORT_SIZE];
        response[0] = request[0];

        match (&mut self.firmware, request[0]) {
            (Firmware::Application { version }, 0xf0) => match version {
                Some((major, minor)) => {
                    response[..3].copy_from_slice(&[0x01, *major, *minor]);
                }
                None => response[0] = 0x00,
            },
            (Firmware::Application { .. }, 0xfd) => {
                self.bootloader_requested = true;
                return None;
            }
            (Firmware::Bootloader { base, flash }, 0x02) => {
                response[1] = 56;
                response[2] = 1;
                response[3] = 0x01;
                LE::write_u32(&mut response[4..8], *base);
                LE::write_u32(&mut response[8..12], flash.len() as u32);
            }
            (Firmware::Bootloader { flash, .. }, 0x04) => flash.fill(0xff),
            (Firmware::Bootloader { base, flash }, 0x05) => {
                let start = (LE::read_u32(&request[1..5]) - *base) as usize;
                let len = request[5] as usize;
                flash[start..start + len].copy_from_slice(&request[8..8 + len]);
            }
            (Firmware::Bootloader { base, flash }, 0x07) => {
                let start = (LE::read_u32(&request[1..5]) - *base) as usize;
                let len = request[5] as usize;
                response[1..6].copy_from_slice(&request[1..6]);
                response[8..8 + len].copy_from_slice(&flash[start..start + len]);
            }
            (Firmware::Bootloader { .. }, 0x09) => self.signed = true,
            _ => {}
        }

        Some(response)
    }
}

impl ReportPort for SimulatedDevice {
    fn write_report(&self, report: &Report) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if take_failure(&mut state.failures, report) {
            return Err(TransportError::Backend(format!(
                "simulated failure sending command {:#04x}",
                report[0]
            )));
        }

        state.writes.push(*report);
        state.fail_next_read = take_failure(&mut state.read_failures, report);
        let response = state.handle(report);
        state.pending = if state.muted.contains(&report[0]) {
            None
        } else {
            response
        };
        Ok(())
    }

    fn read_report(&self, _timeout: Duration) -> Result<Option<Report>, TransportError> {
        let mut state = self.state.borrow_mut();
        let response = state.pending.take();
        if std::mem::take(&mut state.fail_next_read) {
            return Err(TransportError::Backend("simulated failure reading reply".to_owned()));
        }
        Ok(response)
    }
}

pub(crate) fn descriptor(product_id: u16, serial: &str, path: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: crate::device_ids::YKUSH_VID,
        product_id,
        serial_number: Some(serial.to_owned()),
        path: CString::new(path).unwrap(),
        product_string: Some("YKUSH".to_owned()),
        release_number: 0x0100,
    }
}

/// A bus of simulated devices. Bootloader-mode devices marked as `after_request` only show up
/// once some application-mode device has been asked to enter the bootloader, and that device
/// disappears at the same time.
#[derive(Default)]
pub(crate) struct MockBackend {
    devices: Vec<(DeviceDescriptor, SimulatedDevice, bool)>,
    busy: HashSet<CString>,
    pub enumerations: usize,
}

impl MockBackend {
    pub fn add(&mut self, descriptor: DeviceDescriptor, device: SimulatedDevice) {
        self.devices.push((descriptor, device, false));
    }

    pub fn add_after_request(&mut self, descriptor: DeviceDescriptor, device: SimulatedDevice) {
        self.devices.push((descriptor, device, true));
    }

    pub fn set_busy(&mut self, path: &str) {
        self.busy.insert(CString::new(path).unwrap());
    }

    fn requested(&self) -> bool {
        self.devices.iter().any(|(_, d, _)| d.bootloader_requested())
    }
}

impl HidBackend for MockBackend {
    type Port = SimulatedDevice;

    fn enumerate(&mut self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.enumerations += 1;
        let requested = self.requested();
        Ok(self
            .devices
            .iter()
            .filter(|(desc, device, after_request)| {
                desc.vendor_id == vendor_id
                    && !device.bootloader_requested()
                    && (!after_request || requested)
            })
            .map(|(desc, _, _)| desc.clone())
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Self::Port, TransportError> {
        if self.busy.contains(&descriptor.path) {
            return Err(TransportError::Backend("device is busy".to_owned()));
        }
        self.devices
            .iter()
            .find(|(desc, _, _)| desc.path == descriptor.path)
            .map(|(_, device, _)| device.clone())
            .ok_or_else(|| TransportError::Backend("no such device".to_owned()))
    }
}
