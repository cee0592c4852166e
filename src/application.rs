use crate::protocol::Error;
use crate::transport::{DEFAULT_TIMEOUT, ReportPort, build_report, transact};
use log::debug;
use std::fmt::Display;
use std::time::Duration;

const CMD_GET_FIRMWARE_VERSION: u8 = 0xf0;
const CMD_ENTER_BOOTLOADER: u8 = 0xfd;

const STATUS_OK: u8 = 0x01;

/// Version of the hub firmware running in application mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    /// Reported for firmware that predates the version command.
    pub const LEGACY: FirmwareVersion = FirmwareVersion {
        major: 1,
        minor: 0xff,
    };

    /// Only firmware 2.x and later can be told to jump to the bootloader.
    pub fn supports_bootloader_command(&self) -> bool {
        self.major >= 2
    }
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A connection to a YKUSH running its normal firmware.
pub struct ApplicationSession<P> {
    port: P,
    firmware_version: Option<FirmwareVersion>,
    timeout: Duration,
}

impl<P: ReportPort> ApplicationSession<P> {
    pub fn new(port: P) -> Self {
        ApplicationSession {
            port,
            firmware_version: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        ApplicationSession { timeout, ..self }
    }

    /// The running firmware's version, asked of the device once and then cached.
    pub fn firmware_version(&mut self) -> Result<FirmwareVersion, Error> {
        if let Some(version) = self.firmware_version {
            return Ok(version);
        }

        let response = transact(
            &self.port,
            &build_report(CMD_GET_FIRMWARE_VERSION, |_| {}),
            self.timeout,
        )
        .map_err(|source| Error::DeviceIoError {
            source,
            action: "querying firmware version",
        })?;

        let version = match response {
            Some(r) if r[0] == STATUS_OK => FirmwareVersion {
                major: r[1],
                minor: r[2],
            },
            // Early firmware doesn't know the command.
            _ => FirmwareVersion::LEGACY,
        };
        debug!("Application firmware version {version}");

        self.firmware_version = Some(version);
        Ok(version)
    }

    /// Ask the firmware to restart into the bootloader. The device re-enumerates with a different
    /// product ID, so this handle is useless afterwards.
    pub fn enter_bootloader(self) -> Result<(), Error> {
        self.port
            .write_report(&build_report(CMD_ENTER_BOOTLOADER, |_| {}))
            .map_err(|source| Error::DeviceIoError {
                source,
                action: "entering bootloader mode",
            })?;

        // The device may already be gone; whatever comes back doesn't matter.
        if let Err(e) = self.port.read_report(self.timeout) {
            debug!("No acknowledgement for bootloader request: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedDevice;

    #[test]
    fn caches_firmware_version() {
        let device = SimulatedDevice::application(Some((2, 3)));
        let mut session = ApplicationSession::new(device.clone());

        let version = session.firmware_version().unwrap();
        assert_eq!(version, FirmwareVersion { major: 2, minor: 3 });
        assert!(version.supports_bootloader_command());
        assert_eq!(session.firmware_version().unwrap(), version);
        assert_eq!(device.commands(), vec![0xf0]);
    }

    #[test]
    fn legacy_firmware_falls_back() {
        let device = SimulatedDevice::application(None);
        let mut session = ApplicationSession::new(device);

        let version = session.firmware_version().unwrap();
        assert_eq!(version, FirmwareVersion::LEGACY);
        assert!(!version.supports_bootloader_command());
        assert_eq!(version.to_string(), "1.255");
    }

    #[test]
    fn sends_enter_bootloader_command() {
        let device = SimulatedDevice::application(Some((2, 0)));
        ApplicationSession::new(device.clone())
            .enter_bootloader()
            .unwrap();

        assert_eq!(device.commands(), vec![0xfd]);
        assert!(device.bootloader_requested());
    }
}
