use std::fmt::Display;

/// Microchip's vendor ID, used by every YKUSH model.
pub const YKUSH_VID: u16 = 0x04d8;

/// Product IDs reported while the normal hub firmware runs: YKUSH beta, YKUSH, YKUSH3 and a later
/// YKUSH revision.
const APPLICATION_PIDS: &[u16] = &[0x0042, 0xf2ff, 0xf11b, 0xf2fd];

/// Product IDs reported by the bootloader: YKUSH, YKUSH3.
const BOOTLOADER_PIDS: &[u16] = &[0xf11c, 0xf0cd];

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Modes a YKUSH can be in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    /// Running the normal hub firmware.
    Application,
    /// Running the in-field bootloader, ready to accept a new image.
    Bootloader,
}

impl Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceMode::Application => write!(f, "application"),
            DeviceMode::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Find a device's mode based on its USB ID, or [None] if it is not a YKUSH.
pub fn identify_device(id: UsbId) -> Option<DeviceMode> {
    match id {
        UsbId { vid: YKUSH_VID, pid } if APPLICATION_PIDS.contains(&pid) => {
            Some(DeviceMode::Application)
        }
        UsbId { vid: YKUSH_VID, pid } if BOOTLOADER_PIDS.contains(&pid) => {
            Some(DeviceMode::Bootloader)
        }
        _ => None,
    }
}
