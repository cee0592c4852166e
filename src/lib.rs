/// Switch a YKUSH from its normal firmware into the bootloader.
pub mod application;

/// Check if a device is a YKUSH and find its mode based on USB IDs.
pub mod device_ids;

/// Decode Intel HEX firmware images.
pub mod ihex;

/// Assemble decoded records into a flash-ready copy of the device's programmable window.
pub mod image;

/// Erase, program, verify, sign and reset a YKUSH running its HID bootloader.
pub mod protocol;

/// Exchange fixed-size HID reports with a device, independent of the HID library in use.
pub mod transport;

/// Run a complete firmware update, from finding the device to resetting it.
pub mod update;

#[cfg(test)]
mod mock;
