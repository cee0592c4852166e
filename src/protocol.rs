use crate::image::{FlashImage, MemoryLayout, MemoryType, is_erased_byte};
use crate::transport::{
    DEFAULT_TIMEOUT, Report, ReportPort, TransportError, build_report, transact, write_address,
};
use byteorder::{ByteOrder, LE, WriteBytesExt};
use log::{debug, info, trace, warn};
use num_enum::IntoPrimitive;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Bytes of flash carried by one PROGRAM_DEVICE packet. The 8-byte header plus this fills a report.
pub const PROGRAM_CHUNK_SIZE: usize = 56;

const PROGRAM_HEADER_SIZE: usize = 8;

// Well above the flash of any PIC the bootloader runs on. The image buffer is this big.
const MAX_REGION_LENGTH: u32 = 16 * 1024 * 1024;

// GET_DATA responses: echo, u16, five more header bytes, then the data.
const GET_DATA_HEADER_SIZE: usize = 8;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[allow(dead_code)] // All bootloader commands included for completeness
enum Command {
    QueryDevice = 0x02,
    UnlockConfig = 0x03,
    EraseDevice = 0x04,
    ProgramDevice = 0x05,
    ProgramComplete = 0x06,
    GetData = 0x07,
    ResetDevice = 0x08,
    // Must only follow a successful verify; the bootloader then writes its signature word and
    // will boot the application from then on.
    SignFlash = 0x09,
    QueryExtendedInfo = 0x0c,
}

/// Where a [BootloaderSession] is in the update sequence. Each operation is only valid in the
/// state the previous one leaves behind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    DeviceQueried,
    Erased,
    Programmed,
    Verified,
    Signed,
    Reset,
    Failed,
}

/// How often to resend a PROGRAM_DEVICE packet whose transfer failed.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            delay: Duration::from_millis(100),
        }
    }
}

/// Outcome of the programming phase.
#[derive(Clone, Debug, Default)]
pub struct ProgramReport {
    pub chunks: usize,
    /// Device addresses of chunks that still failed after every retry.
    pub failed_addresses: Vec<u32>,
}

/// A connection to a device in bootloader mode.
pub struct BootloaderSession<P> {
    port: P,
    layout: Option<MemoryLayout>,
    state: SessionState,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<P: ReportPort> BootloaderSession<P> {
    pub fn new(port: P) -> Self {
        BootloaderSession {
            port,
            layout: None,
            state: SessionState::Idle,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        BootloaderSession { timeout, ..self }
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        BootloaderSession { retry, ..self }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The device's memory layout, querying the device the first time it is needed.
    pub fn layout(&mut self) -> Result<MemoryLayout, Error> {
        match self.layout {
            Some(layout) => Ok(layout),
            None => self.query(),
        }
    }

    /// Ask the bootloader for its programmable region.
    pub fn query(&mut self) -> Result<MemoryLayout, Error> {
        self.ensure_state(SessionState::Idle)?;

        let result = self
            .expect_response(Command::QueryDevice, |_| {}, "querying device")
            .and_then(|response| Ok(decode_layout(&response)?));
        let layout = self.track(result)?;

        info!(
            "Programmable region: {:#x} to {:#x} ({:?} memory, {} byte(s) per address)",
            layout.base_address,
            layout.end_address(),
            layout.memory_type,
            layout.bytes_per_address_unit
        );

        self.layout = Some(layout);
        self.state = SessionState::DeviceQueried;
        Ok(layout)
    }

    /// Erase the whole programmable region. After this, the device only boots back into the
    /// bootloader until a new image is signed.
    pub fn erase(&mut self) -> Result<(), Error> {
        self.ensure_state(SessionState::DeviceQueried)?;

        let result = self.command(Command::EraseDevice, |_| {}, "erasing device");
        self.track(result)?;

        self.state = SessionState::Erased;
        Ok(())
    }

    /// Write `image` chunk by chunk. A chunk whose transfer keeps failing is recorded in the
    /// returned report and skipped, so the full extent of the damage is visible; verification will
    /// refuse to pass over it unless it only held erased bytes.
    pub fn program(&mut self, image: &FlashImage) -> Result<ProgramReport, Error> {
        self.ensure_state(SessionState::Erased)?;
        let layout = self.layout()?;
        self.ensure_layout(image, &layout)?;

        let mut report = ProgramReport::default();
        for chunk in image.chunks(PROGRAM_CHUNK_SIZE) {
            let mut request = build_report(Command::ProgramDevice.into(), |c| {
                write_address(c, chunk.address);
                // Fits: the query rejects layouts where a full chunk overflows this byte.
                c.write_u8((chunk.data.len() as u32 * layout.bytes_per_address_unit) as u8)
                    .unwrap();
                c.write_u16::<LE>(0).unwrap(); // Reserved
                debug_assert_eq!(c.position() as usize, PROGRAM_HEADER_SIZE);
            });
            request[PROGRAM_HEADER_SIZE..PROGRAM_HEADER_SIZE + chunk.data.len()]
                .copy_from_slice(chunk.data);

            match self.send_with_retry(&request, chunk.address) {
                Ok(()) => trace!("Programmed {} bytes at {:#x}", chunk.data.len(), chunk.address),
                Err(e) => {
                    warn!(
                        "Could not program the device at address {:#x} after {} attempts: {e}",
                        chunk.address, self.retry.attempts
                    );
                    report.failed_addresses.push(chunk.address);
                }
            }
            report.chunks += 1;
        }

        let result = self.command(Command::ProgramComplete, |_| {}, "finishing programming");
        self.track(result)?;

        if !report.failed_addresses.is_empty() {
            warn!(
                "{} of {} chunk(s) could not be programmed",
                report.failed_addresses.len(),
                report.chunks
            );
        }

        self.state = SessionState::Programmed;
        Ok(report)
    }

    /// Read back every chunk and compare it with `image`. Bytes that hold the erased pattern in
    /// `image` may read back as anything.
    pub fn verify(&mut self, image: &FlashImage) -> Result<(), Error> {
        self.ensure_state(SessionState::Programmed)?;
        let layout = self.layout()?;
        self.ensure_layout(image, &layout)?;

        for chunk in image.chunks(PROGRAM_CHUNK_SIZE) {
            let result = self
                .expect_response(
                    Command::GetData,
                    |c| {
                        write_address(c, chunk.address);
                        c.write_u8(chunk.data.len() as u8).unwrap();
                    },
                    "reading back flash",
                )
                .and_then(|response| {
                    let data =
                        &response[GET_DATA_HEADER_SIZE..GET_DATA_HEADER_SIZE + chunk.data.len()];
                    Ok(compare_chunk(chunk.address, chunk.data, data)?)
                });
            self.track(result)?;
            trace!("Verified {} bytes at {:#x}", chunk.data.len(), chunk.address);
        }

        self.state = SessionState::Verified;
        Ok(())
    }

    /// Mark the verified image as bootable.
    pub fn sign(&mut self) -> Result<(), Error> {
        self.ensure_state(SessionState::Verified)?;

        let result = self.command(Command::SignFlash, |_| {}, "signing flash");
        self.track(result)?;

        self.state = SessionState::Signed;
        Ok(())
    }

    /// Reboot into the new firmware. The device often drops off the bus before the host sees the
    /// command complete, so a transport failure here only produces a warning. Returns whether the
    /// command went through cleanly.
    pub fn reset(&mut self) -> Result<bool, Error> {
        self.ensure_state(SessionState::Signed)?;
        self.state = SessionState::Reset;

        match self.command(Command::ResetDevice, |_| {}, "resetting device") {
            Ok(()) => Ok(true),
            Err(Error::DeviceIoError { source, action }) => {
                warn!("Ignoring USB error while {action}, device is probably rebooting: {source}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn send_with_retry(&self, request: &Report, address: u32) -> Result<(), TransportError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match transact(&self.port, request, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) if attempt < attempts => {
                    debug!("Attempt {attempt}/{attempts} to program {address:#x} failed: {e}");
                    sleep(self.retry.delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a command whose reply, if any, carries nothing we need.
    fn command(
        &self,
        command: Command,
        fill: impl FnOnce(&mut std::io::Cursor<&mut [u8]>),
        action: &'static str,
    ) -> Result<(), Error> {
        let response = transact(&self.port, &build_report(command.into(), fill), self.timeout)
            .map_err(|source| Error::DeviceIoError { source, action })?;
        if response.is_none() {
            debug!("No reply while {action}; continuing");
        }
        Ok(())
    }

    fn expect_response(
        &self,
        command: Command,
        fill: impl FnOnce(&mut std::io::Cursor<&mut [u8]>),
        action: &'static str,
    ) -> Result<Report, Error> {
        transact(&self.port, &build_report(command.into(), fill), self.timeout)
            .map_err(|source| Error::DeviceIoError { source, action })?
            .ok_or_else(|| ProtocolError::NoResponse { action }.into())
    }

    fn ensure_state(&self, expected: SessionState) -> Result<(), ProtocolError> {
        if self.state != expected {
            Err(ProtocolError::UnexpectedState {
                expected,
                actual: self.state,
            })
        } else {
            Ok(())
        }
    }

    fn ensure_layout(&mut self, image: &FlashImage, layout: &MemoryLayout) -> Result<(), Error> {
        if image.layout() != layout {
            self.state = SessionState::Failed;
            return Err(ProtocolError::LayoutMismatch.into());
        }
        Ok(())
    }

    /// Any failure past this point leaves the session unusable.
    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }
}

/// Decode a QUERY_DEVICE response: echo, packet data size, bytes per address, then the first
/// memory region as type, base address and length.
fn decode_layout(response: &Report) -> Result<MemoryLayout, ProtocolError> {
    let echo = response[0];
    if echo != u8::from(Command::QueryDevice) {
        return Err(ProtocolError::UnexpectedEcho {
            expected: Command::QueryDevice.into(),
            actual: echo,
        });
    }

    let packet_data_size = response[1];
    let bytes_per_address_unit = response[2] as u32;
    let memory_type = MemoryType::try_from(response[3])
        .map_err(|e| ProtocolError::UnknownMemoryType(e.number))?;
    let base_address = LE::read_u32(&response[4..8]);
    let length = LE::read_u32(&response[8..12]);

    debug!("Bootloader accepts {packet_data_size} data bytes per packet");

    if memory_type == MemoryType::End {
        return Err(ProtocolError::InvalidLayout("no memory regions reported"));
    }
    if bytes_per_address_unit == 0 || PROGRAM_CHUNK_SIZE as u32 * bytes_per_address_unit > 0xff {
        return Err(ProtocolError::InvalidLayout(
            "unsupported number of bytes per address",
        ));
    }
    if length == 0 {
        return Err(ProtocolError::InvalidLayout("empty programmable region"));
    }
    if length > MAX_REGION_LENGTH {
        return Err(ProtocolError::InvalidLayout(
            "programmable region larger than any supported device",
        ));
    }
    if base_address.checked_add(length).is_none() {
        return Err(ProtocolError::InvalidLayout(
            "programmable region wraps around the address space",
        ));
    }

    Ok(MemoryLayout {
        bytes_per_address_unit,
        memory_type,
        base_address,
        length,
    })
}

fn compare_chunk(address: u32, expected: &[u8], actual: &[u8]) -> Result<(), ProtocolError> {
    let mismatch = expected
        .iter()
        .zip(actual)
        .position(|(&e, &a)| e != a && !is_erased_byte(e));

    match mismatch {
        None => Ok(()),
        Some(i) => Err(ProtocolError::VerificationFailed {
            address: address + i as u32,
            expected: expected[i],
            actual: actual[i],
        }),
    }
}

/// All errors (protocol and I/O) that can end a bootloader session.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("bootloader protocol error")]
    ProtocolError(#[from] ProtocolError),

    #[error("USB transaction error while {action}")]
    DeviceIoError {
        source: TransportError,
        action: &'static str,
    },
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("device did not respond while {action}")]
    NoResponse { action: &'static str },

    #[error("device answered command {expected:#04x} with {actual:#04x}")]
    UnexpectedEcho { expected: u8, actual: u8 },

    #[error("device reported memory type ({0:#04x}) that is not part of the protocol")]
    UnknownMemoryType(u8),

    #[error("device reported an unusable memory layout: {0}")]
    InvalidLayout(&'static str),

    #[error("firmware image was built for a different memory layout than the device reports")]
    LayoutMismatch,

    #[error(
        "data inconsistency at address {address:#x}: wrote {expected:#04x}, read back {actual:#04x}"
    )]
    VerificationFailed { address: u32, expected: u8, actual: u8 },

    #[error("operation not allowed now: expected session in {expected:?}, but it is {actual:?}")]
    UnexpectedState {
        expected: SessionState,
        actual: SessionState,
    },
}
