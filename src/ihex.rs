use log::debug;
use num_enum::TryFromPrimitive;
use std::io::BufRead;
use thiserror::Error;

/// Record types defined by the Intel HEX format. Only data, end-of-file and the two extended
/// address types affect the flash image; the start address types are skipped.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

/// A single decoded `:BBAAAATT[DD...]CC` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexRecord {
    pub byte_count: u8,
    pub address: u16,
    pub record_type: u8,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Decode one line of an Intel HEX file. `line` is the 1-based line number used in errors.
    pub fn parse(text: &str, line: usize) -> Result<Self, HexError> {
        let digits = text
            .trim_end()
            .strip_prefix(':')
            .ok_or(HexError::MalformedRecord { line })?;

        let bytes = decode_hex(digits).ok_or(HexError::MalformedRecord { line })?;

        // Byte count, 16-bit address, type and checksum are always present.
        if bytes.len() < 5 || bytes.len() != 5 + bytes[0] as usize {
            return Err(HexError::MalformedRecord { line });
        }

        let (body, checksum) = bytes.split_at(bytes.len() - 1);
        let record = HexRecord {
            byte_count: body[0],
            address: u16::from_be_bytes([body[1], body[2]]),
            record_type: body[3],
            payload: body[4..].to_vec(),
            checksum: checksum[0],
        };

        let expected = record.computed_checksum();
        if expected != record.checksum {
            return Err(HexError::ChecksumMismatch {
                line,
                expected,
                actual: record.checksum,
            });
        }

        match record.kind() {
            Some(RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress)
                if record.payload.len() != 2 =>
            {
                Err(HexError::MalformedRecord { line })
            }
            _ => Ok(record),
        }
    }

    /// The record type, or [None] for types outside the Intel HEX definition.
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::try_from(self.record_type).ok()
    }

    /// Two's complement of the sum of every byte preceding the checksum.
    pub fn computed_checksum(&self) -> u8 {
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        [self.byte_count, addr_hi, addr_lo, self.record_type]
            .iter()
            .chain(&self.payload)
            .fold(0u8, |sum, &b| sum.wrapping_add(b))
            .wrapping_neg()
    }

    /// For extended address records, the base address they establish for subsequent data records.
    pub fn segment_base(&self) -> Option<u32> {
        let value = match self.payload[..] {
            [hi, lo] => u16::from_be_bytes([hi, lo]) as u32,
            _ => return None,
        };
        match self.kind()? {
            RecordType::ExtendedSegmentAddress => Some(value << 4),
            RecordType::ExtendedLinearAddress => Some(value << 16),
            _ => None,
        }
    }
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 {
        return None;
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = char::from(pair[0]).to_digit(16)?;
            let lo = char::from(pair[1]).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}

/// Forward-only stream of records read from an Intel HEX file. Stops after the end-of-file record
/// or the first error.
pub struct Records<R> {
    lines: std::io::Lines<R>,
    line: usize,
    bytes_per_address_unit: u32,
    finished: bool,
}

/// Read records from `reader`, rejecting data records whose byte count is not a multiple of the
/// device's `bytes_per_address_unit`.
pub fn records<R: BufRead>(reader: R, bytes_per_address_unit: u32) -> Records<R> {
    Records {
        lines: reader.lines(),
        line: 0,
        bytes_per_address_unit: bytes_per_address_unit.max(1),
        finished: false,
    }
}

impl<R: BufRead> Records<R> {
    fn next_record(&mut self) -> Option<Result<HexRecord, HexError>> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;

            if text.trim().is_empty() {
                continue;
            }

            let record = match HexRecord::parse(&text, self.line) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            if record.kind() == Some(RecordType::Data)
                && record.byte_count as u32 % self.bytes_per_address_unit != 0
            {
                return Some(Err(HexError::UnalignedRecord {
                    line: self.line,
                    byte_count: record.byte_count,
                    unit: self.bytes_per_address_unit,
                }));
            }

            return Some(Ok(record));
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<HexRecord, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let item = self.next_record();
        match &item {
            Some(Ok(record)) if record.kind() == Some(RecordType::EndOfFile) => {
                debug!("End-of-file record at line {}", self.line);
                self.finished = true;
            }
            Some(Err(_)) => self.finished = true,
            Some(Ok(_)) => {}
            None => {
                debug!("Firmware image ended without an end-of-file record");
                self.finished = true;
            }
        }
        item
    }
}

/// Errors found while reading an Intel HEX image. All of them are detected before the device is
/// touched.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HexError {
    #[error("line {line} is not a valid Intel HEX record")]
    MalformedRecord { line: usize },

    #[error("bad checksum on line {line}: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },

    #[error(
        "record on line {line} holds {byte_count} bytes, expected a multiple of {unit} byte(s)"
    )]
    UnalignedRecord { line: usize, byte_count: u8, unit: u32 },

    #[error("I/O error while reading firmware image")]
    Io(#[from] std::io::Error),
}
