use crate::ihex::{HexError, HexRecord, RecordType};
use log::{debug, warn};
use num_enum::TryFromPrimitive;

/// What unprogrammed flash reads back as on the YKUSH's PIC, repeated across the whole window.
pub const ERASED_PATTERN: [u8; 2] = [0x3f, 0xff];

/// Whether `b` is one of the values unprogrammed flash can hold.
pub fn is_erased_byte(b: u8) -> bool {
    ERASED_PATTERN.contains(&b)
}

/// Memory region types reported by the bootloader's device query.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum MemoryType {
    Program = 0x01,
    Eeprom = 0x02,
    Config = 0x03,
    /// Terminates the region list; never a usable region.
    End = 0xff,
}

/// The programmable window the bootloader exposes, as reported in response to a device query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub bytes_per_address_unit: u32,
    pub memory_type: MemoryType,
    pub base_address: u32,
    pub length: u32,
}

impl MemoryLayout {
    /// One past the last programmable address.
    pub fn end_address(&self) -> u64 {
        self.base_address as u64 + self.length as u64
    }
}

/// A contiguous copy of the device's programmable window, ready to be sent to the bootloader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashImage {
    layout: MemoryLayout,
    data: Vec<u8>,
}

/// A slice of the image sent in one packet. `address` is the device address of `data[0]`.
#[derive(Copy, Clone, Debug)]
pub struct Chunk<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

impl FlashImage {
    /// An image covering `layout` where every byte still holds the erased pattern.
    pub fn erased(layout: MemoryLayout) -> Self {
        let data = ERASED_PATTERN
            .iter()
            .copied()
            .cycle()
            .take(layout.length as usize)
            .collect();
        FlashImage { layout, data }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split the image into consecutive chunks of at most `size` bytes, in address order.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Chunk<'_>> {
        let base = self.layout.base_address;
        self.data
            .chunks(size)
            .enumerate()
            .map(move |(i, data)| Chunk {
                address: base + (i * size) as u32,
                data,
            })
    }
}

/// Where a record ended up when merged into the image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// All payload bytes were copied.
    Written,
    /// The record ran past the end of the window; `dropped` trailing bytes were discarded.
    Clipped { dropped: usize },
    /// The record starts outside the window and was skipped entirely.
    OutsideWindow,
    /// An extended address record moved the segment base.
    SegmentBase(u32),
    /// Record type that does not affect the image.
    Ignored,
}

/// Merges Intel HEX records into a [FlashImage], tracking the running segment base.
pub struct ImageBuilder {
    image: FlashImage,
    segment_base: u32,
    clipped: usize,
    outside: usize,
}

impl ImageBuilder {
    pub fn new(layout: MemoryLayout) -> Self {
        ImageBuilder {
            image: FlashImage::erased(layout),
            segment_base: 0,
            clipped: 0,
            outside: 0,
        }
    }

    /// Absolute address of a record's 16-bit `address` under the current segment base.
    pub fn resolve(&self, address: u16) -> u32 {
        self.segment_base.wrapping_add(address as u32)
    }

    pub fn apply(&mut self, record: &HexRecord) -> Placement {
        match record.kind() {
            Some(RecordType::Data) => self.apply_data(record),
            Some(RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress) => {
                match record.segment_base() {
                    Some(base) => {
                        self.segment_base = base;
                        Placement::SegmentBase(base)
                    }
                    None => Placement::Ignored,
                }
            }
            _ => Placement::Ignored,
        }
    }

    fn apply_data(&mut self, record: &HexRecord) -> Placement {
        let absolute = self.resolve(record.address);
        let layout = self.image.layout;

        // Records below the window would land at a negative offset.
        let start = match absolute.checked_sub(layout.base_address) {
            Some(start) if start < layout.length => start as usize,
            _ => {
                debug!(
                    "Skipping {} byte record at {absolute:#010x}, outside the programmable window",
                    record.payload.len()
                );
                self.outside += 1;
                return Placement::OutsideWindow;
            }
        };

        let end = (start + record.payload.len()).min(self.image.data.len());
        let kept = end - start;
        self.image.data[start..end].copy_from_slice(&record.payload[..kept]);

        let dropped = record.payload.len() - kept;
        if dropped == 0 {
            Placement::Written
        } else {
            debug!("Clipping record at {absolute:#010x}: {dropped} bytes past end of window");
            self.clipped += 1;
            Placement::Clipped { dropped }
        }
    }

    pub fn finish(self) -> FlashImage {
        if self.outside > 0 {
            warn!(
                "Ignored {} record(s) outside the programmable window {:#x}..{:#x}",
                self.outside,
                self.image.layout.base_address,
                self.image.layout.end_address()
            );
        }
        if self.clipped > 0 {
            warn!(
                "Truncated {} record(s) running past the end of the programmable window",
                self.clipped
            );
        }
        self.image
    }
}

/// Build a complete image for `layout` from a record stream, stopping at the first bad record.
pub fn build(
    layout: MemoryLayout,
    records: impl IntoIterator<Item = Result<HexRecord, HexError>>,
) -> Result<FlashImage, HexError> {
    let mut builder = ImageBuilder::new(layout);
    for record in records {
        builder.apply(&record?);
    }
    Ok(builder.finish())
}
