//! Member placement inside a record
//!
//! Ordinary members are described by a byte offset. Bit-fields additionally
//! carry a [`Bitfield`] telling the code generator how to pull the value out
//! of an aligned load:
//!
//! ```text
//! value = (load(read_bytes) at offset) >> access_rshift & mask
//! ```
//!
//! Stores are a read-modify-write over the same window.

use super::sized::SizedType;

/// Extraction recipe for a bit-field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitfield {
    /// Width of the load, one of 1, 2, 4 or 8
    pub read_bytes: usize,
    /// Right shift applied to the loaded value
    pub access_rshift: usize,
    /// Mask applied after shifting, `(1 << width) - 1`
    pub mask: u64,
}

impl Bitfield {
    /// Find the narrowest naturally aligned load covering a bit range.
    ///
    /// `bit_offset` is measured from the start of the record. Returns the
    /// byte offset of the load together with the extraction recipe, or
    /// `None` when no aligned load of at most 8 bytes covers the range
    /// (only possible for widths above 64 or packed layouts).
    pub fn locate(bit_offset: usize, width: usize) -> Option<(usize, Bitfield)> {
        if width > 64 {
            return None;
        }
        let byte_start = bit_offset / 8;
        let byte_end = (bit_offset + width.max(1) - 1) / 8;

        [1usize, 2, 4, 8].into_iter().find_map(|read_bytes| {
            // Largest multiple of read_bytes not past byte_start
            let offset = byte_start - byte_start % read_bytes;
            if offset + read_bytes > byte_end {
                Some((
                    offset,
                    Bitfield {
                        read_bytes,
                        access_rshift: bit_offset - offset * 8,
                        mask: mask_for(width),
                    },
                ))
            } else {
                None
            }
        })
    }
}

fn mask_for(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// One member of a record
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub ty: SizedType,
    /// Byte offset from the start of the record. For bit-fields this is
    /// the offset of the load window, not of the first bit.
    pub offset: usize,
    /// Present iff the member is a bit-field
    pub bitfield: Option<Bitfield>,
}

impl Field {
    /// An ordinary member at a frontend-reported byte offset
    pub fn new(ty: SizedType, offset: usize) -> Self {
        Self {
            ty,
            offset,
            bitfield: None,
        }
    }

    /// A bit-field member of `width` bits at absolute `bit_offset`
    pub fn bitfield(ty: SizedType, bit_offset: usize, width: usize) -> Option<Self> {
        let (offset, bitfield) = Bitfield::locate(bit_offset, width)?;
        Some(Self {
            ty,
            offset,
            bitfield: Some(bitfield),
        })
    }

    pub fn is_bitfield(&self) -> bool {
        self.bitfield.is_some()
    }

    /// The same member seen from a record that embeds its parent at
    /// `base` bytes.
    pub fn shifted(&self, base: usize) -> Self {
        Self {
            ty: self.ty.clone(),
            offset: self.offset + base,
            bitfield: self.bitfield,
        }
    }
}
