//! Cursor-based parser over a byte slice.
//!
//! [`crate::file::parser::Parser`] is the reading counterpart of
//! [`crate::writer::BinaryWriter`]. It decodes fixed-width primitives, every variable-length
//! integer scheme the writer emits, strings and GUIDs, while keeping track of its position and
//! refusing to read past the end of the underlying slice.
//!
//! # Compressed integers
//!
//! | Method | Scheme |
//! |---|---|
//! | [`Parser::read_compressed_uint`] | ECMA-335 II.23.2, 1/2/4 bytes, big-endian payload |
//! | [`Parser::read_compressed_int`] | same length classes, biased signed payload |
//! | [`Parser::read_compressed_full_uint`] | 1-4 bytes with a low-bit length tag, `0x0F` escape |
//! | [`Parser::read_compressed_full_int`] | signed variant of the above |
//! | [`Parser::read_7bit_encoded_int`] | LEB128-style length prefix |
//!
//! # Examples
//!
//! ```rust
//! use dotsym::Parser;
//!
//! let data = [0x80, 0x80, 0x7F];
//! let mut parser = Parser::new(&data);
//! assert_eq!(parser.read_compressed_uint()?, 0x80);
//! assert_eq!(parser.read_compressed_int()?, -1);
//! assert!(!parser.has_more_data());
//! # Ok::<(), dotsym::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, CilIO},
    Error::OutOfBounds,
    Result,
};

/// A bounds-checked reader over a borrowed byte slice.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new parser positioned at the start of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying data
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the underlying data is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True while the cursor has not reached the end
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the cursor to an absolute position. Seeking to the very end is allowed.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` lies beyond the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Skip `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `step` bytes remain.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        self.position = self.calc_end_position(step)?;
        Ok(())
    }

    /// Current cursor position
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// The complete underlying data
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of bytes left after the cursor
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Look at the next byte without consuming it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data.get(self.position).copied().ok_or(OutOfBounds)
    }

    /// Advance the cursor to the next multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the padding runs past the end.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.advance_by(padding)
    }

    /// Read a little-endian primitive.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit in the remaining bytes.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read `length` raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a 16-byte GUID in its mixed-endian wire layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 16 bytes remain.
    pub fn read_guid(&mut self) -> Result<uguid::Guid> {
        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(self.read_bytes(16)?);
        Ok(uguid::Guid::from_bytes(buffer))
    }

    /// Read an ECMA-335 compressed unsigned integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input, or
    /// [`crate::Error::Malformed`] if the first byte carries an invalid length tag.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 110xxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {:#x}", first_byte))
    }

    /// Read a compressed signed integer as produced by
    /// [`crate::writer::BinaryWriter::write_compressed_int`].
    ///
    /// Non-negative values are stored shifted left by one with a clear low bit. Negative values
    /// set the low bit and store `bias + value` in the remaining bits, where the bias is `0x40`,
    /// `0x2000` or `0x2000_0000` for the 1, 2 and 4 byte classes. The 4 byte class uses 30
    /// payload bits, so its tag byte may have the `0x20` bit set.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let first_byte = self.read_le::<u8>()?;

        let (raw, bias) = if (first_byte & 0x80) == 0 {
            (u32::from(first_byte), 0x40_i32)
        } else if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            (
                ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte),
                0x2000,
            )
        } else {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            (
                ((u32::from(first_byte) & 0x3F) << 24) | (b1 << 16) | (b2 << 8) | b3,
                0x2000_0000,
            )
        };

        #[allow(clippy::cast_possible_wrap)]
        let payload = (raw >> 1) as i32;
        if raw & 1 == 0 {
            Ok(payload)
        } else {
            Ok(payload - bias)
        }
    }

    /// Read an unsigned integer of the full-range variable-length scheme.
    ///
    /// The number of trailing one bits of the first byte selects the length: `xxxxxxx0` is one
    /// byte, `xxxxxx01` two, `xxxxx011` three, `xxxx0111` four, and `00001111` is followed by
    /// four raw little-endian bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input.
    pub fn read_compressed_full_uint(&mut self) -> Result<u32> {
        let raw = self.read_full_raw()?;
        Ok(match raw {
            FullRaw::One(b) => u32::from(b >> 1),
            FullRaw::Two(v) => u32::from(v >> 2),
            FullRaw::Three(v) => v >> 3,
            FullRaw::Four(v) => v >> 4,
            FullRaw::Escaped(v) => v,
        })
    }

    /// Read a signed integer of the full-range variable-length scheme (two's complement payload,
    /// sign-extended from the width of the length class).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_compressed_full_int(&mut self) -> Result<i32> {
        let raw = self.read_full_raw()?;
        Ok(match raw {
            FullRaw::One(b) => i32::from((b as i8) >> 1),
            FullRaw::Two(v) => i32::from((v as i16) >> 2),
            FullRaw::Three(v) => ((v << 8) as i32) >> 11,
            FullRaw::Four(v) => (v as i32) >> 4,
            FullRaw::Escaped(v) => v as i32,
        })
    }

    fn read_full_raw(&mut self) -> Result<FullRaw> {
        let b0 = self.read_le::<u8>()?;
        if b0 & 0x01 == 0 {
            return Ok(FullRaw::One(b0));
        }
        if b0 & 0x03 == 0x01 {
            let b1 = self.read_le::<u8>()?;
            return Ok(FullRaw::Two(u16::from_le_bytes([b0, b1])));
        }
        if b0 & 0x07 == 0x03 {
            let rest = self.read_bytes(2)?;
            return Ok(FullRaw::Three(u32::from_le_bytes([b0, rest[0], rest[1], 0])));
        }
        if b0 & 0x0F == 0x07 {
            let rest = self.read_bytes(3)?;
            return Ok(FullRaw::Four(u32::from_le_bytes([
                b0, rest[0], rest[1], rest[2],
            ])));
        }
        Ok(FullRaw::Escaped(self.read_le::<u32>()?))
    }

    /// Read a 7-bit encoded integer (the length prefix of serialized .NET strings).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input, or
    /// [`crate::Error::Malformed`] if the value exceeds 32 bits.
    pub fn read_7bit_encoded_int(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.read_le::<u8>()?;

            value |= u32::from(byte & 0x7F) << shift;
            shift += 7;

            if (byte & 0x80) == 0 {
                break;
            }

            if shift >= 32 {
                return Err(malformed_error!(
                    "7-bit encoded integer overflow after {} bits",
                    shift
                ));
            }
        }

        Ok(value)
    }

    /// Read a NUL-terminated UTF-8 string. A string running to the end of the data without a
    /// terminator is accepted.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on invalid UTF-8.
    pub fn read_string_utf8(&mut self) -> Result<String> {
        let start = self.position;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.data.len(), |p| start + p);

        let string_data = &self.data[start..end];
        self.position = if end < self.data.len() { end + 1 } else { end };

        String::from_utf8(string_data.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                end,
                e.utf8_error()
            )
        })
    }

    /// Read a NUL-terminated UTF-16LE string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no terminator is found, or
    /// [`crate::Error::Malformed`] on unpaired surrogates.
    pub fn read_string_utf16(&mut self) -> Result<String> {
        let mut units = Vec::new();
        loop {
            let unit = self.read_le::<u16>()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        widestring::U16String::from_vec(units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 string ending at {}", self.position))
    }

    /// Read a string written by [`crate::writer::BinaryWriter::write_string`] without a
    /// terminator: `0xFF` for a null string, otherwise a compressed byte count followed by the
    /// UTF-8 or UTF-16LE payload.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated input, or
    /// [`crate::Error::Malformed`] on invalid text.
    pub fn read_serialized_string(&mut self, unicode: bool) -> Result<Option<String>> {
        if self.peek_byte()? == 0xFF {
            self.position += 1;
            return Ok(None);
        }

        let length = self.read_compressed_uint()? as usize;
        let bytes = self.read_bytes(length)?;
        if unicode {
            if length % 2 != 0 {
                return Err(malformed_error!("Odd UTF-16 byte count - {}", length));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units)
                .map(Some)
                .map_err(|_| malformed_error!("Invalid UTF-16 string of {} bytes", length))
        } else {
            String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| malformed_error!("Invalid UTF-8 string: {}", e.utf8_error()))
        }
    }

    /// Compute `position + length`, verifying it stays within the data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on overflow or if the end lies past the data.
    pub fn calc_end_position(&self, length: usize) -> Result<usize> {
        let end = self.position.checked_add(length).ok_or(OutOfBounds)?;

        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(end)
    }
}

enum FullRaw {
    One(u8),
    Two(u16),
    Three(u32),
    Four(u32),
    Escaped(u32),
}
