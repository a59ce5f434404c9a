//! Primitive encoder on top of [`crate::writer::ByteBuffer`].

use crate::{writer::ByteBuffer, Result};

/// Encodes fixed-width integers, floats, strings and the variable-length integer schemes of the
/// .NET binary formats.
///
/// The text encoding used by [`BinaryWriter::write_string`] and [`BinaryWriter::write_chars`] is
/// chosen at construction: UTF-8 by default, UTF-16LE for [`BinaryWriter::unicode`].
///
/// # Examples
///
/// ```rust
/// use dotsym::{writer::BinaryWriter, Parser};
///
/// let mut writer = BinaryWriter::new();
/// writer.write_compressed_uint(0x80)?;
/// writer.write_compressed_int(-2)?;
/// writer.write_string(Some("main"), false)?;
///
/// let bytes = writer.into_vec();
/// assert_eq!(&bytes[..3], &[0x80, 0x80, 0x7D]);
///
/// let mut parser = Parser::new(&bytes);
/// assert_eq!(parser.read_compressed_uint()?, 0x80);
/// assert_eq!(parser.read_compressed_int()?, -2);
/// assert_eq!(parser.read_serialized_string(false)?.as_deref(), Some("main"));
/// # Ok::<(), dotsym::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: ByteBuffer,
    unicode: bool,
}

impl BinaryWriter {
    /// Create a UTF-8 writer over a fresh buffer
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(ByteBuffer::new(), false)
    }

    /// Create a UTF-16LE writer over a fresh buffer
    #[must_use]
    pub fn unicode() -> Self {
        Self::with_buffer(ByteBuffer::new(), true)
    }

    /// Wrap an existing buffer
    #[must_use]
    pub fn with_buffer(buffer: ByteBuffer, unicode: bool) -> Self {
        BinaryWriter { buffer, unicode }
    }

    /// True if strings are written as UTF-16LE
    #[must_use]
    pub fn is_unicode(&self) -> bool {
        self.unicode
    }

    /// The underlying buffer
    #[must_use]
    pub fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }

    /// Mutable access to the underlying buffer, e.g. to seek back and patch
    pub fn buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buffer
    }

    /// Current position of the underlying buffer
    #[must_use]
    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    /// Logical length of the underlying buffer
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The bytes written so far
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Consume the writer, returning the written bytes
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.into_vec()
    }

    /// Pad with zero bytes until the position is a multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - self.position() % alignment) % alignment;
        self.buffer.write_zeros(padding)
    }

    /// Write `1` or `0`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.buffer.write_u8(u8::from(value))
    }

    /// Write a byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.buffer.write_u8(value)
    }

    /// Write a signed byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `u16`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i16`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `u32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `u64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write an IEEE single.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write an IEEE double.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.buffer.write_bytes(&value.to_le_bytes())
    }

    /// Write raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.write_bytes(bytes)
    }

    /// Write a GUID in its 16-byte wire layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_guid(&mut self, guid: &uguid::Guid) -> Result<()> {
        self.buffer.write_bytes(&guid.to_bytes())
    }

    /// Write UTF-16 code units without a length prefix, transcoded to UTF-8 unless this is a
    /// unicode writer. Unpaired surrogates become U+FFFD in UTF-8 mode.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_chars(&mut self, chars: &[u16]) -> Result<()> {
        if self.unicode {
            for unit in chars {
                self.write_u16(*unit)?;
            }
            return Ok(());
        }

        let mut encoded = [0u8; 4];
        for ch in char::decode_utf16(chars.iter().copied()) {
            let ch = ch.unwrap_or(char::REPLACEMENT_CHARACTER);
            self.buffer
                .write_bytes(ch.encode_utf8(&mut encoded).as_bytes())?;
        }
        Ok(())
    }

    /// Write a string.
    ///
    /// `None` is written as the single byte `0xFF`. Without a terminator the text is preceded by
    /// its compressed byte count; with a terminator it is followed by a NUL of the writer's code
    /// unit size.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_string(&mut self, value: Option<&str>, emit_null_terminator: bool) -> Result<()> {
        let Some(value) = value else {
            return self.write_u8(0xFF);
        };

        if self.unicode {
            if !emit_null_terminator {
                let count = value.encode_utf16().count() * 2;
                self.write_compressed_uint(u32::try_from(count).unwrap_or(u32::MAX))?;
            }
            for unit in value.encode_utf16() {
                self.write_u16(unit)?;
            }
            if emit_null_terminator {
                self.write_u16(0)?;
            }
        } else {
            if !emit_null_terminator {
                self.write_compressed_uint(Self::utf8_byte_count(value))?;
            }
            self.buffer.write_bytes(value.as_bytes())?;
            if emit_null_terminator {
                self.write_u8(0)?;
            }
        }
        Ok(())
    }

    /// Write a NUL-terminated UTF-16LE string regardless of the writer's encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_utf16_nul(&mut self, value: &str) -> Result<()> {
        let wide = widestring::U16CString::from_str_truncate(value);
        for unit in wide.as_slice_with_nul() {
            self.write_u16(*unit)?;
        }
        Ok(())
    }

    /// Number of bytes `value` occupies in UTF-8. A surrogate pair counts as four bytes.
    #[must_use]
    pub fn utf8_byte_count(value: &str) -> u32 {
        value
            .chars()
            .map(|ch| ch.len_utf8() as u32)
            .sum()
    }

    /// Write an ECMA-335 compressed unsigned integer: one byte up to `0x7F`, two bytes up to
    /// `0x3FFF`, four bytes up to `0x1FFF_FFFF`.
    ///
    /// Larger values can not be represented. They trip a debug assertion and are masked into
    /// the four byte form in release builds.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        debug_assert!(value <= 0x1FFF_FFFF, "compressed uint out of range: {value:#x}");

        if value <= 0x7F {
            self.write_u8(value as u8)
        } else if value <= 0x3FFF {
            self.buffer
                .write_bytes(&[((value >> 8) as u8) | 0x80, value as u8])
        } else {
            let value = value & 0x1FFF_FFFF;
            self.buffer.write_bytes(&[
                ((value >> 24) as u8) | 0xC0,
                (value >> 16) as u8,
                (value >> 8) as u8,
                value as u8,
            ])
        }
    }

    /// Write a compressed signed integer.
    ///
    /// Non-negative values are written as the compressed unsigned `value << 1`. Negative values
    /// store `((bias + value) << 1) | 1`, with a bias of `0x40`, `0x2000` or `0x2000_0000`
    /// depending on the smallest length class that fits. This layout is a fixed wire format
    /// and differs from the rotated encoding of ECMA-335 for some inputs.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    #[allow(clippy::cast_sign_loss)]
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        if value >= 0 {
            return self.write_compressed_uint((value as u32) << 1);
        }

        if value > -0x40 {
            let biased = (((0x40 + value) << 1) | 1) as u32;
            self.write_u8(biased as u8)
        } else if value >= -0x2000 {
            let biased = (((0x2000 + value) << 1) | 1) as u32;
            self.buffer
                .write_bytes(&[((biased >> 8) as u8) | 0x80, biased as u8])
        } else {
            debug_assert!(value >= -0x2000_0000, "compressed int out of range: {value}");
            let biased = ((0x2000_0000_i32.wrapping_add(value) << 1) | 1) as u32;
            self.buffer.write_bytes(&[
                ((biased >> 24) as u8) | 0xC0,
                (biased >> 16) as u8,
                (biased >> 8) as u8,
                biased as u8,
            ])
        }
    }

    /// Write an unsigned integer in the full-range scheme: the low bits of the first byte are a
    /// length tag (`0`, `01`, `011`, `0111`), values of 2^28 and above use the escape byte `0x0F`
    /// followed by four raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_compressed_full_uint(&mut self, value: u32) -> Result<()> {
        if value < 1 << 7 {
            self.write_u8((value << 1) as u8)
        } else if value < 1 << 14 {
            self.buffer
                .write_bytes(&[((value << 2) | 1) as u8, (value >> 6) as u8])
        } else if value < 1 << 21 {
            self.buffer.write_bytes(&[
                ((value << 3) | 3) as u8,
                (value >> 5) as u8,
                (value >> 13) as u8,
            ])
        } else if value < 1 << 28 {
            self.buffer.write_bytes(&[
                ((value << 4) | 7) as u8,
                (value >> 4) as u8,
                (value >> 12) as u8,
                (value >> 20) as u8,
            ])
        } else {
            self.write_u8(0x0F)?;
            self.write_u32(value)
        }
    }

    /// Write a signed integer in the full-range scheme (two's complement payload).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    #[allow(clippy::cast_sign_loss)]
    pub fn write_compressed_full_int(&mut self, value: i32) -> Result<()> {
        let d = value as u32;
        if d.wrapping_add(1 << 6) < 1 << 7 {
            self.write_u8((d << 1) as u8)
        } else if d.wrapping_add(1 << 13) < 1 << 14 {
            self.buffer
                .write_bytes(&[((d << 2) | 1) as u8, (d >> 6) as u8])
        } else if d.wrapping_add(1 << 20) < 1 << 21 {
            self.buffer.write_bytes(&[
                ((d << 3) | 3) as u8,
                (d >> 5) as u8,
                (d >> 13) as u8,
            ])
        } else if d.wrapping_add(1 << 27) < 1 << 28 {
            self.buffer.write_bytes(&[
                ((d << 4) | 7) as u8,
                (d >> 4) as u8,
                (d >> 12) as u8,
                (d >> 20) as u8,
            ])
        } else {
            self.write_u8(0x0F)?;
            self.write_u32(d)
        }
    }

    /// Write a 7-bit encoded integer, the length prefix of serialized .NET strings.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_7bit_encoded_u32(&mut self, mut value: u32) -> Result<()> {
        while value >= 0x80 {
            self.write_u8((value as u8) | 0x80)?;
            value >>= 7;
        }
        self.write_u8(value as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Parser;

    fn bytes(f: impl FnOnce(&mut BinaryWriter) -> Result<()>) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        f(&mut writer).unwrap();
        writer.into_vec()
    }

    #[test]
    fn fixed_width() {
        let out = bytes(|w| {
            w.write_bool(true)?;
            w.write_i8(-1)?;
            w.write_u16(0x0102)?;
            w.write_i32(-2)?;
            w.write_u64(1)?;
            w.write_f32(1.0)
        });

        #[rustfmt::skip]
        let expected = vec![
            0x01, 0xFF,
            0x02, 0x01,
            0xFE, 0xFF, 0xFF, 0xFF,
            0x01, 0, 0, 0, 0, 0, 0, 0,
            0x00, 0x00, 0x80, 0x3F,
        ];
        assert_eq!(out, expected);
    }

    #[test]
    fn align_pads_with_zero() {
        let out = bytes(|w| {
            w.write_u8(0xAA)?;
            w.align(4)?;
            w.align(4)?;
            w.write_u8(0xBB)
        });
        assert_eq!(out, vec![0xAA, 0, 0, 0, 0xBB]);
    }

    #[test]
    fn compressed_uint_boundaries() {
        let cases: &[(u32, &[u8])] = &[
            (0x00, &[0x00]),
            (0x7F, &[0x7F]),
            (0x80, &[0x80, 0x80]),
            (0x3FFF, &[0xBF, 0xFF]),
            (0x4000, &[0xC0, 0x00, 0x40, 0x00]),
            (0x1FFF_FFFF, &[0xDF, 0xFF, 0xFF, 0xFF]),
        ];

        for (value, expected) in cases {
            let out = bytes(|w| w.write_compressed_uint(*value));
            assert_eq!(&out, expected, "{value:#x}");
            assert_eq!(Parser::new(&out).read_compressed_uint().unwrap(), *value);
        }
    }

    #[test]
    fn compressed_int_bias() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (3, &[0x06]),
            (-1, &[0x7F]),
            (-63, &[0x03]),
            (-64, &[0xBF, 0x81]),
            (-0x2000, &[0x80, 0x01]),
            (-0x2001, &[0xFF, 0xFF, 0xBF, 0xFF]),
            (-0x2000_0000, &[0xC0, 0x00, 0x00, 0x01]),
        ];

        for (value, expected) in cases {
            let out = bytes(|w| w.write_compressed_int(*value));
            assert_eq!(&out[..], *expected, "{value}");
            assert_eq!(Parser::new(&out).read_compressed_int().unwrap(), *value);
        }
    }

    #[test]
    fn compressed_int_classes_round_trip() {
        for value in [
            1, 63, 64, 0x1FFF, 0x2000, 0x0FFF_FFFF, -2, -62, -65, -0x1FFF, -0x2002, -0x1000_0000,
            -0x1FFF_FFFF,
        ] {
            let out = bytes(|w| w.write_compressed_int(value));
            let mut parser = Parser::new(&out);
            assert_eq!(parser.read_compressed_int().unwrap(), value);
            assert!(!parser.has_more_data());
        }
    }

    #[test]
    fn compressed_full_round_trip() {
        for value in [
            0,
            1,
            127,
            128,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0x0FFF_FFFF,
            0x1000_0000,
            u32::MAX,
        ] {
            let out = bytes(|w| w.write_compressed_full_uint(value));
            let mut parser = Parser::new(&out);
            assert_eq!(parser.read_compressed_full_uint().unwrap(), value);
            assert!(!parser.has_more_data());
        }

        for value in [
            0,
            1,
            -1,
            63,
            -64,
            64,
            -65,
            8191,
            -8192,
            8192,
            1 << 20,
            -(1 << 20),
            (1 << 27) - 1,
            -(1 << 27),
            1 << 27,
            i32::MIN,
            i32::MAX,
        ] {
            let out = bytes(|w| w.write_compressed_full_int(value));
            let mut parser = Parser::new(&out);
            assert_eq!(parser.read_compressed_full_int().unwrap(), value, "{value}");
            assert!(!parser.has_more_data());
        }

        assert_eq!(bytes(|w| w.write_compressed_full_uint(127)).len(), 1);
        assert_eq!(bytes(|w| w.write_compressed_full_uint(128)).len(), 2);
        assert_eq!(bytes(|w| w.write_compressed_full_uint(1 << 28)).len(), 5);
    }

    #[test]
    fn strings_utf8() {
        let out = bytes(|w| {
            w.write_string(None, false)?;
            w.write_string(Some("h\u{e9}"), false)?;
            w.write_string(Some("ok"), true)
        });
        assert_eq!(out, vec![0xFF, 0x03, b'h', 0xC3, 0xA9, b'o', b'k', 0x00]);
    }

    #[test]
    fn strings_surrogate_pair() {
        let value = "\u{1F600}";
        assert_eq!(BinaryWriter::utf8_byte_count(value), 4);

        let out = bytes(|w| w.write_string(Some(value), false));
        assert_eq!(out, vec![0x04, 0xF0, 0x9F, 0x98, 0x80]);

        let units: Vec<u16> = value.encode_utf16().collect();
        let out = bytes(|w| w.write_chars(&units));
        assert_eq!(out, vec![0xF0, 0x9F, 0x98, 0x80]);
    }

    #[test]
    fn strings_utf16() {
        let mut writer = BinaryWriter::unicode();
        writer.write_string(Some("AB"), false).unwrap();
        writer.write_string(Some("C"), true).unwrap();
        writer.write_chars(&[0x44]).unwrap();
        assert_eq!(
            writer.into_vec(),
            vec![0x04, 0x41, 0x00, 0x42, 0x00, 0x43, 0x00, 0x00, 0x00, 0x44, 0x00]
        );
    }

    #[test]
    fn utf16_nul_and_7bit() {
        let out = bytes(|w| {
            w.write_utf16_nul("MD2")?;
            w.write_7bit_encoded_u32(300)
        });
        assert_eq!(
            out,
            vec![0x4D, 0x00, 0x44, 0x00, 0x32, 0x00, 0x00, 0x00, 0xAC, 0x02]
        );
    }
}
