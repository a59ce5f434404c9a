//! Method body headers and exception handling sections.
//!
//! A method body is a header (tiny or fat), the CIL code, and for fat bodies an optional list of
//! extra data sections holding exception handling clauses (small or fat layout). This module
//! decodes and encodes that layout.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::{assembly::MethodBody, writer::BinaryWriter};
//!
//! let body = MethodBody::parse(&[0x0A, 0x17, 0x2A])?;
//! assert_eq!(body.code, vec![0x17, 0x2A]);
//! assert_eq!(body.max_stack, 8);
//!
//! let mut writer = BinaryWriter::new();
//! body.write(&mut writer)?;
//! assert_eq!(writer.as_slice(), &[0x0A, 0x17, 0x2A]);
//! # Ok::<(), dotsym::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Common Intermediate Language physical layout

use bitflags::bitflags;

use crate::{
    file::io::read_le_at,
    token::Token,
    writer::BinaryWriter,
    Error::OutOfBounds,
    Result,
};

bitflags! {
    /// Flags in the first two bytes of a method header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny header, code size in the upper six bits
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// Extra data sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize all locals
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Kind byte of an extra data section
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        /// Exception handling clauses
        const EHTABLE = 0x1;
        /// Reserved, must not be set
        const OPT_ILTABLE = 0x2;
        /// Fat section layout
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}

bitflags! {
    /// Flags of one exception handling clause; no bit set means a typed catch clause
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u32 {
        /// Filter clause
        const FILTER = 0x1;
        /// Finally clause
        const FINALLY = 0x2;
        /// Fault clause
        const FAULT = 0x4;
    }
}

const FAT_HEADER_SIZE: usize = 12;
const FAT_HEADER_FLAGS: u16 = 0x3003;
const TINY_MAX_CODE: usize = 64;
const TINY_MAX_STACK: u16 = 8;
const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// The kind of an exception handling clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Typed catch, `class_token` names the caught type
    Catch,
    /// Filter, `filter_offset` locates the filter code
    Filter,
    /// Finally block
    Finally,
    /// Fault block
    Fault,
}

impl HandlerKind {
    fn from_flags(flags: u32) -> Result<HandlerKind> {
        let flags = ExceptionHandlerFlags::from_bits_truncate(flags);
        if flags.is_empty() {
            Ok(HandlerKind::Catch)
        } else if flags == ExceptionHandlerFlags::FILTER {
            Ok(HandlerKind::Filter)
        } else if flags == ExceptionHandlerFlags::FINALLY {
            Ok(HandlerKind::Finally)
        } else if flags == ExceptionHandlerFlags::FAULT {
            Ok(HandlerKind::Fault)
        } else {
            Err(malformed_error!(
                "Exception clause flags 0x{:X} combine several kinds",
                flags.bits()
            ))
        }
    }

    fn flags(self) -> ExceptionHandlerFlags {
        match self {
            HandlerKind::Catch => ExceptionHandlerFlags::empty(),
            HandlerKind::Filter => ExceptionHandlerFlags::FILTER,
            HandlerKind::Finally => ExceptionHandlerFlags::FINALLY,
            HandlerKind::Fault => ExceptionHandlerFlags::FAULT,
        }
    }
}

/// One exception handling clause.
///
/// ```text
/// try_offset .. try_end()            protected region
/// filter_offset .. handler_offset    filter code (filter clauses only)
/// handler_offset .. handler_end()    handler
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// The clause kind
    pub kind: HandlerKind,
    /// Start of the protected region
    pub try_offset: u32,
    /// Length of the protected region
    pub try_length: u32,
    /// Start of the handler
    pub handler_offset: u32,
    /// Length of the handler
    pub handler_length: u32,
    /// Caught type for [`HandlerKind::Catch`], null otherwise
    pub class_token: Token,
    /// Start of the filter code for [`HandlerKind::Filter`], 0 otherwise
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// End of the protected region (exclusive)
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset + self.try_length
    }

    /// End of the handler (exclusive)
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset + self.handler_length
    }

    fn fits_small(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_offset <= 0xFFFF
            && self.handler_length <= 0xFF
    }

    fn class_or_filter(&self) -> u32 {
        match self.kind {
            HandlerKind::Catch => self.class_token.value(),
            HandlerKind::Filter => self.filter_offset,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        }
    }

    fn from_raw(flags: u32, region: [u32; 4], class_or_filter: u32) -> Result<Self> {
        let kind = HandlerKind::from_flags(flags)?;
        Ok(ExceptionHandler {
            kind,
            try_offset: region[0],
            try_length: region[1],
            handler_offset: region[2],
            handler_length: region[3],
            class_token: if kind == HandlerKind::Catch {
                Token(class_or_filter)
            } else {
                Token(0)
            },
            filter_offset: if kind == HandlerKind::Filter {
                class_or_filter
            } else {
                0
            },
        })
    }
}

/// A decoded method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// `StandAloneSig` token of the local variable signature, null if there are no locals
    pub local_signature_token: Token,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// The CIL code
    pub code: Vec<u8>,
    /// Exception handling clauses, innermost first
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Decode a method body starting at its header.
    ///
    /// # Arguments
    /// * `data` - Bytes starting at the header; may extend past the end of the body
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for empty input, [`crate::Error::OutOfBounds`] if the
    /// header claims more code than available, and [`crate::Error::Malformed`] for an unknown
    /// header format or inconsistent exception sections.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        let Some(&first) = data.first() else {
            return Err(crate::Error::Empty);
        };

        match MethodBodyFlags::from_bits_truncate(u16::from(first & 0b11)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = usize::from(first >> 2);
                let code = data.get(1..1 + size_code).ok_or(OutOfBounds)?;
                Ok(MethodBody {
                    max_stack: TINY_MAX_STACK,
                    local_signature_token: Token(0),
                    init_locals: false,
                    code: code.to_vec(),
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                let mut cursor = 0;
                let first_duo = read_le_at::<u16>(data, &mut cursor)?;
                let max_stack = read_le_at::<u16>(data, &mut cursor)?;
                let size_code = read_le_at::<u32>(data, &mut cursor)? as usize;
                let local_signature_token = Token(read_le_at::<u32>(data, &mut cursor)?);

                let size_header = usize::from(first_duo >> 12) * 4;
                if size_header < FAT_HEADER_SIZE {
                    return Err(malformed_error!(
                        "Fat method header claims {} bytes",
                        size_header
                    ));
                }

                let code_end = size_header.checked_add(size_code).ok_or(OutOfBounds)?;
                let code = data.get(size_header..code_end).ok_or(OutOfBounds)?;

                let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                let exception_handlers = if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    Self::parse_sections(data, code_end.next_multiple_of(4))?
                } else {
                    Vec::new()
                };

                Ok(MethodBody {
                    max_stack,
                    local_signature_token,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    code: code.to_vec(),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "Method header is neither fat nor tiny - 0x{:02X}",
                first
            )),
        }
    }

    fn parse_sections(data: &[u8], mut cursor: usize) -> Result<Vec<ExceptionHandler>> {
        let mut handlers = Vec::new();

        loop {
            let start = cursor;
            let kind = SectionFlags::from_bits_truncate(read_le_at::<u8>(data, &mut cursor)?);
            if !kind.contains(SectionFlags::EHTABLE) {
                return Err(malformed_error!(
                    "Unsupported method data section 0x{:02X} at 0x{:X}",
                    kind.bits(),
                    start
                ));
            }

            if kind.contains(SectionFlags::FAT_FORMAT) {
                let mut at = start;
                let size = read_le_at::<u32>(data, &mut at)? >> 8;
                cursor = at;
                let count = (size as usize).saturating_sub(4) / FAT_CLAUSE_SIZE;
                for _ in 0..count {
                    let flags = read_le_at::<u32>(data, &mut cursor)?;
                    let mut region = [0u32; 4];
                    for value in &mut region {
                        *value = read_le_at::<u32>(data, &mut cursor)?;
                    }
                    let extra = read_le_at::<u32>(data, &mut cursor)?;
                    handlers.push(ExceptionHandler::from_raw(flags, region, extra)?);
                }
            } else {
                let size = read_le_at::<u8>(data, &mut cursor)?;
                cursor = start + 4;
                let count = usize::from(size).saturating_sub(4) / SMALL_CLAUSE_SIZE;
                for _ in 0..count {
                    let flags = u32::from(read_le_at::<u16>(data, &mut cursor)?);
                    let region = [
                        u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        u32::from(read_le_at::<u8>(data, &mut cursor)?),
                        u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        u32::from(read_le_at::<u8>(data, &mut cursor)?),
                    ];
                    let extra = read_le_at::<u32>(data, &mut cursor)?;
                    handlers.push(ExceptionHandler::from_raw(flags, region, extra)?);
                }
            }

            if !kind.contains(SectionFlags::MORE_SECTS) {
                break;
            }
            cursor = cursor.next_multiple_of(4);
        }

        Ok(handlers)
    }

    /// True if [`MethodBody::write`] will use the one byte tiny header
    #[must_use]
    pub fn is_tiny(&self) -> bool {
        self.code.len() < TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_signature_token.is_null()
            && self.exception_handlers.is_empty()
            && !self.init_locals
    }

    /// Encode the body: header, code and, for fat bodies with handlers, one exception section.
    /// The section uses the small layout when every clause and the section size fit it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the writer can not grow, or
    /// [`crate::Error::Malformed`] if the handler table exceeds the fat section size limit.
    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        if self.is_tiny() {
            let header = ((self.code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8;
            writer.write_u8(header)?;
            return writer.write_bytes(&self.code);
        }

        let mut flags = MethodBodyFlags::from_bits_retain(FAT_HEADER_FLAGS);
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !self.exception_handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        let start = writer.position();
        writer.write_u16(flags.bits())?;
        writer.write_u16(self.max_stack)?;
        writer.write_u32(self.code.len() as u32)?;
        writer.write_u32(self.local_signature_token.value())?;
        writer.write_bytes(&self.code)?;

        if self.exception_handlers.is_empty() {
            return Ok(());
        }

        let padding = (writer.position() - start).next_multiple_of(4) - (writer.position() - start);
        writer.buffer_mut().write_zeros(padding)?;
        self.write_handlers(writer)
    }

    fn write_handlers(&self, writer: &mut BinaryWriter) -> Result<()> {
        let count = self.exception_handlers.len();
        let small_size = 4 + count * SMALL_CLAUSE_SIZE;

        if small_size <= 0xFF && self.exception_handlers.iter().all(ExceptionHandler::fits_small) {
            writer.write_u8(SectionFlags::EHTABLE.bits())?;
            writer.write_u8(small_size as u8)?;
            writer.write_u16(0)?;
            for handler in &self.exception_handlers {
                writer.write_u16(handler.kind.flags().bits() as u16)?;
                writer.write_u16(handler.try_offset as u16)?;
                writer.write_u8(handler.try_length as u8)?;
                writer.write_u16(handler.handler_offset as u16)?;
                writer.write_u8(handler.handler_length as u8)?;
                writer.write_u32(handler.class_or_filter())?;
            }
            return Ok(());
        }

        let fat_size = 4 + count * FAT_CLAUSE_SIZE;
        if fat_size > 0x00FF_FFFF {
            return Err(malformed_error!(
                "{} exception clauses do not fit one section",
                count
            ));
        }

        let kind = SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT;
        writer.write_u32(((fat_size as u32) << 8) | u32::from(kind.bits()))?;
        for handler in &self.exception_handlers {
            writer.write_u32(handler.kind.flags().bits())?;
            writer.write_u32(handler.try_offset)?;
            writer.write_u32(handler.try_length)?;
            writer.write_u32(handler.handler_offset)?;
            writer.write_u32(handler.handler_length)?;
            writer.write_u32(handler.class_or_filter())?;
        }
        Ok(())
    }

    /// Encode the body into a fresh byte vector
    ///
    /// # Errors
    /// See [`MethodBody::write`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        self.write(&mut writer)?;
        Ok(writer.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catch(
        try_offset: u32,
        try_length: u32,
        handler_offset: u32,
        handler_length: u32,
    ) -> ExceptionHandler {
        ExceptionHandler {
            kind: HandlerKind::Catch,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            class_token: Token(0x0100_000C),
            filter_offset: 0,
        }
    }

    #[test]
    fn tiny() {
        let body = MethodBody::parse(&[0x0A, 0x17, 0x2A, 0xFF]).unwrap();
        assert_eq!(body.code, vec![0x17, 0x2A]);
        assert_eq!(body.max_stack, 8);
        assert!(body.is_tiny());
        assert_eq!(body.to_bytes().unwrap(), vec![0x0A, 0x17, 0x2A]);

        assert!(matches!(MethodBody::parse(&[0x0E, 0x00]), Err(OutOfBounds)));
        assert!(matches!(MethodBody::parse(&[]), Err(crate::Error::Empty)));
        assert!(matches!(
            MethodBody::parse(&[0x01]),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn fat_without_handlers() {
        #[rustfmt::skip]
        let data = [
            0x13, 0x30, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x11,
            0x00, 0x2A,
        ];
        let body = MethodBody::parse(&data).unwrap();
        assert_eq!(body.max_stack, 2);
        assert!(body.init_locals);
        assert_eq!(body.local_signature_token, Token(0x1100_0001));
        assert_eq!(body.code, vec![0x00, 0x2A]);
        assert!(body.exception_handlers.is_empty());
        assert_eq!(body.to_bytes().unwrap(), data.to_vec());
    }

    #[test]
    fn small_section() {
        #[rustfmt::skip]
        let data = [
            0x1B, 0x30, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x26, 0x2A, 0x00,
            0x01, 0x1C, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x01, 0x0C, 0x00, 0x00, 0x01,
        ];
        let body = MethodBody::parse(&data).unwrap();
        assert_eq!(body.exception_handlers.len(), 2);
        assert_eq!(body.exception_handlers[0].kind, HandlerKind::Finally);
        assert_eq!(body.exception_handlers[0].try_end(), 1);
        assert_eq!(body.exception_handlers[0].handler_end(), 2);
        assert_eq!(body.exception_handlers[1], catch(0, 1, 1, 1));
        assert_eq!(body.to_bytes().unwrap(), data.to_vec());
    }

    #[test]
    fn fat_section_when_clauses_are_large() {
        let body = MethodBody {
            max_stack: 3,
            local_signature_token: Token(0),
            init_locals: false,
            code: vec![0x00; 0x300],
            exception_handlers: vec![catch(0, 0x100, 0x100, 0x10), {
                let mut filter = catch(0x120, 4, 0x130, 4);
                filter.kind = HandlerKind::Filter;
                filter.class_token = Token(0);
                filter.filter_offset = 0x124;
                filter
            }],
        };

        let bytes = body.to_bytes().unwrap();
        // 12 byte header, code, already aligned
        assert_eq!(bytes[12 + 0x300], 0x41);
        assert_eq!(bytes.len(), 12 + 0x300 + 4 + 2 * 24);
        assert_eq!(MethodBody::parse(&bytes).unwrap(), body);
    }

    #[test]
    fn tiny_rules() {
        let mut body = MethodBody {
            max_stack: 8,
            local_signature_token: Token(0),
            init_locals: false,
            code: vec![0x00; 63],
            exception_handlers: Vec::new(),
        };
        assert!(body.is_tiny());

        body.code.push(0x00);
        assert!(!body.is_tiny());
        body.code.pop();

        body.max_stack = 9;
        assert!(!body.is_tiny());
        body.max_stack = 8;

        body.local_signature_token = Token(0x1100_0001);
        assert!(!body.is_tiny());

        let bytes = body.to_bytes().unwrap();
        assert_eq!(MethodBody::parse(&bytes).unwrap(), body);
    }

    #[test]
    fn tiny_header_does_not_keep_max_stack() {
        let body = MethodBody {
            max_stack: 2,
            local_signature_token: Token(0),
            init_locals: false,
            code: vec![0x17, 0x16, 0x26, 0x26, 0x2A],
            exception_handlers: Vec::new(),
        };
        assert!(body.is_tiny());

        let parsed = MethodBody::parse(&body.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.max_stack, TINY_MAX_STACK);
        assert_eq!(
            parsed,
            MethodBody {
                max_stack: TINY_MAX_STACK,
                ..body
            }
        );
    }

    #[test]
    fn multiple_sections() {
        #[rustfmt::skip]
        let data = [
            0x0B, 0x30, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x2A, 0x00, 0x00,
            0x81, 0x10, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x41, 0x1C, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let body = MethodBody::parse(&data).unwrap();
        assert_eq!(body.exception_handlers.len(), 2);
        assert_eq!(body.exception_handlers[0].kind, HandlerKind::Finally);
        assert_eq!(body.exception_handlers[1].kind, HandlerKind::Fault);
    }
}
