//! CodeView symbol records and C13 debug subsections of managed module streams.
//!
//! Only the records a managed compiler emits are decoded; anything else is surfaced as
//! [`Symbol::Unknown`] and skipped by the caller. Symbol records are
//! `length:u16 kind:u16 payload`, where `length` excludes itself.
//!
//! # References
//! - `cvinfo.h` of the Microsoft PDB repository (`MANPROCSYM`, `BLOCKSYM32`, `ATTRSLOTSYM`,
//!   `CONSTSYM`, `OEMSYMBOL`, `CV_Line_t`)

use tracing::trace;
use uguid::{guid, Guid};

use crate::{
    file::parser::Parser,
    pdb::{IteratorScope, PdbAsyncInfo, PdbConstantValue, PdbLine},
    token::Token,
    writer::BinaryWriter,
    Error::OutOfBounds,
    Result,
};

/// End of a procedure or block
pub const S_END: u16 = 0x0006;
/// Vendor specific record
pub const S_OEM: u16 = 0x0404;
/// Lexical block
pub const S_BLOCK32: u16 = 0x1103;
/// Managed local slot
pub const S_MANSLOT: u16 = 0x1120;
/// Namespace import
pub const S_UNAMESPACE: u16 = 0x1124;
/// Global managed procedure
pub const S_GMANPROC: u16 = 0x112A;
/// Local managed procedure
pub const S_LMANPROC: u16 = 0x112B;
/// Managed constant
pub const S_MANCONSTANT: u16 = 0x112D;

/// Line number subsection
pub const DEBUG_S_LINES: u32 = 0xF2;
/// File checksum subsection
pub const DEBUG_S_FILECHKSMS: u32 = 0xF4;
/// Module stream signature for C13 line information
pub const CV_SIGNATURE_C13: u32 = 4;

/// OEM id of records written by managed symbol writers
pub const MSIL_METADATA_GUID: Guid = guid!("c6ea3fc9-59b3-49d6-bc25-0902bbabb460");

/// Slot flag marking compiler generated locals
pub const SLOT_COMPILER_GENERATED: u16 = 0x0004;

const LINES_HAVE_COLUMNS: u16 = 0x0001;
const LINE_NUMBER_MASK: u32 = 0x00FF_FFFF;
const LINE_DELTA_MAX: u32 = 0x7F;
const LINE_IS_STATEMENT: u32 = 0x8000_0000;

const LF_NUMERIC: u16 = 0x8000;
const LF_CHAR: u16 = 0x8000;
const LF_SHORT: u16 = 0x8001;
const LF_USHORT: u16 = 0x8002;
const LF_LONG: u16 = 0x8003;
const LF_ULONG: u16 = 0x8004;
const LF_REAL32: u16 = 0x8005;
const LF_REAL64: u16 = 0x8006;
const LF_QUADWORD: u16 = 0x8009;
const LF_UQUADWORD: u16 = 0x800A;
const LF_VARSTRING: u16 = 0x8010;

const MD2_VERSION: u8 = 4;
const MD2_ITERATOR_LOCALS: u8 = 3;
const MD2_FORWARD_ITERATOR: u8 = 4;

/// Name of the OEM record holding compiler custom debug information
pub const OEM_MD2: &str = "MD2";
/// Name of the OEM record holding async stepping information
pub const OEM_ASYNC_METHOD_INFO: &str = "asyncMethodInfo";
/// Name of the OEM records in the token source line stream
pub const OEM_TOKEN_SOURCE_LINE: &str = "TSLI";

/// `S_GMANPROC` / `S_LMANPROC`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProc {
    /// Stream offset of the matching `S_END`
    pub end: u32,
    /// Code length
    pub length: u32,
    /// `MethodDef` token
    pub token: Token,
    /// Address of the code within its segment
    pub offset: u32,
    /// Segment of the code
    pub segment: u16,
    /// Name, usually empty for managed code
    pub name: String,
}

/// `S_BLOCK32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Stream offset of the matching `S_END`
    pub end: u32,
    /// Length of the block
    pub length: u32,
    /// Address of the block start
    pub offset: u32,
    /// Segment of the block
    pub segment: u16,
}

/// A decoded symbol record
#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    /// Managed procedure
    ManagedProc(ManagedProc),
    /// Lexical block
    Block(Block),
    /// Local variable
    Slot {
        /// Slot index in the local signature
        index: u32,
        /// `StandAloneSig` token of the local signature
        signature_token: Token,
        /// `SLOT_*` flags
        flags: u16,
        /// Name
        name: String,
    },
    /// Named constant
    Constant {
        /// Signature token of the constant type
        signature_token: Token,
        /// Value
        value: PdbConstantValue,
        /// Name
        name: String,
    },
    /// Namespace import
    Namespace(String),
    /// Managed OEM record
    Oem {
        /// Record name
        name: String,
        /// Payload after the name
        data: Vec<u8>,
    },
    /// End of the innermost procedure or block
    End,
    /// Any other record kind
    Unknown(u16),
}

/// Decode the symbol records in `data[start..end]`, returning each with its stream offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if a record runs past `end` and
/// [`crate::Error::Malformed`] for invalid strings.
pub fn read_symbols(data: &[u8], start: usize, end: usize) -> Result<Vec<(u32, Symbol)>> {
    let data = data.get(..end).ok_or(OutOfBounds)?;
    let mut parser = Parser::new(data);
    parser.seek(start)?;

    let mut symbols = Vec::new();
    while parser.remaining() >= 4 {
        let offset = parser.pos();
        let length = parser.read_le::<u16>()? as usize;
        if length < 2 {
            return Err(malformed_error!("Symbol record at {} is too short", offset));
        }
        let record_end = parser.calc_end_position(length)?;
        let kind = parser.read_le::<u16>()?;
        let payload = &data[parser.pos()..record_end];
        symbols.push((offset as u32, read_symbol(kind, payload)?));
        parser.seek(record_end)?;
    }
    Ok(symbols)
}

fn read_symbol(kind: u16, payload: &[u8]) -> Result<Symbol> {
    let mut parser = Parser::new(payload);
    let symbol = match kind {
        S_GMANPROC | S_LMANPROC => {
            let _parent = parser.read_le::<u32>()?;
            let end = parser.read_le::<u32>()?;
            let _next = parser.read_le::<u32>()?;
            let length = parser.read_le::<u32>()?;
            let _debug_start = parser.read_le::<u32>()?;
            let _debug_end = parser.read_le::<u32>()?;
            let token = Token(parser.read_le::<u32>()?);
            let offset = parser.read_le::<u32>()?;
            let segment = parser.read_le::<u16>()?;
            let _flags = parser.read_le::<u8>()?;
            let _return_register = parser.read_le::<u16>()?;
            Symbol::ManagedProc(ManagedProc {
                end,
                length,
                token,
                offset,
                segment,
                name: parser.read_string_utf8()?,
            })
        }
        S_BLOCK32 => {
            let _parent = parser.read_le::<u32>()?;
            let end = parser.read_le::<u32>()?;
            let length = parser.read_le::<u32>()?;
            let offset = parser.read_le::<u32>()?;
            let segment = parser.read_le::<u16>()?;
            Symbol::Block(Block {
                end,
                length,
                offset,
                segment,
            })
        }
        S_MANSLOT => {
            let index = parser.read_le::<u32>()?;
            let signature_token = Token(parser.read_le::<u32>()?);
            let _code_offset = parser.read_le::<u32>()?;
            let _code_segment = parser.read_le::<u16>()?;
            let flags = parser.read_le::<u16>()?;
            Symbol::Slot {
                index,
                signature_token,
                flags,
                name: parser.read_string_utf8()?,
            }
        }
        S_MANCONSTANT => {
            let signature_token = Token(parser.read_le::<u32>()?);
            let value = read_numeric(&mut parser)?;
            Symbol::Constant {
                signature_token,
                value,
                name: parser.read_string_utf8()?,
            }
        }
        S_UNAMESPACE => Symbol::Namespace(parser.read_string_utf8()?),
        S_OEM => {
            let id = parser.read_guid()?;
            let _type_index = parser.read_le::<u32>()?;
            if id != MSIL_METADATA_GUID {
                trace!(%id, "skipping foreign OEM record");
                return Ok(Symbol::Unknown(kind));
            }
            let name = parser.read_string_utf16()?;
            Symbol::Oem {
                name,
                data: payload[parser.pos()..].to_vec(),
            }
        }
        S_END => Symbol::End,
        _ => Symbol::Unknown(kind),
    };
    Ok(symbol)
}

/// Read a numeric leaf as a constant value.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] for leaf kinds a managed constant can not hold.
pub fn read_numeric(parser: &mut Parser) -> Result<PdbConstantValue> {
    let leaf = parser.read_le::<u16>()?;
    if leaf < LF_NUMERIC {
        return Ok(PdbConstantValue::U16(leaf));
    }

    let value = match leaf {
        LF_CHAR => PdbConstantValue::I8(parser.read_le::<i8>()?),
        LF_SHORT => PdbConstantValue::I16(parser.read_le::<i16>()?),
        LF_USHORT => PdbConstantValue::U16(parser.read_le::<u16>()?),
        LF_LONG => PdbConstantValue::I32(parser.read_le::<i32>()?),
        LF_ULONG => PdbConstantValue::U32(parser.read_le::<u32>()?),
        LF_REAL32 => PdbConstantValue::F32(parser.read_le::<f32>()?),
        LF_REAL64 => PdbConstantValue::F64(parser.read_le::<f64>()?),
        LF_QUADWORD => PdbConstantValue::I64(parser.read_le::<i64>()?),
        LF_UQUADWORD => PdbConstantValue::U64(parser.read_le::<u64>()?),
        LF_VARSTRING => {
            let length = parser.read_le::<u16>()? as usize;
            let bytes = parser.read_bytes(length)?;
            PdbConstantValue::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| malformed_error!("Invalid UTF-8 in constant string"))?,
            )
        }
        _ => return Err(crate::Error::NotSupported),
    };
    Ok(value)
}

/// Write a constant value as a numeric leaf. Only `U16` values below `0x8000` use the
/// immediate form, so every variant reads back as itself.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for strings longer than `u16::MAX` bytes.
pub fn write_numeric(writer: &mut BinaryWriter, value: &PdbConstantValue) -> Result<()> {
    match value {
        PdbConstantValue::U16(v) if *v < LF_NUMERIC => writer.write_u16(*v),
        PdbConstantValue::U16(v) => {
            writer.write_u16(LF_USHORT)?;
            writer.write_u16(*v)
        }
        PdbConstantValue::I8(v) => {
            writer.write_u16(LF_CHAR)?;
            writer.write_i8(*v)
        }
        PdbConstantValue::I16(v) => {
            writer.write_u16(LF_SHORT)?;
            writer.write_i16(*v)
        }
        PdbConstantValue::I32(v) => {
            writer.write_u16(LF_LONG)?;
            writer.write_i32(*v)
        }
        PdbConstantValue::U32(v) => {
            writer.write_u16(LF_ULONG)?;
            writer.write_u32(*v)
        }
        PdbConstantValue::F32(v) => {
            writer.write_u16(LF_REAL32)?;
            writer.write_f32(*v)
        }
        PdbConstantValue::F64(v) => {
            writer.write_u16(LF_REAL64)?;
            writer.write_f64(*v)
        }
        PdbConstantValue::I64(v) => {
            writer.write_u16(LF_QUADWORD)?;
            writer.write_i64(*v)
        }
        PdbConstantValue::U64(v) => {
            writer.write_u16(LF_UQUADWORD)?;
            writer.write_u64(*v)
        }
        PdbConstantValue::String(v) => {
            let length = u16::try_from(v.len())
                .map_err(|_| malformed_error!("Constant string of {} bytes", v.len()))?;
            writer.write_u16(LF_VARSTRING)?;
            writer.write_u16(length)?;
            writer.write_bytes(v.as_bytes())
        }
    }
}

/// Serializes symbol records into a module stream.
pub struct SymbolWriter {
    writer: BinaryWriter,
}

impl SymbolWriter {
    /// A writer whose stream starts with the C13 signature
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn new() -> Result<Self> {
        let mut writer = BinaryWriter::new();
        writer.write_u32(CV_SIGNATURE_C13)?;
        Ok(SymbolWriter { writer })
    }

    /// Current stream offset
    #[must_use]
    pub fn position(&self) -> u32 {
        self.writer.position() as u32
    }

    /// Write one record and return its stream offset. Records are padded to four bytes except
    /// OEM records, whose payload length is the record length.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the record exceeds `u16::MAX` bytes.
    pub fn write(&mut self, symbol: &Symbol) -> Result<u32> {
        let start = self.writer.position();
        self.writer.write_u16(0)?;

        let kind = match symbol {
            Symbol::ManagedProc(proc) => {
                self.writer.write_u16(S_GMANPROC)?;
                self.writer.write_u32(0)?;
                self.writer.write_u32(proc.end)?;
                self.writer.write_u32(0)?;
                self.writer.write_u32(proc.length)?;
                self.writer.write_u32(0)?;
                self.writer.write_u32(proc.length)?;
                self.writer.write_u32(proc.token.value())?;
                self.writer.write_u32(proc.offset)?;
                self.writer.write_u16(proc.segment)?;
                self.writer.write_u8(0)?;
                self.writer.write_u16(0)?;
                self.writer.write_string(Some(&proc.name), true)?;
                S_GMANPROC
            }
            Symbol::Block(block) => {
                self.writer.write_u16(S_BLOCK32)?;
                self.writer.write_u32(0)?;
                self.writer.write_u32(block.end)?;
                self.writer.write_u32(block.length)?;
                self.writer.write_u32(block.offset)?;
                self.writer.write_u16(block.segment)?;
                self.writer.write_u8(0)?;
                S_BLOCK32
            }
            Symbol::Slot {
                index,
                signature_token,
                flags,
                name,
            } => {
                self.writer.write_u16(S_MANSLOT)?;
                self.writer.write_u32(*index)?;
                self.writer.write_u32(signature_token.value())?;
                self.writer.write_u32(0)?;
                self.writer.write_u16(0)?;
                self.writer.write_u16(*flags)?;
                self.writer.write_string(Some(name), true)?;
                S_MANSLOT
            }
            Symbol::Constant {
                signature_token,
                value,
                name,
            } => {
                self.writer.write_u16(S_MANCONSTANT)?;
                self.writer.write_u32(signature_token.value())?;
                write_numeric(&mut self.writer, value)?;
                self.writer.write_string(Some(name), true)?;
                S_MANCONSTANT
            }
            Symbol::Namespace(name) => {
                self.writer.write_u16(S_UNAMESPACE)?;
                self.writer.write_string(Some(name), true)?;
                S_UNAMESPACE
            }
            Symbol::Oem { name, data } => {
                self.writer.write_u16(S_OEM)?;
                self.writer.write_guid(&MSIL_METADATA_GUID)?;
                self.writer.write_u32(0)?;
                self.writer.write_utf16_nul(name)?;
                self.writer.write_bytes(data)?;
                S_OEM
            }
            Symbol::End => {
                self.writer.write_u16(S_END)?;
                S_END
            }
            Symbol::Unknown(kind) => {
                return Err(malformed_error!("Can not write unknown symbol 0x{:04X}", kind));
            }
        };

        if kind != S_OEM {
            self.writer.align(4)?;
        }
        let length = u16::try_from(self.writer.position() - start - 2)
            .map_err(|_| malformed_error!("Symbol record 0x{:04X} too large", kind))?;
        self.writer
            .buffer_mut()
            .write_at(start, &length.to_le_bytes())?;
        Ok(start as u32)
    }

    /// Set the `end` field of the procedure or block record at `record`
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn patch_end(&mut self, record: u32, end: u32) -> Result<()> {
        self.writer
            .buffer_mut()
            .write_at(record as usize + 8, &end.to_le_bytes())
    }

    /// The stream bytes written so far
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.writer.into_vec()
    }
}

/// One entry of a `DEBUG_S_FILECHKSMS` subsection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksum {
    /// Offset of the file name in the `/names` string table
    pub name_offset: u32,
    /// `CHKSUM_TYPE_*`: 0 none, 1 MD5, 2 SHA-1
    pub kind: u8,
    /// Checksum bytes
    pub checksum: Vec<u8>,
}

/// The sequence points of one file within a `DEBUG_S_LINES` subsection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBlock {
    /// Offset of the file's entry in the checksum subsection
    pub file_id: u32,
    /// Lines with offsets relative to the section start
    pub lines: Vec<PdbLine>,
}

/// A `DEBUG_S_LINES` subsection covering one contribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSection {
    /// Address of the contribution
    pub offset: u32,
    /// Segment of the contribution
    pub segment: u16,
    /// Size of the contribution
    pub code_size: u32,
    /// Per-file blocks
    pub blocks: Vec<LineBlock>,
}

/// A decoded C13 subsection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subsection {
    /// File checksums with the offset of each entry
    FileChecksums(Vec<(u32, FileChecksum)>),
    /// Line numbers
    Lines(LineSection),
    /// Any other subsection kind
    Unknown(u32),
}

/// Decode the C13 subsections of a module stream.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for truncated subsections.
pub fn read_subsections(data: &[u8]) -> Result<Vec<Subsection>> {
    let mut parser = Parser::new(data);
    let mut subsections = Vec::new();

    while parser.remaining() >= 8 {
        let kind = parser.read_le::<u32>()?;
        let length = parser.read_le::<u32>()? as usize;
        let end = parser.calc_end_position(length)?;
        let content = &data[parser.pos()..end];

        subsections.push(match kind {
            DEBUG_S_FILECHKSMS => Subsection::FileChecksums(read_file_checksums(content)?),
            DEBUG_S_LINES => Subsection::Lines(read_lines(content)?),
            _ => Subsection::Unknown(kind),
        });

        parser.seek(end)?;
        if parser.remaining() > 0 {
            parser.align(4)?;
        }
    }
    Ok(subsections)
}

fn read_file_checksums(data: &[u8]) -> Result<Vec<(u32, FileChecksum)>> {
    let mut parser = Parser::new(data);
    let mut entries = Vec::new();
    while parser.remaining() >= 6 {
        let offset = parser.pos() as u32;
        let name_offset = parser.read_le::<u32>()?;
        let size = parser.read_le::<u8>()? as usize;
        let kind = parser.read_le::<u8>()?;
        let checksum = parser.read_bytes(size)?.to_vec();
        entries.push((
            offset,
            FileChecksum {
                name_offset,
                kind,
                checksum,
            },
        ));
        if parser.remaining() > 0 {
            parser.align(4)?;
        }
    }
    Ok(entries)
}

fn read_lines(data: &[u8]) -> Result<LineSection> {
    let mut parser = Parser::new(data);
    let offset = parser.read_le::<u32>()?;
    let segment = parser.read_le::<u16>()?;
    let flags = parser.read_le::<u16>()?;
    let code_size = parser.read_le::<u32>()?;
    let has_columns = flags & LINES_HAVE_COLUMNS != 0;

    let mut blocks = Vec::new();
    while parser.remaining() >= 12 {
        let block_start = parser.pos();
        let file_id = parser.read_le::<u32>()?;
        let count = parser.read_le::<u32>()? as usize;
        let block_size = parser.read_le::<u32>()? as usize;
        let block_end = block_start.checked_add(block_size).ok_or(OutOfBounds)?;
        if block_end > data.len() || count > block_size / 8 {
            return Err(OutOfBounds);
        }

        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let line_offset = parser.read_le::<u32>()?;
            let bits = parser.read_le::<u32>()?;
            let line_begin = bits & LINE_NUMBER_MASK;
            let delta = (bits >> 24) & LINE_DELTA_MAX;
            lines.push(PdbLine {
                offset: line_offset,
                line_begin,
                col_begin: 0,
                line_end: line_begin + delta,
                col_end: 0,
            });
        }
        if has_columns {
            for line in &mut lines {
                line.col_begin = parser.read_le::<u16>()?;
                line.col_end = parser.read_le::<u16>()?;
            }
        }

        blocks.push(LineBlock { file_id, lines });
        parser.seek(block_end)?;
    }

    Ok(LineSection {
        offset,
        segment,
        code_size,
        blocks,
    })
}

fn begin_subsection(writer: &mut BinaryWriter, kind: u32) -> Result<usize> {
    writer.write_u32(kind)?;
    let length_at = writer.position();
    writer.write_u32(0)?;
    Ok(length_at)
}

fn end_subsection(writer: &mut BinaryWriter, length_at: usize) -> Result<()> {
    let length = (writer.position() - length_at - 4) as u32;
    writer
        .buffer_mut()
        .write_at(length_at, &length.to_le_bytes())?;
    writer.align(4)
}

/// Write a `DEBUG_S_FILECHKSMS` subsection and return the file id of each entry.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for checksums longer than 255 bytes.
pub fn write_file_checksums(
    writer: &mut BinaryWriter,
    entries: &[FileChecksum],
) -> Result<Vec<u32>> {
    let length_at = begin_subsection(writer, DEBUG_S_FILECHKSMS)?;
    let start = writer.position();

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        ids.push((writer.position() - start) as u32);
        let size = u8::try_from(entry.checksum.len())
            .map_err(|_| malformed_error!("Checksum of {} bytes", entry.checksum.len()))?;
        writer.write_u32(entry.name_offset)?;
        writer.write_u8(size)?;
        writer.write_u8(entry.kind)?;
        writer.write_bytes(&entry.checksum)?;
        writer.align(4)?;
    }

    end_subsection(writer, length_at)?;
    Ok(ids)
}

/// Write a `DEBUG_S_LINES` subsection with column information. End lines more than 127 lines
/// after the start line are clamped, as the record can not express them.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for line numbers above `0xFF_FFFF`.
pub fn write_lines(writer: &mut BinaryWriter, section: &LineSection) -> Result<()> {
    let length_at = begin_subsection(writer, DEBUG_S_LINES)?;

    writer.write_u32(section.offset)?;
    writer.write_u16(section.segment)?;
    writer.write_u16(LINES_HAVE_COLUMNS)?;
    writer.write_u32(section.code_size)?;

    for block in &section.blocks {
        writer.write_u32(block.file_id)?;
        writer.write_u32(block.lines.len() as u32)?;
        writer.write_u32(12 + 12 * block.lines.len() as u32)?;

        for line in &block.lines {
            if line.line_begin > LINE_NUMBER_MASK {
                return Err(malformed_error!("Line number {} out of range", line.line_begin));
            }
            let delta = line.line_end.saturating_sub(line.line_begin);
            if delta > LINE_DELTA_MAX {
                tracing::warn!(
                    line = line.line_begin,
                    end = line.line_end,
                    "clamping sequence point end line"
                );
            }
            writer.write_u32(line.offset)?;
            writer.write_u32(
                line.line_begin | (delta.min(LINE_DELTA_MAX) << 24) | LINE_IS_STATEMENT,
            )?;
        }
        for line in &block.lines {
            writer.write_u16(line.col_begin)?;
            writer.write_u16(line.col_end)?;
        }
    }

    end_subsection(writer, length_at)
}

/// Iterator and using information carried in an `MD2` record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Md2 {
    /// Class of the iterator state machine, on the kickoff method
    pub iterator_class: Option<String>,
    /// Hoisted local scopes, on the `MoveNext` method
    pub iterator_scopes: Vec<IteratorScope>,
}

/// Decode an `MD2` payload. Unknown record kinds are skipped.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for an unsupported version or inconsistent sizes.
pub fn read_md2(data: &[u8]) -> Result<Md2> {
    let mut parser = Parser::new(data);
    let version = parser.read_le::<u8>()?;
    if version != MD2_VERSION {
        return Err(malformed_error!("Unsupported MD2 version {}", version));
    }
    let count = parser.read_le::<u8>()?;
    parser.advance_by(2)?;

    let mut md2 = Md2::default();
    for _ in 0..count {
        let start = parser.pos();
        let _version = parser.read_le::<u8>()?;
        let kind = parser.read_le::<u8>()?;
        parser.advance_by(2)?;
        let size = parser.read_le::<u32>()? as usize;
        if size < 8 {
            return Err(malformed_error!("MD2 record of {} bytes", size));
        }
        let end = start.checked_add(size).ok_or(OutOfBounds)?;
        let mut record = Parser::new(data.get(parser.pos()..end).ok_or(OutOfBounds)?);

        match kind {
            MD2_ITERATOR_LOCALS => {
                let scopes = record.read_le::<u32>()?;
                for _ in 0..scopes {
                    let scope_start = record.read_le::<u32>()?;
                    let scope_end = record.read_le::<u32>()?;
                    md2.iterator_scopes.push(IteratorScope {
                        offset: scope_start,
                        length: scope_end.saturating_sub(scope_start),
                    });
                }
            }
            MD2_FORWARD_ITERATOR => {
                md2.iterator_class = Some(record.read_string_utf16()?);
            }
            _ => trace!(kind, "skipping MD2 record"),
        }
        parser.seek(end)?;
    }
    Ok(md2)
}

/// Encode an `MD2` payload
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
pub fn write_md2(md2: &Md2) -> Result<Vec<u8>> {
    let mut records: Vec<(u8, Vec<u8>)> = Vec::new();

    if let Some(class) = &md2.iterator_class {
        let mut writer = BinaryWriter::new();
        writer.write_utf16_nul(class)?;
        records.push((MD2_FORWARD_ITERATOR, writer.into_vec()));
    }
    if !md2.iterator_scopes.is_empty() {
        let mut writer = BinaryWriter::new();
        writer.write_u32(md2.iterator_scopes.len() as u32)?;
        for scope in &md2.iterator_scopes {
            writer.write_u32(scope.offset)?;
            writer.write_u32(scope.offset + scope.length)?;
        }
        records.push((MD2_ITERATOR_LOCALS, writer.into_vec()));
    }

    let mut writer = BinaryWriter::new();
    writer.write_u8(MD2_VERSION)?;
    writer.write_u8(records.len() as u8)?;
    writer.write_u16(0)?;
    for (kind, payload) in records {
        let padded = payload.len().next_multiple_of(4);
        writer.write_u8(MD2_VERSION)?;
        writer.write_u8(kind)?;
        writer.write_u16(0)?;
        writer.write_u32((8 + padded) as u32)?;
        writer.write_bytes(&payload)?;
        writer.align(4)?;
    }
    Ok(writer.into_vec())
}

/// Decode an `asyncMethodInfo` payload of `method`: kickoff token, catch handler offset
/// (`u32::MAX` for none), await count, then `(yield offset, resume method, resume offset)`
/// triples.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for truncated data.
pub fn read_async_method_info(data: &[u8], method: Token) -> Result<PdbAsyncInfo> {
    let mut parser = Parser::new(data);
    let kickoff_method = Token(parser.read_le::<u32>()?);
    let catch_handler_offset = parser.read_le::<u32>()?;
    let count = parser.read_le::<u32>()? as usize;
    if count > parser.remaining() / 12 {
        return Err(OutOfBounds);
    }

    let mut info = PdbAsyncInfo {
        kickoff_method,
        catch_handler_offset: (catch_handler_offset != u32::MAX).then_some(catch_handler_offset),
        yield_offsets: Vec::with_capacity(count),
        resume_offsets: Vec::with_capacity(count),
        move_next_method: method,
    };
    for index in 0..count {
        info.yield_offsets.push(parser.read_le::<u32>()?);
        let resume_method = Token(parser.read_le::<u32>()?);
        info.resume_offsets.push(parser.read_le::<u32>()?);
        if index == 0 && !resume_method.is_null() {
            info.move_next_method = resume_method;
        }
    }
    Ok(info)
}

/// Encode an `asyncMethodInfo` payload
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the yield and resume lists differ in length.
pub fn write_async_method_info(info: &PdbAsyncInfo) -> Result<Vec<u8>> {
    if info.yield_offsets.len() != info.resume_offsets.len() {
        return Err(malformed_error!(
            "{} yield offsets but {} resume offsets",
            info.yield_offsets.len(),
            info.resume_offsets.len()
        ));
    }

    let mut writer = BinaryWriter::new();
    writer.write_u32(info.kickoff_method.value())?;
    writer.write_u32(info.catch_handler_offset.unwrap_or(u32::MAX))?;
    writer.write_u32(info.yield_offsets.len() as u32)?;
    for (yield_offset, resume_offset) in info.yield_offsets.iter().zip(&info.resume_offsets) {
        writer.write_u32(*yield_offset)?;
        writer.write_u32(info.move_next_method.value())?;
        writer.write_u32(*resume_offset)?;
    }
    Ok(writer.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_leaves() {
        let values = [
            PdbConstantValue::U16(5),
            PdbConstantValue::U16(0x9000),
            PdbConstantValue::I8(-3),
            PdbConstantValue::I16(-300),
            PdbConstantValue::I32(5),
            PdbConstantValue::U32(0xFFFF_0000),
            PdbConstantValue::I64(-1),
            PdbConstantValue::U64(u64::MAX),
            PdbConstantValue::F32(1.5),
            PdbConstantValue::F64(-2.25),
            PdbConstantValue::String("hello".into()),
        ];
        for value in values {
            let mut writer = BinaryWriter::new();
            write_numeric(&mut writer, &value).unwrap();
            let bytes = writer.into_vec();
            let mut parser = Parser::new(&bytes);
            assert_eq!(read_numeric(&mut parser).unwrap(), value);
            assert!(!parser.has_more_data());
        }

        let mut writer = BinaryWriter::new();
        write_numeric(&mut writer, &PdbConstantValue::U16(5)).unwrap();
        assert_eq!(writer.as_slice(), &[0x05, 0x00]);

        let mut parser = Parser::new(&[0x07, 0x80]);
        assert!(matches!(
            read_numeric(&mut parser),
            Err(crate::Error::NotSupported)
        ));
    }

    #[test]
    fn symbol_records() {
        let mut writer = SymbolWriter::new().unwrap();
        let proc = writer
            .write(&Symbol::ManagedProc(ManagedProc {
                end: 0,
                length: 12,
                token: Token(0x0600_0002),
                offset: 0x40,
                segment: 1,
                name: String::new(),
            }))
            .unwrap();
        writer
            .write(&Symbol::Slot {
                index: 1,
                signature_token: Token(0x1100_0001),
                flags: SLOT_COMPILER_GENERATED,
                name: "CS$0".into(),
            })
            .unwrap();
        writer
            .write(&Symbol::Oem {
                name: OEM_MD2.into(),
                data: vec![1, 2, 3],
            })
            .unwrap();
        writer.write(&Symbol::Namespace("USystem".into())).unwrap();
        let end = writer.write(&Symbol::End).unwrap();
        writer.patch_end(proc, end).unwrap();
        let bytes = writer.into_vec();

        let symbols = read_symbols(&bytes, 4, bytes.len()).unwrap();
        assert_eq!(symbols.len(), 5);
        assert_eq!(symbols[0].0, 4);
        let Symbol::ManagedProc(decoded) = &symbols[0].1 else {
            panic!("expected a procedure");
        };
        assert_eq!(decoded.end, end);
        assert_eq!(decoded.token, Token(0x0600_0002));
        assert_eq!(decoded.length, 12);
        assert_eq!(
            symbols[1].1,
            Symbol::Slot {
                index: 1,
                signature_token: Token(0x1100_0001),
                flags: SLOT_COMPILER_GENERATED,
                name: "CS$0".into(),
            }
        );
        assert_eq!(
            symbols[2].1,
            Symbol::Oem {
                name: OEM_MD2.into(),
                data: vec![1, 2, 3],
            }
        );
        assert_eq!(symbols[3].1, Symbol::Namespace("USystem".into()));
        assert_eq!(symbols[4], (end, Symbol::End));
        assert_eq!(symbols[1].0 % 4, 0);
    }

    #[test]
    fn foreign_oem_is_unknown() {
        #[rustfmt::skip]
        let mut bytes = vec![0x16, 0x00, 0x04, 0x04];
        bytes.extend_from_slice(&[0xAA; 16]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let symbols = read_symbols(&bytes, 0, bytes.len()).unwrap();
        assert_eq!(symbols[0].1, Symbol::Unknown(S_OEM));
    }

    #[test]
    fn line_subsections() {
        let mut writer = BinaryWriter::new();
        let ids = write_file_checksums(
            &mut writer,
            &[
                FileChecksum {
                    name_offset: 1,
                    kind: 2,
                    checksum: vec![0xAB; 20],
                },
                FileChecksum {
                    name_offset: 9,
                    kind: 0,
                    checksum: Vec::new(),
                },
            ],
        )
        .unwrap();
        assert_eq!(ids, vec![0, 28]);

        let lines = vec![
            PdbLine {
                offset: 0,
                line_begin: 10,
                col_begin: 5,
                line_end: 12,
                col_end: 6,
            },
            PdbLine::hidden(6),
        ];
        let section = LineSection {
            offset: 0x40,
            segment: 1,
            code_size: 12,
            blocks: vec![LineBlock {
                file_id: 28,
                lines,
            }],
        };
        write_lines(&mut writer, &section).unwrap();

        let subsections = read_subsections(writer.as_slice()).unwrap();
        let Subsection::FileChecksums(entries) = &subsections[0] else {
            panic!("expected checksums");
        };
        assert_eq!(entries[1].0, 28);
        assert_eq!(entries[0].1.checksum.len(), 20);
        assert_eq!(subsections[1], Subsection::Lines(section));
    }

    #[test]
    fn md2_records() {
        let md2 = Md2 {
            iterator_class: Some("<Items>d__0".into()),
            iterator_scopes: vec![
                IteratorScope {
                    offset: 4,
                    length: 10,
                },
                IteratorScope {
                    offset: 20,
                    length: 2,
                },
            ],
        };
        let bytes = write_md2(&md2).unwrap();
        assert_eq!(bytes[..2], [4, 2]);
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(read_md2(&bytes).unwrap(), md2);
        assert!(read_md2(&[3, 0, 0, 0]).is_err());
    }

    #[test]
    fn async_method_info() {
        let info = PdbAsyncInfo {
            kickoff_method: Token(0x0600_0001),
            catch_handler_offset: None,
            yield_offsets: vec![10, 40],
            resume_offsets: vec![20, 50],
            move_next_method: Token(0x0600_0005),
        };
        let bytes = write_async_method_info(&info).unwrap();
        assert_eq!(bytes.len(), 12 + 2 * 12);
        assert_eq!(bytes[4..8], [0xFF; 4]);
        assert_eq!(
            read_async_method_info(&bytes, Token(0x0600_0005)).unwrap(),
            info
        );

        let mut broken = info;
        broken.resume_offsets.pop();
        assert!(write_async_method_info(&broken).is_err());
    }
}
