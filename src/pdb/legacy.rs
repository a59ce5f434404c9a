//! Reader and writer for Windows PDB files of managed modules.
//!
//! The layout follows what managed symbol writers produce: one module whose stream carries the
//! CodeView symbols of all methods and the C13 line subsections, plus a set of named streams.
//!
//! | Stream | Content |
//! |--------|---------|
//! | 0 | Old directory, empty |
//! | 1 | PDB info: version, signature, age, GUID, named stream map |
//! | 2 | Type info, header only |
//! | 3 | DBI: header, module record, file info |
//! | module | Symbols, file checksums, lines |
//! | `/names` | String table for file names |
//! | `/src/files/<name>` | Language, vendor, document type and checksum of a document |
//! | `/src/files/<name>#<n>` | The same, for document `n` when an earlier document has its name |
//! | `/tokensourcelines` | `TSLI` records for tokens without code |
//! | `/entrypoint` | Entry point token |
//! | `srcsrv` | Source server script |
//!
//! Methods are laid out at synthetic addresses in segment 1 so each procedure and its line
//! subsection share a unique offset.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};
use uguid::Guid;

use crate::{
    file::parser::Parser,
    pdb::{
        codeview::{
            read_async_method_info, read_md2, read_subsections, read_symbols,
            write_async_method_info, write_file_checksums, write_lines, write_md2, Block,
            FileChecksum, LineBlock, LineSection, ManagedProc, Md2, Subsection, Symbol,
            SymbolWriter, OEM_ASYNC_METHOD_INFO, OEM_MD2, OEM_TOKEN_SOURCE_LINE,
            SLOT_COMPILER_GENERATED,
        },
        msf::{Msf, MsfWriter},
        ChecksumAlgorithm, PdbBuilder, PdbConstant, PdbFormat, PdbFunction, PdbInfo, PdbScope,
        PdbSlot, PdbSource, PdbWriterOptions, SourceLocation,
    },
    token::Token,
    writer::BinaryWriter,
    Error::OutOfBounds,
    Result,
};

const STREAM_PDB_INFO: u32 = 1;
const STREAM_TPI: u32 = 2;
const STREAM_DBI: u32 = 3;

const PDB_INFO_VERSION: u32 = 20_000_404;
const PDB_FEATURE_VC110: u32 = 20_091_201;
const TPI_VERSION: u32 = 20_040_203;
const TPI_HEADER_SIZE: u32 = 56;
const DBI_VERSION: u32 = 19_990_903;
const DBI_HEADER_SIZE: usize = 64;
const DBI_BUILD_NUMBER: u16 = 0x8E00;
const SECTION_CONTRIBUTION_VERSION: u32 = 0xEFFE_0000 + 19_970_605;
const NAMES_MAGIC: u32 = 0xEFFE_EFFE;
const NO_STREAM: u16 = 0xFFFF;

const NAMES_STREAM: &str = "/names";
const SOURCE_FILES_PREFIX: &str = "/src/files/";
const TOKEN_SOURCE_LINES_STREAM: &str = "/tokensourcelines";
const ENTRY_POINT_STREAM: &str = "/entrypoint";
const SOURCE_SERVER_STREAM: &str = "srcsrv";

const MODULE_NAME: &str = "managed";
const CODE_SEGMENT: u16 = 1;

/// The string hash used by PDB hash tables (`hashStringV1`).
#[must_use]
pub fn hash_string_v1(name: &[u8]) -> u32 {
    let mut result = 0u32;
    let mut words = name.chunks_exact(4);
    for word in &mut words {
        result ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }

    let mut rest = words.remainder();
    if rest.len() >= 2 {
        result ^= u32::from(u16::from_le_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
    }
    if let Some(byte) = rest.first() {
        result ^= u32::from(*byte);
    }

    result |= 0x2020_2020;
    result ^= result >> 11;
    result ^= result >> 16;
    result
}

/// Deduplicating NUL-terminated string buffer whose first byte is an empty string
struct StringBuffer {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringBuffer {
    fn new() -> Self {
        StringBuffer {
            data: vec![0],
            offsets: HashMap::new(),
        }
    }

    fn insert(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(offset) = self.offsets.get(value) {
            return *offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.offsets.insert(value.to_string(), offset);
        offset
    }
}

fn string_at(buffer: &[u8], offset: u32) -> Result<String> {
    let tail = buffer.get(offset as usize..).ok_or(OutOfBounds)?;
    Parser::new(tail).read_string_utf8()
}

struct InfoStream {
    age: u32,
    guid: Guid,
    named_streams: HashMap<String, u32>,
}

fn read_info_stream(data: &[u8]) -> Result<InfoStream> {
    let mut parser = Parser::new(data);
    let version = parser.read_le::<u32>()?;
    if version != PDB_INFO_VERSION {
        debug!(version, "unexpected PDB info stream version");
    }
    let _signature = parser.read_le::<u32>()?;
    let age = parser.read_le::<u32>()?;
    let guid = parser.read_guid()?;

    let buffer_size = parser.read_le::<u32>()? as usize;
    let names = parser.read_bytes(buffer_size)?;
    let _count = parser.read_le::<u32>()?;
    let capacity = parser.read_le::<u32>()?;
    let present = read_bit_vector(&mut parser)?;
    let _deleted = read_bit_vector(&mut parser)?;

    let mut named_streams = HashMap::new();
    for bucket in 0..capacity {
        let word = present.get((bucket / 32) as usize).copied().unwrap_or(0);
        if word & (1 << (bucket % 32)) == 0 {
            continue;
        }
        let name_offset = parser.read_le::<u32>()?;
        let stream = parser.read_le::<u32>()?;
        named_streams.insert(string_at(names, name_offset)?, stream);
    }

    Ok(InfoStream {
        age,
        guid,
        named_streams,
    })
}

fn read_bit_vector(parser: &mut Parser) -> Result<Vec<u32>> {
    let words = parser.read_le::<u32>()? as usize;
    if words > parser.remaining() / 4 {
        return Err(OutOfBounds);
    }
    (0..words).map(|_| parser.read_le::<u32>()).collect()
}

fn write_info_stream(info: &PdbInfo, named_streams: &[(String, u32)]) -> Result<Vec<u8>> {
    let guid_bytes = info.guid.to_bytes();
    let mut writer = BinaryWriter::new();
    writer.write_u32(PDB_INFO_VERSION)?;
    writer.write_u32(u32::from_le_bytes([
        guid_bytes[0],
        guid_bytes[1],
        guid_bytes[2],
        guid_bytes[3],
    ]))?;
    writer.write_u32(info.age)?;
    writer.write_guid(&info.guid)?;

    let mut names = Vec::new();
    let capacity = (named_streams.len() as u32 * 2).max(1);
    let mut buckets: Vec<Option<(u32, u32)>> = vec![None; capacity as usize];
    for (name, stream) in named_streams {
        let offset = names.len() as u32;
        names.extend_from_slice(name.as_bytes());
        names.push(0);

        let mut bucket = (hash_string_v1(name.as_bytes()) as u16 as u32 % capacity) as usize;
        while buckets[bucket].is_some() {
            bucket = (bucket + 1) % capacity as usize;
        }
        buckets[bucket] = Some((offset, *stream));
    }

    writer.write_u32(names.len() as u32)?;
    writer.write_bytes(&names)?;
    writer.write_u32(named_streams.len() as u32)?;
    writer.write_u32(capacity)?;

    let mut present = vec![0u32; capacity.div_ceil(32) as usize];
    for (index, bucket) in buckets.iter().enumerate() {
        if bucket.is_some() {
            present[index / 32] |= 1 << (index % 32);
        }
    }
    writer.write_u32(present.len() as u32)?;
    for word in &present {
        writer.write_u32(*word)?;
    }
    writer.write_u32(0)?;
    for (offset, stream) in buckets.into_iter().flatten() {
        writer.write_u32(offset)?;
        writer.write_u32(stream)?;
    }

    writer.write_u32(PDB_FEATURE_VC110)?;
    Ok(writer.into_vec())
}

fn write_tpi_stream() -> Result<Vec<u8>> {
    let mut writer = BinaryWriter::new();
    writer.write_u32(TPI_VERSION)?;
    writer.write_u32(TPI_HEADER_SIZE)?;
    writer.write_u32(0x1000)?;
    writer.write_u32(0x1000)?;
    writer.write_u32(0)?;
    writer.write_u16(NO_STREAM)?;
    writer.write_u16(NO_STREAM)?;
    writer.write_u32(4)?;
    writer.write_u32(0x3FFFF)?;
    for _ in 0..6 {
        writer.write_u32(0)?;
    }
    Ok(writer.into_vec())
}

struct ModuleRecord {
    stream: u16,
    symbol_bytes: u32,
    c13_bytes: u32,
}

fn read_dbi_modules(data: &[u8]) -> Result<Vec<ModuleRecord>> {
    let mut parser = Parser::new(data);
    let signature = parser.read_le::<i32>()?;
    let version = parser.read_le::<u32>()?;
    if signature != -1 {
        return Err(malformed_error!("Unsupported DBI signature {}", signature));
    }
    trace!(version, "DBI stream");

    parser.seek(24)?;
    let module_info_size = parser.read_le::<i32>()?;
    let module_info_end = DBI_HEADER_SIZE
        .checked_add(usize::try_from(module_info_size).map_err(|_| OutOfBounds)?)
        .ok_or(OutOfBounds)?;
    if module_info_end > data.len() {
        return Err(OutOfBounds);
    }

    let mut parser = Parser::new(&data[..module_info_end]);
    parser.seek(DBI_HEADER_SIZE)?;
    let mut modules = Vec::new();
    while parser.remaining() >= 64 {
        parser.advance_by(4 + 28 + 2)?;
        let stream = parser.read_le::<u16>()?;
        let symbol_bytes = parser.read_le::<u32>()?;
        let _c11_bytes = parser.read_le::<u32>()?;
        let c13_bytes = parser.read_le::<u32>()?;
        parser.advance_by(2 + 2 + 4 + 4 + 4)?;
        let _module_name = parser.read_string_utf8()?;
        let _object_name = parser.read_string_utf8()?;
        if parser.remaining() > 0 {
            parser.align(4)?;
        }
        modules.push(ModuleRecord {
            stream,
            symbol_bytes,
            c13_bytes,
        });
    }
    Ok(modules)
}

fn write_dbi_stream(
    age: u32,
    module: &ModuleRecord,
    code_size: u32,
    file_names: &[&str],
) -> Result<Vec<u8>> {
    let mut modules = BinaryWriter::new();
    modules.write_u32(0)?;
    modules.write_u16(CODE_SEGMENT)?;
    modules.write_u16(0)?;
    modules.write_i32(0)?;
    modules.write_u32(code_size)?;
    modules.write_u32(0x6000_0020)?;
    modules.write_u16(0)?;
    modules.write_u16(0)?;
    modules.write_u32(0)?;
    modules.write_u32(0)?;
    modules.write_u16(0)?;
    modules.write_u16(module.stream)?;
    modules.write_u32(module.symbol_bytes)?;
    modules.write_u32(0)?;
    modules.write_u32(module.c13_bytes)?;
    modules.write_u16(file_names.len() as u16)?;
    modules.write_u16(0)?;
    modules.write_u32(0)?;
    modules.write_u32(0)?;
    modules.write_u32(0)?;
    modules.write_string(Some(MODULE_NAME), true)?;
    modules.write_string(Some(MODULE_NAME), true)?;
    modules.align(4)?;

    let mut contributions = BinaryWriter::new();
    contributions.write_u32(SECTION_CONTRIBUTION_VERSION)?;

    let mut section_map = BinaryWriter::new();
    section_map.write_u16(0)?;
    section_map.write_u16(0)?;

    let mut files = BinaryWriter::new();
    files.write_u16(1)?;
    files.write_u16(file_names.len() as u16)?;
    files.write_u16(0)?;
    files.write_u16(file_names.len() as u16)?;
    let mut names = BinaryWriter::new();
    for name in file_names {
        files.write_u32(names.position() as u32)?;
        names.write_string(Some(name), true)?;
    }
    files.write_bytes(names.as_slice())?;
    files.align(4)?;

    let mut debug_header = BinaryWriter::new();
    for _ in 0..11 {
        debug_header.write_u16(NO_STREAM)?;
    }

    let mut writer = BinaryWriter::new();
    writer.write_i32(-1)?;
    writer.write_u32(DBI_VERSION)?;
    writer.write_u32(age)?;
    writer.write_u16(NO_STREAM)?;
    writer.write_u16(DBI_BUILD_NUMBER)?;
    writer.write_u16(NO_STREAM)?;
    writer.write_u16(0)?;
    writer.write_u16(NO_STREAM)?;
    writer.write_u16(0)?;
    writer.write_u32(modules.len() as u32)?;
    writer.write_u32(contributions.len() as u32)?;
    writer.write_u32(section_map.len() as u32)?;
    writer.write_u32(files.len() as u32)?;
    writer.write_u32(0)?;
    writer.write_u32(0)?;
    writer.write_u32(debug_header.len() as u32)?;
    writer.write_u32(0)?;
    writer.write_u16(0)?;
    writer.write_u16(0)?;
    writer.write_u32(0)?;

    writer.write_bytes(modules.as_slice())?;
    writer.write_bytes(contributions.as_slice())?;
    writer.write_bytes(section_map.as_slice())?;
    writer.write_bytes(files.as_slice())?;
    writer.write_bytes(debug_header.as_slice())?;
    Ok(writer.into_vec())
}

fn write_names_stream(buffer: &StringBuffer) -> Result<Vec<u8>> {
    let count = buffer.offsets.len() as u32;
    let bucket_count = (count * 2).max(1);
    let mut buckets = vec![0u32; bucket_count as usize];
    let mut entries: Vec<(&String, &u32)> = buffer.offsets.iter().collect();
    entries.sort_by_key(|(_, offset)| **offset);
    for (name, offset) in entries {
        let mut bucket = (hash_string_v1(name.as_bytes()) % bucket_count) as usize;
        while buckets[bucket] != 0 {
            bucket = (bucket + 1) % bucket_count as usize;
        }
        buckets[bucket] = *offset;
    }

    let mut writer = BinaryWriter::new();
    writer.write_u32(NAMES_MAGIC)?;
    writer.write_u32(1)?;
    writer.write_u32(buffer.data.len() as u32)?;
    writer.write_bytes(&buffer.data)?;
    writer.write_u32(bucket_count)?;
    for bucket in buckets {
        writer.write_u32(bucket)?;
    }
    writer.write_u32(count)?;
    Ok(writer.into_vec())
}

fn read_names_buffer(data: &[u8]) -> Result<&[u8]> {
    let mut parser = Parser::new(data);
    let magic = parser.read_le::<u32>()?;
    if magic != NAMES_MAGIC {
        return Err(malformed_error!("Invalid string table magic 0x{:08X}", magic));
    }
    let _version = parser.read_le::<u32>()?;
    let size = parser.read_le::<u32>()? as usize;
    parser.read_bytes(size)
}

fn read_source_file(name: String, data: &[u8]) -> Result<PdbSource> {
    let mut parser = Parser::new(data);
    let language = parser.read_guid()?;
    let vendor = parser.read_guid()?;
    let doc_type = parser.read_guid()?;
    let checksum_algorithm = parser.read_guid()?;
    let checksum_size = usize::try_from(parser.read_le::<i32>()?).map_err(|_| OutOfBounds)?;
    let _source_size = parser.read_le::<i32>()?;
    let checksum = parser.read_bytes(checksum_size)?.to_vec();
    Ok(PdbSource {
        name,
        language,
        vendor,
        doc_type,
        checksum_algorithm,
        checksum,
    })
}

fn write_source_file(source: &PdbSource) -> Result<Vec<u8>> {
    let mut writer = BinaryWriter::new();
    writer.write_guid(&source.language)?;
    writer.write_guid(&source.vendor)?;
    writer.write_guid(&source.doc_type)?;
    writer.write_guid(&source.checksum_algorithm)?;
    writer.write_i32(source.checksum.len() as i32)?;
    writer.write_i32(0)?;
    writer.write_bytes(&source.checksum)?;
    Ok(writer.into_vec())
}

/// Stream holding a document whose name an earlier document of the checksum table already
/// uses, ignoring case. `position` is the index of the document in that table.
fn repeated_source_file_stream(lowered_name: &str, position: usize) -> String {
    format!("{SOURCE_FILES_PREFIX}{lowered_name}#{position}")
}

fn fallback_source(name: String, entry: &FileChecksum) -> PdbSource {
    let algorithm = ChecksumAlgorithm::from_codeview_kind(entry.kind);
    PdbSource {
        name,
        language: Guid::ZERO,
        vendor: Guid::ZERO,
        doc_type: Guid::ZERO,
        checksum_algorithm: algorithm.map_or(Guid::ZERO, |algorithm| algorithm.guid()),
        checksum: if algorithm.is_some() {
            entry.checksum.clone()
        } else {
            Vec::new()
        },
    }
}

enum Frame {
    Proc {
        token: Token,
        offset: u32,
        length: u32,
        implicit_root: bool,
    },
    Block {
        end: u32,
    },
}

struct ModuleReader<'a> {
    builder: &'a mut PdbBuilder,
    frames: Vec<Frame>,
}

impl ModuleReader<'_> {
    fn method(&self) -> Option<(Token, u32)> {
        self.frames.iter().find_map(|frame| match frame {
            Frame::Proc { token, offset, .. } => Some((*token, *offset)),
            Frame::Block { .. } => None,
        })
    }

    /// Items directly under a procedure go into a root scope covering the whole method.
    fn ensure_scope(&mut self) -> Result<bool> {
        match self.frames.last_mut() {
            Some(Frame::Proc { implicit_root, .. }) => {
                if !*implicit_root {
                    *implicit_root = true;
                    self.builder.open_scope(0)?;
                }
                Ok(true)
            }
            Some(Frame::Block { .. }) => Ok(true),
            None => Ok(false),
        }
    }

    fn symbol(&mut self, stream_offset: u32, symbol: Symbol, lines: &LineLookup) -> Result<()> {
        match symbol {
            Symbol::ManagedProc(proc) => {
                if self.method().is_some() {
                    return Err(malformed_error!(
                        "Procedure at {} nested in another procedure",
                        stream_offset
                    ));
                }
                self.builder.open_method(proc.token)?;
                if let Some(section) = lines.get(&proc.offset) {
                    for block in &section.blocks {
                        let source = *lines_source(lines, block.file_id)?;
                        self.builder
                            .define_sequence_points(source, block.lines.clone())?;
                    }
                }
                self.frames.push(Frame::Proc {
                    token: proc.token,
                    offset: proc.offset,
                    length: proc.length,
                    implicit_root: false,
                });
            }
            Symbol::Block(block) => {
                let Some((_, base)) = self.method() else {
                    trace!(stream_offset, "block outside of a procedure");
                    return Ok(());
                };
                let start = block.offset.saturating_sub(base);
                self.builder.open_scope(start)?;
                self.frames.push(Frame::Block {
                    end: start + block.length,
                });
            }
            Symbol::Slot {
                index,
                signature_token,
                flags,
                name,
            } => {
                if self.ensure_scope()? {
                    self.builder.define_local_variable(PdbSlot {
                        index,
                        name,
                        compiler_generated: flags & SLOT_COMPILER_GENERATED != 0,
                        signature_token,
                    })?;
                }
            }
            Symbol::Constant {
                signature_token,
                value,
                name,
            } => {
                if self.ensure_scope()? {
                    self.builder.define_local_constant(PdbConstant {
                        name,
                        signature_token,
                        value,
                    })?;
                }
            }
            Symbol::Namespace(name) => {
                if self.ensure_scope()? {
                    self.builder.using_namespace(name)?;
                }
            }
            Symbol::Oem { name, data } => {
                let Some((token, _)) = self.method() else {
                    trace!(name = %name, "OEM record outside of a procedure");
                    return Ok(());
                };
                match name.as_str() {
                    OEM_MD2 => {
                        let md2 = read_md2(&data)?;
                        self.builder
                            .set_iterator_info(md2.iterator_class, md2.iterator_scopes)?;
                    }
                    OEM_ASYNC_METHOD_INFO => {
                        self.builder
                            .set_async_info(read_async_method_info(&data, token)?)?;
                    }
                    _ => self.builder.add_custom_metadata(name, data)?,
                }
            }
            Symbol::End => match self.frames.pop() {
                Some(Frame::Block { end }) => self.builder.close_scope(end)?,
                Some(Frame::Proc {
                    length,
                    implicit_root,
                    ..
                }) => {
                    if implicit_root {
                        self.builder.close_scope(length)?;
                    }
                    self.builder.close_method(length)?;
                }
                None => trace!(stream_offset, "unbalanced S_END"),
            },
            Symbol::Unknown(kind) => trace!(kind, stream_offset, "skipping symbol"),
        }
        Ok(())
    }
}

struct LineLookup {
    sections: HashMap<u32, LineSection>,
    documents: HashMap<u32, usize>,
}

impl LineLookup {
    fn get(&self, offset: &u32) -> Option<&LineSection> {
        self.sections.get(offset)
    }
}

fn lines_source(lines: &LineLookup, file_id: u32) -> Result<&usize> {
    lines
        .documents
        .get(&file_id)
        .ok_or_else(|| malformed_error!("Line block references unknown file {}", file_id))
}

/// Decode a Windows PDB file.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] for damaged files and
/// [`crate::Error::ScopeMismatch`] for unbalanced symbol records.
pub fn read_legacy(data: &[u8]) -> Result<PdbInfo> {
    let msf = Msf::parse(data)?;
    let info_data = msf
        .stream(STREAM_PDB_INFO)
        .ok_or_else(|| malformed_error!("PDB info stream is missing"))?;
    let info_stream = read_info_stream(info_data)?;
    let named = |name: &str| {
        info_stream
            .named_streams
            .get(name)
            .and_then(|index| msf.stream(*index))
    };

    let names = match named(NAMES_STREAM) {
        Some(stream) => read_names_buffer(stream)?,
        None => &[],
    };

    let mut builder = PdbBuilder::new(info_stream.guid, info_stream.age, PdbFormat::Legacy);
    let dbi = msf
        .stream(STREAM_DBI)
        .ok_or_else(|| malformed_error!("DBI stream is missing"))?;

    for module in read_dbi_modules(dbi)? {
        if module.stream == NO_STREAM {
            continue;
        }
        let Some(stream) = msf.stream(u32::from(module.stream)) else {
            warn!(stream = module.stream, "module stream is missing");
            continue;
        };

        let symbol_end = module.symbol_bytes as usize;
        let c13_end = symbol_end
            .checked_add(module.c13_bytes as usize)
            .ok_or(OutOfBounds)?;
        let c13 = stream.get(symbol_end..c13_end).ok_or(OutOfBounds)?;

        let mut lookup = LineLookup {
            sections: HashMap::new(),
            documents: HashMap::new(),
        };
        for subsection in read_subsections(c13)? {
            match subsection {
                Subsection::FileChecksums(entries) => {
                    for (position, (file_id, entry)) in entries.into_iter().enumerate() {
                        let name = string_at(names, entry.name_offset)?;
                        let lowered = name.to_lowercase();
                        let file = named(&repeated_source_file_stream(&lowered, position))
                            .or_else(|| named(&format!("{SOURCE_FILES_PREFIX}{lowered}")));
                        let mut source = match file {
                            Some(file) => read_source_file(name, file)?,
                            None => fallback_source(name, &entry),
                        };
                        // The checksum table entry belongs to this document alone
                        if let Some(algorithm) = ChecksumAlgorithm::from_codeview_kind(entry.kind)
                        {
                            source.checksum_algorithm = algorithm.guid();
                            source.checksum = entry.checksum;
                        }
                        lookup
                            .documents
                            .insert(file_id, builder.define_document(source));
                    }
                }
                Subsection::Lines(section) => {
                    lookup.sections.insert(section.offset, section);
                }
                Subsection::Unknown(kind) => trace!(kind, "skipping C13 subsection"),
            }
        }

        let mut reader = ModuleReader {
            builder: &mut builder,
            frames: Vec::new(),
        };
        for (offset, symbol) in read_symbols(stream, 4, symbol_end)? {
            reader.symbol(offset, symbol, &lookup)?;
        }
        if !reader.frames.is_empty() {
            return Err(malformed_error!(
                "Module stream {} ends inside a procedure",
                module.stream
            ));
        }
    }

    if let Some(stream) = named(TOKEN_SOURCE_LINES_STREAM) {
        read_token_source_lines(stream, &mut builder)?;
    }
    if let Some(stream) = named(ENTRY_POINT_STREAM) {
        builder.set_entry_point(Token(Parser::new(stream).read_le::<u32>()?));
    }
    if let Some(stream) = named(SOURCE_SERVER_STREAM) {
        builder.set_source_server_data(String::from_utf8_lossy(stream).into_owned());
    }

    let info = builder.finish()?;
    debug!(
        functions = info.functions.len(),
        sources = info.sources.len(),
        "read legacy PDB"
    );
    Ok(info)
}

fn read_token_source_lines(stream: &[u8], builder: &mut PdbBuilder) -> Result<()> {
    for (_, symbol) in read_symbols(stream, 4, stream.len())? {
        let Symbol::Oem { name, data } = symbol else {
            continue;
        };
        if name != OEM_TOKEN_SOURCE_LINE {
            continue;
        }

        let mut parser = Parser::new(&data);
        let token = Token(parser.read_le::<u32>()?);
        let source = parser.read_le::<u32>()? as usize;
        let start_line = parser.read_le::<u32>()?;
        let start_column = parser.read_le::<u32>()? as u16;
        let end_line = parser.read_le::<u32>()?;
        let end_column = parser.read_le::<u32>()? as u16;
        builder.define_token_source_location(
            token,
            &SourceLocation {
                source,
                start_line,
                start_column,
                end_line,
                end_column,
            },
        )?;
    }
    Ok(())
}

fn write_scope(symbols: &mut SymbolWriter, scope: &PdbScope, base: u32) -> Result<()> {
    let record = symbols.write(&Symbol::Block(Block {
        end: 0,
        length: scope.length,
        offset: base + scope.offset,
        segment: CODE_SEGMENT,
    }))?;

    for namespace in &scope.used_namespaces {
        symbols.write(&Symbol::Namespace(namespace.clone()))?;
    }
    for slot in &scope.slots {
        symbols.write(&Symbol::Slot {
            index: slot.index,
            signature_token: slot.signature_token,
            flags: if slot.compiler_generated {
                SLOT_COMPILER_GENERATED
            } else {
                0
            },
            name: slot.name.clone(),
        })?;
    }
    for constant in &scope.constants {
        symbols.write(&Symbol::Constant {
            signature_token: constant.signature_token,
            value: constant.value.clone(),
            name: constant.name.clone(),
        })?;
    }
    for nested in &scope.scopes {
        write_scope(symbols, nested, base)?;
    }

    let end = symbols.write(&Symbol::End)?;
    symbols.patch_end(record, end)
}

fn write_function(symbols: &mut SymbolWriter, function: &PdbFunction, offset: u32) -> Result<()> {
    let record = symbols.write(&Symbol::ManagedProc(ManagedProc {
        end: 0,
        length: function.length,
        token: function.token,
        offset,
        segment: CODE_SEGMENT,
        name: String::new(),
    }))?;

    if function.iterator_class.is_some() || !function.iterator_scopes.is_empty() {
        symbols.write(&Symbol::Oem {
            name: OEM_MD2.to_string(),
            data: write_md2(&Md2 {
                iterator_class: function.iterator_class.clone(),
                iterator_scopes: function.iterator_scopes.clone(),
            })?,
        })?;
    }
    if let Some(async_info) = &function.async_info {
        symbols.write(&Symbol::Oem {
            name: OEM_ASYNC_METHOD_INFO.to_string(),
            data: write_async_method_info(async_info)?,
        })?;
    }
    for (name, data) in &function.custom_metadata {
        symbols.write(&Symbol::Oem {
            name: name.clone(),
            data: data.clone(),
        })?;
    }

    for scope in &function.scopes {
        write_scope(symbols, scope, offset)?;
    }

    let end = symbols.write(&Symbol::End)?;
    symbols.patch_end(record, end)
}

fn write_token_source_lines(info: &PdbInfo) -> Result<Option<Vec<u8>>> {
    let mut method_lines: HashMap<Token, usize> = HashMap::new();
    for function in &info.functions {
        *method_lines.entry(function.token).or_default() += function.line_count();
    }

    let mut tokens: Vec<&Token> = info.token_lines.keys().collect();
    tokens.sort();

    let mut symbols = SymbolWriter::new()?;
    let mut written = 0usize;
    for token in tokens {
        let skip = method_lines.get(token).copied().unwrap_or(0);
        for node in info.token_locations(*token).skip(skip) {
            let mut data = BinaryWriter::new();
            data.write_u32(node.token.value())?;
            data.write_u32(node.source as u32)?;
            data.write_u32(node.line)?;
            data.write_u32(u32::from(node.column))?;
            data.write_u32(node.end_line)?;
            data.write_u32(u32::from(node.end_column))?;
            symbols.write(&Symbol::Oem {
                name: OEM_TOKEN_SOURCE_LINE.to_string(),
                data: data.into_vec(),
            })?;
            written += 1;
        }
    }
    Ok((written > 0).then(|| symbols.into_vec()))
}

/// Serialize a model as a Windows PDB file.
///
/// The file identity comes from `info.guid` and `info.age`; `options` supplies the page size.
/// Reading the result with [`read_legacy`] yields `info` again, provided sequence point end
/// lines are at most 127 lines after their start. Documents sharing a name ignoring case stay
/// distinct: the first one owns `/src/files/<name>`, later ones get the position of the
/// document appended.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values the format can not hold, such as a checksum
/// longer than 255 bytes or an invalid page size.
pub fn write_legacy(info: &PdbInfo, options: &PdbWriterOptions) -> Result<Vec<u8>> {
    let mut msf = MsfWriter::new(options.page_size)?;
    for _ in 0..=STREAM_DBI {
        msf.add_stream(Vec::new());
    }
    msf.set_stream(STREAM_TPI, write_tpi_stream()?);

    let mut names = StringBuffer::new();
    let mut checksums = Vec::with_capacity(info.sources.len());
    for source in &info.sources {
        let known = source.algorithm();
        checksums.push(FileChecksum {
            name_offset: names.insert(&source.name),
            kind: known.map_or(0, |algorithm| algorithm.codeview_kind()),
            checksum: if known.is_some() {
                source.checksum.clone()
            } else {
                Vec::new()
            },
        });
    }

    let mut symbols = SymbolWriter::new()?;
    let mut c13 = BinaryWriter::new();
    let file_ids = if checksums.is_empty() {
        Vec::new()
    } else {
        write_file_checksums(&mut c13, &checksums)?
    };

    let mut address = 0u32;
    for function in &info.functions {
        write_function(&mut symbols, function, address)?;

        if !function.lines.is_empty() {
            let mut blocks = Vec::with_capacity(function.lines.len());
            for lines in &function.lines {
                let file_id = *file_ids.get(lines.source).ok_or(OutOfBounds)?;
                blocks.push(LineBlock {
                    file_id,
                    lines: lines.lines.clone(),
                });
            }
            write_lines(
                &mut c13,
                &LineSection {
                    offset: address,
                    segment: CODE_SEGMENT,
                    code_size: function.length,
                    blocks,
                },
            )?;
        }
        address += function.length.max(1);
    }

    let mut module = symbols.into_vec();
    let module_record = ModuleRecord {
        stream: 0,
        symbol_bytes: module.len() as u32,
        c13_bytes: c13.len() as u32,
    };
    module.extend_from_slice(c13.as_slice());
    module.extend_from_slice(&0u32.to_le_bytes());
    let module_stream = msf.add_stream(module);
    let module_record = ModuleRecord {
        stream: u16::try_from(module_stream).map_err(|_| OutOfBounds)?,
        ..module_record
    };

    let mut named_streams: Vec<(String, u32)> = Vec::new();
    let mut seen_files = HashSet::new();
    for (position, source) in info.sources.iter().enumerate() {
        let lowered = source.name.to_lowercase();
        let stream_name = if seen_files.insert(lowered.clone()) {
            format!("{SOURCE_FILES_PREFIX}{lowered}")
        } else {
            trace!(name = %source.name, position, "document name is not unique");
            repeated_source_file_stream(&lowered, position)
        };
        let index = msf.add_stream(write_source_file(source)?);
        named_streams.push((stream_name, index));
    }
    named_streams.push((NAMES_STREAM.to_string(), msf.add_stream(write_names_stream(&names)?)));

    if let Some(stream) = write_token_source_lines(info)? {
        named_streams.push((TOKEN_SOURCE_LINES_STREAM.to_string(), msf.add_stream(stream)));
    }
    if let Some(entry_point) = info.entry_point {
        named_streams.push((
            ENTRY_POINT_STREAM.to_string(),
            msf.add_stream(entry_point.value().to_le_bytes().to_vec()),
        ));
    }
    if let Some(script) = &info.source_server_data {
        named_streams.push((
            SOURCE_SERVER_STREAM.to_string(),
            msf.add_stream(script.as_bytes().to_vec()),
        ));
    }

    msf.set_stream(STREAM_PDB_INFO, write_info_stream(info, &named_streams)?);
    let file_names: Vec<&str> = info.sources.iter().map(|source| source.name.as_str()).collect();
    msf.set_stream(
        STREAM_DBI,
        write_dbi_stream(info.age, &module_record, address, &file_names)?,
    );

    debug!(
        functions = info.functions.len(),
        sources = info.sources.len(),
        page_size = options.page_size,
        "wrote legacy PDB"
    );
    msf.write()
}
