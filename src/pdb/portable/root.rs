//! Metadata root, stream directory and heaps of a portable PDB.
//!
//! # Reference
//! - ECMA-335 II.24.2.1 (metadata root), II.24.2.2 (stream header), II.24.2.3 - II.24.2.5
//!   (heaps)
//! - Portable PDB v1.0, "#Pdb stream"

use uguid::Guid;

use crate::{
    file::{
        io::{read_le, read_le_at},
        parser::Parser,
    },
    token::Token,
    Error::OutOfBounds,
    Result,
};

/// Signature of a metadata root, `BSJB`
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Position of one stream within the metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamHeader {
    pub offset: u32,
    pub size: u32,
    pub name: String,
}

/// The metadata root with its stream directory
pub(crate) struct MetadataRoot<'a> {
    data: &'a [u8],
    pub version: String,
    pub streams: Vec<StreamHeader>,
}

impl<'a> MetadataRoot<'a> {
    pub fn read(data: &'a [u8]) -> Result<MetadataRoot<'a>> {
        if data.len() < 20 {
            return Err(OutOfBounds);
        }
        let signature = read_le::<u32>(data)?;
        if signature != METADATA_SIGNATURE {
            return Err(malformed_error!(
                "Metadata signature does not match - 0x{:08X}",
                signature
            ));
        }

        let version_length = read_le_at::<u32>(data, &mut 12)? as usize;
        let version_end = 16usize
            .checked_add(version_length)
            .filter(|end| *end + 4 <= data.len())
            .ok_or(OutOfBounds)?;
        let version = String::from_utf8_lossy(&data[16..version_end])
            .trim_end_matches('\0')
            .to_string();

        let mut parser = Parser::new(data);
        parser.seek(version_end + 2)?;
        let stream_count = parser.read_le::<u16>()?;

        let mut streams = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;
            let name = parser.read_string_utf8()?;
            parser.align(4)?;

            let end = offset.checked_add(size).ok_or_else(|| {
                malformed_error!("Stream {} offset and size overflow", name)
            })?;
            if end as usize > data.len() {
                return Err(OutOfBounds);
            }
            streams.push(StreamHeader { offset, size, name });
        }

        Ok(MetadataRoot {
            data,
            version,
            streams,
        })
    }

    /// The content of the first stream called `name`
    pub fn stream(&self, name: &str) -> Option<&'a [u8]> {
        self.streams
            .iter()
            .find(|stream| stream.name == name)
            .and_then(|stream| {
                let start = stream.offset as usize;
                self.data.get(start..start + stream.size as usize)
            })
    }
}

/// The `#Strings`, `#Blob` and `#GUID` heaps
pub(crate) struct Heaps<'a> {
    pub strings: &'a [u8],
    pub blobs: &'a [u8],
    pub guids: &'a [u8],
}

impl<'a> Heaps<'a> {
    pub fn string(&self, index: u32) -> Result<String> {
        if index == 0 {
            return Ok(String::new());
        }
        let tail = self.strings.get(index as usize..).ok_or(OutOfBounds)?;
        Parser::new(tail).read_string_utf8()
    }

    pub fn blob(&self, index: u32) -> Result<&'a [u8]> {
        if index == 0 {
            return Ok(&[]);
        }
        let tail = self.blobs.get(index as usize..).ok_or(OutOfBounds)?;
        let mut parser = Parser::new(tail);
        let length = parser.read_compressed_uint()? as usize;
        let start = parser.pos();
        tail.get(start..start + length).ok_or(OutOfBounds)
    }

    /// The GUID at 1-based `index`; 0 is the nil GUID
    pub fn guid(&self, index: u32) -> Result<Guid> {
        if index == 0 {
            return Ok(Guid::ZERO);
        }
        let start = (index as usize - 1) * 16;
        let bytes = self.guids.get(start..start + 16).ok_or(OutOfBounds)?;
        Parser::new(bytes).read_guid()
    }
}

/// The `#Pdb` stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PdbStream {
    pub guid: Guid,
    pub stamp: u32,
    pub entry_point: Token,
    /// Row counts of the type system tables, by table id
    pub type_system_rows: [u32; 64],
}

impl PdbStream {
    pub fn read(data: &[u8]) -> Result<PdbStream> {
        let mut parser = Parser::new(data);
        let guid = parser.read_guid()?;
        let stamp = parser.read_le::<u32>()?;
        let entry_point = Token(parser.read_le::<u32>()?);
        let referenced = parser.read_le::<u64>()?;

        let mut type_system_rows = [0u32; 64];
        for (table, rows) in type_system_rows.iter_mut().enumerate() {
            if referenced & (1 << table) != 0 {
                *rows = parser.read_le::<u32>()?;
            }
        }

        Ok(PdbStream {
            guid,
            stamp,
            entry_point,
            type_system_rows,
        })
    }
}
