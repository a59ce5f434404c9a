//! PE image access for symbol discovery and method body lookup.
//!
//! This module abstracts over where a .NET image lives (a memory-mapped file on disk or an owned
//! buffer) and exposes the few PE structures this crate needs: sections for address translation,
//! the CLR runtime header, and the debug directory that links an image to its symbol file.
//!
//! # Key Components
//!
//! - [`crate::file::File`] - Parsed PE image with address translation
//! - [`crate::file::Backend`] - Trait for different data sources
//! - [`crate::file::DebugDirectoryEntry`] - One `IMAGE_DEBUG_DIRECTORY` record
//! - [`crate::file::CodeViewInfo`] - The `RSDS` record naming the associated PDB
//! - [`crate::file::parser::Parser`] - Cursor based decoding of binary structures
//! - [`crate::file::io`] - Low-level little-endian readers
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotsym::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("Sample.dll"))?;
//! if let Some(codeview) = file.codeview()? {
//!     println!("{} (age {})", codeview.path, codeview.age);
//! }
//! # Ok::<(), dotsym::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{
    assembly::MethodBody,
    file::io::read_le_at,
    Error::{Empty, GoblinErr},
    Result,
};
use goblin::pe::{section_table::SectionTable, PE};
use memory::Memory;
use ouroboros::self_referencing;
use physical::Physical;
use tracing::{debug, warn};

/// `IMAGE_DEBUG_TYPE_CODEVIEW`
pub const DEBUG_TYPE_CODEVIEW: u32 = 2;
/// `IMAGE_DEBUG_TYPE_REPRO`
pub const DEBUG_TYPE_REPRO: u32 = 16;
/// Embedded, deflate compressed portable PDB
pub const DEBUG_TYPE_EMBEDDED_PORTABLE_PDB: u32 = 17;
/// `IMAGE_DEBUG_TYPE_PDBCHECKSUM`
pub const DEBUG_TYPE_PDB_CHECKSUM: u32 = 19;

pub(crate) const CODEVIEW_RSDS: u32 = 0x5344_5352;
const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;

/// Data source of a [`File`]
pub trait Backend: Send + Sync {
    /// Borrow `len` bytes at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not inside the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// The complete data
    fn data(&self) -> &[u8];

    /// Length of the data
    fn len(&self) -> usize;
}

/// One entry of the PE debug directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugDirectoryEntry {
    /// `TimeDateStamp`
    pub timestamp: u32,
    /// `MajorVersion`; `0x0100` or higher marks a portable PDB for CodeView entries
    pub major_version: u16,
    /// `MinorVersion`; `0x504D` ("PM") for portable PDBs
    pub minor_version: u16,
    /// `Type`, one of the `DEBUG_TYPE_*` constants
    pub kind: u32,
    /// `SizeOfData`
    pub size_of_data: u32,
    /// `AddressOfRawData`
    pub address_of_raw_data: u32,
    /// `PointerToRawData`
    pub pointer_to_raw_data: u32,
}

/// The `RSDS` CodeView record that ties an image to its PDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeViewInfo {
    /// PDB signature
    pub guid: uguid::Guid,
    /// PDB age
    pub age: u32,
    /// Path of the PDB as recorded by the compiler
    pub path: String,
    /// True if the debug directory marks the PDB as portable
    pub portable: bool,
}

/// A parsed PE image.
#[self_referencing]
pub struct File {
    data: Box<dyn Backend>,
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl File {
    /// Map and parse the image at `file`.
    ///
    /// # Errors
    /// Returns an error if the file can not be read or is not a .NET PE image.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Parse an image held in memory.
    ///
    /// # Errors
    /// Returns an error if the data is not a .NET PE image.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let data = Box::new(data);

        File::try_new(data, |data| {
            let data = data.as_ref();
            match PE::parse(data.data()) {
                Ok(pe) => match pe.header.optional_header {
                    Some(optional_header) => {
                        if optional_header
                            .data_directories
                            .get_clr_runtime_header()
                            .is_none()
                        {
                            Err(malformed_error!(
                                "File does not have a CLR runtime header directory"
                            ))
                        } else {
                            Ok(pe)
                        }
                    }
                    None => Err(malformed_error!("File does not have an OptionalHeader")),
                },
                Err(error) => Err(GoblinErr(error)),
            }
        })
    }

    /// Size of the image in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// True if the image holds no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw image bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.with_data(|data| data.data())
    }

    /// Borrow `len` bytes at file offset `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range lies outside the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.with_data(|data| data.data_slice(offset, len))
    }

    /// Section headers of the image
    pub fn sections(&self) -> impl Iterator<Item = &SectionTable> {
        self.with_pe(|pe| pe.sections.iter())
    }

    /// RVA and size of the CLR runtime header
    #[must_use]
    pub fn clr(&self) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            let optional_header = pe.header.optional_header.as_ref()?;
            let clr_dir = optional_header.data_directories.get_clr_runtime_header();
            clr_dir
                .as_ref()
                .map(|dir| (dir.virtual_address, dir.size))
        })
    }

    /// RVA and size of the debug directory, if the image has one
    #[must_use]
    pub fn debug_table(&self) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            let optional_header = pe.header.optional_header.as_ref()?;
            let debug_dir = optional_header.data_directories.get_debug_table();
            debug_dir
                .as_ref()
                .map(|dir| (dir.virtual_address, dir.size))
                .filter(|(rva, size)| *rva != 0 && *size != 0)
        })
    }

    /// Translate a relative virtual address into a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section contains `rva`.
    pub fn rva_to_offset(&self, rva: usize) -> Result<usize> {
        let rva_u32 = u32::try_from(rva)
            .map_err(|_| malformed_error!("RVA too large to fit in u32: {}", rva))?;

        for section in self.sections() {
            let Some(section_max) = section.virtual_address.checked_add(
                section.virtual_size.max(section.size_of_raw_data),
            ) else {
                return Err(malformed_error!(
                    "Section malformed, causing integer overflow - {} + {}",
                    section.virtual_address,
                    section.virtual_size
                ));
            };

            if section.virtual_address <= rva_u32 && section_max > rva_u32 {
                return Ok((rva - section.virtual_address as usize)
                    + section.pointer_to_raw_data as usize);
            }
        }

        Err(malformed_error!(
            "RVA could not be converted to offset - {:#x}",
            rva
        ))
    }

    /// Decode every entry of the PE debug directory.
    ///
    /// An image without a debug directory yields an empty list.
    ///
    /// # Errors
    /// Returns an error if the directory lies outside the image.
    pub fn debug_directory(&self) -> Result<Vec<DebugDirectoryEntry>> {
        let Some((rva, size)) = self.debug_table() else {
            return Ok(Vec::new());
        };

        let offset = self.rva_to_offset(rva as usize)?;
        let data = self.data_slice(offset, size as usize)?;

        let mut entries = Vec::with_capacity(data.len() / DEBUG_DIRECTORY_ENTRY_SIZE);
        let mut cursor = 0_usize;
        while cursor + DEBUG_DIRECTORY_ENTRY_SIZE <= data.len() {
            let _characteristics = read_le_at::<u32>(data, &mut cursor)?;
            entries.push(DebugDirectoryEntry {
                timestamp: read_le_at::<u32>(data, &mut cursor)?,
                major_version: read_le_at::<u16>(data, &mut cursor)?,
                minor_version: read_le_at::<u16>(data, &mut cursor)?,
                kind: read_le_at::<u32>(data, &mut cursor)?,
                size_of_data: read_le_at::<u32>(data, &mut cursor)?,
                address_of_raw_data: read_le_at::<u32>(data, &mut cursor)?,
                pointer_to_raw_data: read_le_at::<u32>(data, &mut cursor)?,
            });
        }

        debug!(count = entries.len(), "decoded debug directory");
        Ok(entries)
    }

    /// The first `RSDS` CodeView record of the debug directory.
    ///
    /// Embedded portable PDBs are deflate compressed and are not decoded; their presence is
    /// only logged.
    ///
    /// # Errors
    /// Returns an error if the record is truncated or its path is not UTF-8.
    pub fn codeview(&self) -> Result<Option<CodeViewInfo>> {
        let entries = self.debug_directory()?;

        if entries
            .iter()
            .any(|entry| entry.kind == DEBUG_TYPE_EMBEDDED_PORTABLE_PDB)
        {
            warn!("image carries an embedded portable PDB, which is not supported");
        }

        let Some(entry) = entries
            .iter()
            .find(|entry| entry.kind == DEBUG_TYPE_CODEVIEW)
        else {
            return Ok(None);
        };

        let data = self.data_slice(
            entry.pointer_to_raw_data as usize,
            entry.size_of_data as usize,
        )?;
        let mut parser = parser::Parser::new(data);
        if parser.read_le::<u32>()? != CODEVIEW_RSDS {
            debug!("CodeView record is not RSDS");
            return Ok(None);
        }

        let guid = parser.read_guid()?;
        let age = parser.read_le::<u32>()?;
        let path = parser.read_string_utf8()?;

        Ok(Some(CodeViewInfo {
            guid,
            age,
            path,
            portable: entry.major_version >= 0x0100 && entry.minor_version == 0x504D,
        }))
    }

    /// Decode the method body stored at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the body is malformed.
    pub fn method_body(&self, rva: u32) -> Result<MethodBody> {
        let offset = self.rva_to_offset(rva as usize)?;
        let data = self.data();
        let body = data
            .get(offset..)
            .ok_or(crate::Error::OutOfBounds)?;

        MethodBody::parse(body)
    }
}
