//! Portable PDB reader.
//!
//! A portable PDB is an ECMA-335 metadata file whose `#~` stream only carries the debug tables.
//! [`read_portable`] decodes those tables and replays them through a [`PdbBuilder`], so the
//! result has the same shape as a decoded legacy PDB:
//!
//! - documents keep their table order, row `n` becomes source index `n - 1`
//! - the `LocalScope` rows of a method are nested by containment
//! - import scopes become using strings on the scopes that introduce them
//! - async stepping and hoisted local scope records become [`PdbAsyncInfo`] and iterator scopes;
//!   other custom debug information on methods is kept as named blobs
//!
//! # Reference
//! - Portable PDB v1.0 specification

mod blobs;
mod root;
mod tables;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};
use uguid::{guid, Guid};

use crate::{
    pdb::{
        IteratorScope, PdbAsyncInfo, PdbBuilder, PdbConstant, PdbFormat, PdbInfo, PdbLine,
        PdbSlot, PdbSource, DOCUMENT_TYPE_TEXT, VENDOR_MICROSOFT,
    },
    token::Token,
    Result,
};

use self::{
    root::{Heaps, MetadataRoot, PdbStream},
    tables::{LocalScopeRow, Tables},
};

pub use self::root::METADATA_SIGNATURE;

/// Kind of the async method stepping information record
pub const ASYNC_METHOD_STEPPING_INFORMATION: Guid =
    guid!("54FD2AC5-E925-401A-9C2A-F94F171072F8");

/// Kind of the state machine hoisted local scopes record
pub const STATE_MACHINE_HOISTED_LOCAL_SCOPES: Guid =
    guid!("6DA9A61E-F8C7-4874-BE62-68BC5630DF71");

const LOCAL_VARIABLE_DEBUGGER_HIDDEN: u16 = 0x1;

/// Decode a portable PDB.
///
/// The module guid is the PDB id of the `#Pdb` stream and the age is always 1.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the metadata, a table
/// or a blob is inconsistent.
///
/// # Examples
///
/// ```rust,no_run
/// let data = std::fs::read("Program.pdb")?;
/// let info = dotsym::pdb::read_portable(&data)?;
/// for function in &info.functions {
///     println!("{} has {} sequence points", function.token, function.line_count());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn read_portable(data: &[u8]) -> Result<PdbInfo> {
    let root = MetadataRoot::read(data)?;
    let pdb = PdbStream::read(
        root.stream("#Pdb")
            .ok_or_else(|| malformed_error!("Portable PDB without #Pdb stream"))?,
    )?;
    let tables = Tables::read(
        root.stream("#~")
            .ok_or_else(|| malformed_error!("Portable PDB without #~ stream"))?,
        &pdb.type_system_rows,
    )?;
    let heaps = Heaps {
        strings: root.stream("#Strings").unwrap_or_default(),
        blobs: root.stream("#Blob").unwrap_or_default(),
        guids: root.stream("#GUID").unwrap_or_default(),
    };

    debug!(
        version = %root.version,
        documents = tables.documents.len(),
        methods = tables.methods.len(),
        scopes = tables.local_scopes.len(),
        "reading portable pdb"
    );

    let mut builder = PdbBuilder::new(pdb.guid, 1, PdbFormat::Portable);
    if !pdb.entry_point.is_null() {
        builder.set_entry_point(pdb.entry_point);
    }

    for row in &tables.documents {
        let mut source = PdbSource::new(blobs::document_name(heaps.blob(row.name)?, &heaps)?);
        source.language = heaps.guid(row.language)?;
        source.vendor = VENDOR_MICROSOFT;
        source.doc_type = DOCUMENT_TYPE_TEXT;
        source.checksum_algorithm = heaps.guid(row.hash_algorithm)?;
        source.checksum = heaps.blob(row.hash)?.to_vec();
        builder.define_document(source);
    }

    Converter {
        tables: &tables,
        heaps: &heaps,
        builder: &mut builder,
    }
    .methods()?;

    builder.finish()
}

/// Replays the per-method rows into the builder
struct Converter<'a> {
    tables: &'a Tables,
    heaps: &'a Heaps<'a>,
    builder: &'a mut PdbBuilder,
}

impl Converter<'_> {
    fn methods(&mut self) -> Result<()> {
        let mut scopes: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, scope) in self.tables.local_scopes.iter().enumerate() {
            scopes.entry(scope.method).or_default().push(index);
        }
        for (index, row) in self.tables.methods.iter().enumerate() {
            if row.sequence_points != 0 {
                scopes.entry(index as u32 + 1).or_default();
            }
        }

        let mut custom: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, row) in self.tables.custom_debug_information.iter().enumerate() {
            if row.parent.table() == Token::TABLE_METHOD_DEF {
                custom.entry(row.parent.row()).or_default().push(index);
                scopes.entry(row.parent.row()).or_default();
            } else {
                trace!(parent = %row.parent, "ignoring custom debug information");
            }
        }

        let kickoff: HashMap<u32, u32> = self
            .tables
            .state_machines
            .iter()
            .map(|row| (row.move_next_method, row.kickoff_method))
            .collect();

        for (method, scope_rows) in scopes {
            if method == 0 {
                continue;
            }
            let token = Token::from_parts(Token::TABLE_METHOD_DEF, method);
            self.builder.open_method(token)?;

            let local_signature = self.sequence_points(method)?;
            let length = self.scopes(&scope_rows, local_signature)?;

            for index in custom.get(&method).into_iter().flatten() {
                self.custom_debug_information(*index, token, kickoff.get(&method).copied())?;
            }

            self.builder.close_method(length)?;
        }
        Ok(())
    }

    /// Define the sequence points of `method` and return its local signature token
    fn sequence_points(&mut self, method: u32) -> Result<Token> {
        let Some(row) = self.tables.methods.get(method as usize - 1) else {
            return Ok(Token(0));
        };
        if row.sequence_points == 0 {
            return Ok(Token(0));
        }

        let decoded =
            blobs::sequence_points(self.heaps.blob(row.sequence_points)?, row.document)?;

        let mut runs: Vec<(u32, Vec<PdbLine>)> = Vec::new();
        for (document, line) in decoded.points {
            match runs.last_mut() {
                Some((current, lines)) if *current == document => lines.push(line),
                _ => runs.push((document, vec![line])),
            }
        }
        for (document, lines) in runs {
            if document == 0 || document as usize > self.tables.documents.len() {
                return Err(malformed_error!(
                    "Sequence points of method {} reference document {}",
                    method,
                    document
                ));
            }
            self.builder
                .define_sequence_points(document as usize - 1, lines)?;
        }

        Ok(if decoded.local_signature == 0 {
            Token(0)
        } else {
            Token::from_parts(Token::TABLE_STANDALONE_SIG, decoded.local_signature)
        })
    }

    /// Nest the scopes of one method and return the IL length they cover
    fn scopes(&mut self, rows: &[usize], local_signature: Token) -> Result<u32> {
        let tables = self.tables;
        let mut ordered: Vec<(usize, &LocalScopeRow)> = rows
            .iter()
            .map(|index| (*index, &tables.local_scopes[*index]))
            .collect();
        ordered.sort_by(|(_, a), (_, b)| {
            a.start_offset
                .cmp(&b.start_offset)
                .then(b.length.cmp(&a.length))
        });

        let mut open: Vec<(u32, u32, u32)> = Vec::new();
        let mut length = 0u32;
        for (index, scope) in ordered {
            let end = scope
                .start_offset
                .checked_add(scope.length)
                .ok_or_else(|| malformed_error!("Local scope {} overflows", index + 1))?;
            length = length.max(end);

            while let Some((start, top_end, _)) = open.last().copied() {
                if scope.start_offset >= start && end <= top_end {
                    break;
                }
                self.builder.close_scope(top_end)?;
                open.pop();
            }

            self.builder.open_scope(scope.start_offset)?;
            let parent_imports = open.last().map(|(_, _, imports)| *imports);
            if parent_imports != Some(scope.import_scope) {
                self.imports(scope.import_scope, parent_imports.unwrap_or(0))?;
            }
            self.variables(index, local_signature)?;
            self.constants(index)?;
            open.push((scope.start_offset, end, scope.import_scope));
        }

        while let Some((_, end, _)) = open.pop() {
            self.builder.close_scope(end)?;
        }
        Ok(length)
    }

    /// Add the using strings of the import scope chain from `import_scope` up to `stop`
    fn imports(&mut self, import_scope: u32, stop: u32) -> Result<()> {
        let mut current = import_scope;
        let mut remaining = self.tables.import_scopes.len();
        while current != 0 && current != stop {
            let row = self
                .tables
                .import_scopes
                .get(current as usize - 1)
                .ok_or_else(|| malformed_error!("Invalid import scope {}", current))?;
            if remaining == 0 {
                return Err(malformed_error!("Import scope {} has a cyclic parent", current));
            }
            remaining -= 1;

            for using in blobs::imports(self.heaps.blob(row.imports)?, self.heaps)? {
                self.builder.using_namespace(using)?;
            }
            current = row.parent;
        }
        Ok(())
    }

    fn variables(&mut self, scope: usize, local_signature: Token) -> Result<()> {
        let range = Tables::list_range(
            self.tables.local_scopes[scope].variable_list,
            self.tables
                .local_scopes
                .get(scope + 1)
                .map(|next| next.variable_list),
            self.tables.local_variables.len(),
        );
        for row in &self.tables.local_variables[range] {
            self.builder.define_local_variable(PdbSlot {
                index: u32::from(row.index),
                name: self.heaps.string(row.name)?,
                compiler_generated: row.attributes & LOCAL_VARIABLE_DEBUGGER_HIDDEN != 0,
                signature_token: local_signature,
            })?;
        }
        Ok(())
    }

    fn constants(&mut self, scope: usize) -> Result<()> {
        let range = Tables::list_range(
            self.tables.local_scopes[scope].constant_list,
            self.tables
                .local_scopes
                .get(scope + 1)
                .map(|next| next.constant_list),
            self.tables.local_constants.len(),
        );
        for row in &self.tables.local_constants[range] {
            let name = self.heaps.string(row.name)?;
            match blobs::constant(self.heaps.blob(row.signature)?)? {
                Some(value) => self.builder.define_local_constant(PdbConstant {
                    name,
                    signature_token: Token(0),
                    value,
                })?,
                None => debug!(name = %name, "constant has no symbol store encoding"),
            }
        }
        Ok(())
    }

    fn custom_debug_information(
        &mut self,
        index: usize,
        token: Token,
        kickoff: Option<u32>,
    ) -> Result<()> {
        let row = &self.tables.custom_debug_information[index];
        let kind = self.heaps.guid(row.kind)?;
        let value = self.heaps.blob(row.value)?;

        if kind == ASYNC_METHOD_STEPPING_INFORMATION {
            let stepping = blobs::async_stepping(value)?;
            let move_next_method = stepping
                .steps
                .first()
                .map_or(token, |(_, _, method)| {
                    Token::from_parts(Token::TABLE_METHOD_DEF, *method)
                });
            self.builder.set_async_info(PdbAsyncInfo {
                kickoff_method: kickoff
                    .map_or(token, |row| Token::from_parts(Token::TABLE_METHOD_DEF, row)),
                catch_handler_offset: stepping.catch_handler_offset,
                yield_offsets: stepping.steps.iter().map(|step| step.0).collect(),
                resume_offsets: stepping.steps.iter().map(|step| step.1).collect(),
                move_next_method,
            })
        } else if kind == STATE_MACHINE_HOISTED_LOCAL_SCOPES {
            let scopes: Vec<IteratorScope> = blobs::hoisted_scopes(value)?;
            self.builder.set_iterator_info(None, scopes)
        } else {
            self.builder
                .add_custom_metadata(kind.to_string(), value.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pdb::{ChecksumAlgorithm, PdbConstantValue, LANGUAGE_CSHARP},
        test::PortablePdbBuilder,
    };

    const PDB_ID: Guid = guid!("0c1d2e3f-4a5b-6c7d-8e9f-a0b1c2d3e4f5");

    fn sample() -> Vec<u8> {
        let mut pdb = PortablePdbBuilder::new(PDB_ID, 4).entry_point(0x0600_0001);
        pdb.document(
            "Program.cs",
            ChecksumAlgorithm::Sha1.guid(),
            &[0xAB; 20],
            LANGUAGE_CSHARP,
        );
        pdb.document("Other.cs", Guid::ZERO, &[], LANGUAGE_CSHARP);

        // Method 1: two points in document 1, then one in document 2
        pdb.method(
            1,
            &[
                0x03, 0x00, 0x00, 0x05, 0x0A, 0x03, 0x04, 0x01, 0x02, 0x02, 0x02, 0x00, 0x02,
                0x02, 0x00, 0x04, 0x02, 0x02,
            ],
        );
        // Methods 2 and 3 have no sequence points
        pdb.method(0, &[]);
        pdb.method(0, &[]);

        let system = pdb.blob(b"System");
        let linq = pdb.blob(b"System.Linq");
        pdb.import_scope(0, &[0x01, system as u8]);
        pdb.import_scope(1, &[0x01, linq as u8]);

        // Method 1: root [0, 12) and a nested block [4, 8) with its own import scope
        pdb.scope(1, 1, 1, 1, 0, 12);
        pdb.scope(1, 2, 3, 2, 4, 4);
        // Method 3: a single scope
        pdb.scope(3, 1, 4, 3, 0, 6);

        pdb.variable(0, 0, "count");
        pdb.variable(1, 1, "CS$<>8__locals0");
        pdb.variable(0, 2, "item");
        pdb.constant("Answer", &[0x08, 0x2A, 0x00, 0x00, 0x00]);
        pdb.constant("Price", &[0x11, 0x05, 1, 2, 3, 4]);

        let mut stepping = 0u32.to_le_bytes().to_vec();
        stepping.extend_from_slice(&2u32.to_le_bytes());
        stepping.extend_from_slice(&5u32.to_le_bytes());
        stepping.push(0x03);
        pdb.state_machine(3, 2);
        pdb.method_debug_information(3, ASYNC_METHOD_STEPPING_INFORMATION, &stepping);
        let mut hoisted = 0u32.to_le_bytes().to_vec();
        hoisted.extend_from_slice(&6u32.to_le_bytes());
        pdb.method_debug_information(3, STATE_MACHINE_HOISTED_LOCAL_SCOPES, &hoisted);
        pdb.method_debug_information(
            3,
            guid!("a643004c-0240-496f-a783-30d64f4979de"),
            &[1, 2, 3],
        );
        pdb.build()
    }

    #[test]
    fn documents_and_identity() {
        let info = read_portable(&sample()).unwrap();
        assert_eq!(info.format, PdbFormat::Portable);
        assert_eq!(info.guid, PDB_ID);
        assert_eq!(info.age, 1);
        assert_eq!(info.entry_point, Some(Token(0x0600_0001)));

        assert_eq!(info.sources.len(), 2);
        assert_eq!(info.sources[0].name, "Program.cs");
        assert_eq!(info.sources[0].algorithm(), Some(ChecksumAlgorithm::Sha1));
        assert_eq!(info.sources[0].checksum, vec![0xAB; 20]);
        assert_eq!(info.sources[1].name, "Other.cs");
        assert!(info.sources[1].checksum.is_empty());
        assert_eq!(info.sources[1].language, LANGUAGE_CSHARP);
        assert_eq!(info.sources[1].vendor, VENDOR_MICROSOFT);
    }

    #[test]
    fn sequence_points_by_document() {
        let info = read_portable(&sample()).unwrap();
        let function = info.function(Token(0x0600_0001)).unwrap();
        assert_eq!(function.lines.len(), 2);
        assert_eq!(function.lines[0].source, 0);
        assert_eq!(function.lines[0].lines.len(), 2);
        assert_eq!(function.lines[0].lines[0].line_begin, 10);
        assert_eq!(function.lines[0].lines[1].offset, 4);
        assert_eq!(function.lines[0].lines[1].line_begin, 11);
        assert_eq!(function.lines[1].source, 1);
        assert_eq!(function.lines[1].lines[0].offset, 6);
        assert_eq!(function.lines[1].lines[0].line_begin, 12);
        assert_eq!(info.token_locations(Token(0x0600_0001)).count(), 3);
    }

    #[test]
    fn scopes_are_nested() {
        let info = read_portable(&sample()).unwrap();
        let function = info.function(Token(0x0600_0001)).unwrap();
        assert_eq!(function.length, 12);
        assert_eq!(function.scopes.len(), 1);

        let root = &function.scopes[0];
        assert_eq!((root.offset, root.length), (0, 12));
        assert_eq!(root.used_namespaces, vec!["USystem".to_string()]);
        assert_eq!(root.slots.len(), 2);
        assert_eq!(root.slots[0].name, "count");
        assert_eq!(root.slots[0].signature_token, Token(0x1100_0003));
        assert!(root.slots[1].compiler_generated);
        assert_eq!(root.constants.len(), 1);
        assert_eq!(root.constants[0].value, PdbConstantValue::I32(42));

        let nested = &root.scopes[0];
        assert_eq!((nested.offset, nested.length), (4, 4));
        assert_eq!(nested.used_namespaces, vec!["USystem.Linq".to_string()]);
        assert_eq!(nested.slots[0].name, "item");
        assert!(nested.constants.is_empty());
    }

    #[test]
    fn state_machine_information() {
        let info = read_portable(&sample()).unwrap();
        assert!(info.function(Token(0x0600_0002)).is_none());

        let function = info.function(Token(0x0600_0003)).unwrap();
        assert_eq!(function.length, 6);
        assert!(function.lines.is_empty());
        assert_eq!(function.scopes[0].slots.len(), 0);
        assert_eq!(function.scopes[0].used_namespaces, vec!["USystem".to_string()]);

        let async_info = function.async_info.as_ref().unwrap();
        assert_eq!(async_info.kickoff_method, Token(0x0600_0002));
        assert_eq!(async_info.move_next_method, Token(0x0600_0003));
        assert_eq!(async_info.catch_handler_offset, None);
        assert_eq!(async_info.yield_offsets, vec![2]);
        assert_eq!(async_info.resume_offsets, vec![5]);

        assert_eq!(
            function.iterator_scopes,
            vec![IteratorScope {
                offset: 0,
                length: 6
            }]
        );
        assert_eq!(function.custom_metadata.len(), 1);
        assert_eq!(
            function.custom_metadata[0].0,
            "a643004c-0240-496f-a783-30d64f4979de"
        );
        assert_eq!(function.custom_metadata[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_non_metadata() {
        assert!(read_portable(b"Microsoft C/C++ MSF 7.00\r\n").is_err());
        assert!(read_portable(&[]).is_err());
    }
}
