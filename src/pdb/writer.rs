//! Method-at-a-time symbol writing.
//!
//! [`PdbWriter`] is the interface code generators talk to while they emit a module: one
//! `open_method` / `close_method` bracket per method with scopes, locals and sequence points in
//! between. [`LegacyPdbWriter`] collects everything and produces a Windows PDB file on
//! [`LegacyPdbWriter::finish`], and [`emit_function`] replays an already decoded
//! [`PdbFunction`] through any writer.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::pdb::{LegacyPdbWriter, PdbSource, PdbWriter, PdbWriterOptions, SourceLocation};
//! use dotsym::token::Token;
//!
//! let mut writer = LegacyPdbWriter::new(PdbWriterOptions::default());
//! let source = writer.define_document(PdbSource::new("Program.cs"));
//!
//! writer.open_method(Token(0x0600_0001))?;
//! writer.define_sequence_point(
//!     &SourceLocation { source, start_line: 3, start_column: 9, end_line: 3, end_column: 20 },
//!     0,
//! )?;
//! writer.define_local_variable(0, "count", false, Token(0x1100_0001))?;
//! writer.close_method(6)?;
//!
//! let pdb = writer.finish()?;
//! assert!(pdb.starts_with(b"Microsoft C/C++ MSF 7.00"));
//! # Ok::<(), dotsym::Error>(())
//! ```

use tracing::trace;
use uguid::Guid;

use crate::{
    file::{DebugDirectoryEntry, CODEVIEW_RSDS, DEBUG_TYPE_CODEVIEW},
    pdb::{
        codeview::{
            read_async_method_info, read_md2, write_async_method_info, write_md2, Md2,
            OEM_ASYNC_METHOD_INFO, OEM_MD2,
        },
        write_legacy, PdbBuilder, PdbConstant, PdbConstantValue, PdbFormat, PdbFunction, PdbInfo,
        PdbLine, PdbScope, PdbSlot, PdbSource, SourceLocation,
    },
    token::Token,
    writer::BinaryWriter,
    Error, Result,
};

/// Settings of a [`LegacyPdbWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbWriterOptions {
    /// MSF page size: 512, 1024, 2048 or 4096
    pub page_size: u32,
    /// Signature shared with the image's CodeView record
    pub guid: Guid,
    /// Age shared with the image's CodeView record
    pub age: u32,
    /// Path recorded in the CodeView record
    pub pdb_path: String,
    /// Source server script stored in the `srcsrv` stream
    pub source_server_data: Option<String>,
}

impl PdbWriterOptions {
    /// Options for a PDB with the given identity and path
    #[must_use]
    pub fn new(guid: Guid, age: u32, pdb_path: impl Into<String>) -> Self {
        PdbWriterOptions {
            guid,
            age,
            pdb_path: pdb_path.into(),
            ..PdbWriterOptions::default()
        }
    }
}

impl Default for PdbWriterOptions {
    fn default() -> Self {
        PdbWriterOptions {
            page_size: 1024,
            guid: Guid::ZERO,
            age: 1,
            pdb_path: String::new(),
            source_server_data: None,
        }
    }
}

/// A debug directory entry together with the data it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeDebugDirectory {
    /// `Characteristics`, reserved
    pub characteristics: u32,
    /// The directory entry. The raw data address and pointer are left for the image writer.
    pub entry: DebugDirectoryEntry,
    /// The record the entry points at
    pub data: Vec<u8>,
}

impl PeDebugDirectory {
    /// A CodeView entry referencing a PDB by signature, age and path
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn codeview(guid: &Guid, age: u32, path: &str) -> Result<Self> {
        let mut data = BinaryWriter::new();
        data.write_u32(CODEVIEW_RSDS)?;
        data.write_guid(guid)?;
        data.write_u32(age)?;
        data.write_string(Some(path), true)?;
        let data = data.into_vec();

        Ok(PeDebugDirectory {
            characteristics: 0,
            entry: DebugDirectoryEntry {
                timestamp: 0,
                major_version: 0,
                minor_version: 0,
                kind: DEBUG_TYPE_CODEVIEW,
                size_of_data: data.len() as u32,
                address_of_raw_data: 0,
                pointer_to_raw_data: 0,
            },
            data,
        })
    }

    /// The 28-byte `IMAGE_DEBUG_DIRECTORY` entry
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn header_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        writer.write_u32(self.characteristics)?;
        writer.write_u32(self.entry.timestamp)?;
        writer.write_u16(self.entry.major_version)?;
        writer.write_u16(self.entry.minor_version)?;
        writer.write_u32(self.entry.kind)?;
        writer.write_u32(self.entry.size_of_data)?;
        writer.write_u32(self.entry.address_of_raw_data)?;
        writer.write_u32(self.entry.pointer_to_raw_data)?;
        Ok(writer.into_vec())
    }
}

/// Receives the debug information of a module one method at a time.
///
/// Every method is bracketed by [`PdbWriter::open_method`] and [`PdbWriter::close_method`];
/// the method's root scope is implicit. Token source locations outside of methods must be
/// bracketed by the token source location scope calls.
pub trait PdbWriter {
    /// Register a document and return the index used in [`SourceLocation::source`]. Defining an
    /// equal document again returns the existing index.
    fn define_document(&mut self, source: PdbSource) -> usize;

    /// Start a method; this also opens its root scope at offset 0.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if a method is already open.
    fn open_method(&mut self, token: Token) -> Result<()>;

    /// Close the root scope at `offset` and finish the method.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no method is open or nested scopes are still open.
    fn close_method(&mut self, offset: u32) -> Result<()>;

    /// Open a nested scope.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    fn open_scope(&mut self, offset: u32) -> Result<()>;

    /// Close the innermost nested scope.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if only the root scope is open.
    fn close_scope(&mut self, offset: u32) -> Result<()>;

    /// Declare a local in the innermost scope.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    fn define_local_variable(
        &mut self,
        index: u32,
        name: &str,
        compiler_generated: bool,
        signature_token: Token,
    ) -> Result<()>;

    /// Declare a constant in the innermost scope.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    fn define_local_constant(
        &mut self,
        name: &str,
        value: PdbConstantValue,
        signature_token: Token,
    ) -> Result<()>;

    /// Map the code at `offset` to `location`.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method and [`Error::OutOfBounds`] for an
    /// undefined document.
    fn define_sequence_point(&mut self, location: &SourceLocation, offset: u32) -> Result<()>;

    /// Import a namespace into the innermost scope.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    fn using_namespace(&mut self, name: &str) -> Result<()>;

    /// Set the entry point method.
    ///
    /// # Errors
    /// Implementations may reject the token.
    fn set_entry_point(&mut self, token: Token) -> Result<()>;

    /// Attach a named compiler blob to the open method.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method, or a decoding error for a
    /// malformed well-known blob.
    fn define_custom_metadata(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Record a source location for a token such as a field or type.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a token source location scope.
    fn define_token_source_location(
        &mut self,
        token: Token,
        location: &SourceLocation,
    ) -> Result<()>;

    /// Start a run of [`PdbWriter::define_token_source_location`] calls.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if a run is already open.
    fn open_token_source_locations_scope(&mut self) -> Result<()>;

    /// End a run of token source locations.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no run is open.
    fn close_token_source_locations_scope(&mut self) -> Result<()>;

    /// The CodeView debug directory entry the image must carry to find this PDB.
    ///
    /// # Errors
    /// Returns an error if the entry can not be encoded.
    fn debug_directory(&self) -> Result<PeDebugDirectory>;
}

struct OpenMethod {
    token: Token,
    depth: usize,
    root_open: bool,
    runs: Vec<(usize, Vec<PdbLine>)>,
}

/// A [`PdbWriter`] producing a Windows PDB file.
pub struct LegacyPdbWriter {
    options: PdbWriterOptions,
    builder: PdbBuilder,
    documents: Vec<PdbSource>,
    method: Option<OpenMethod>,
    in_token_scope: bool,
}

impl LegacyPdbWriter {
    /// A writer for a PDB identified by `options`
    #[must_use]
    pub fn new(options: PdbWriterOptions) -> Self {
        let mut builder = PdbBuilder::new(options.guid, options.age, PdbFormat::Legacy);
        if let Some(script) = &options.source_server_data {
            builder.set_source_server_data(script.clone());
        }
        LegacyPdbWriter {
            options,
            builder,
            documents: Vec::new(),
            method: None,
            in_token_scope: false,
        }
    }

    fn current(&mut self, operation: &str) -> Result<&mut OpenMethod> {
        self.method
            .as_mut()
            .ok_or_else(|| Error::ScopeMismatch(format!("{operation} outside of a method")))
    }

    /// Opens the root scope on first use so methods without locals carry no scopes.
    fn ensure_root(&mut self, operation: &str) -> Result<()> {
        let method = self.current(operation)?;
        if !method.root_open {
            method.root_open = true;
            self.builder.open_scope(0)?;
        }
        Ok(())
    }

    /// The collected model.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if a method or token source location scope is open.
    pub fn into_info(self) -> Result<PdbInfo> {
        if let Some(method) = &self.method {
            return Err(Error::ScopeMismatch(format!(
                "method {} still open",
                method.token
            )));
        }
        if self.in_token_scope {
            return Err(Error::ScopeMismatch(
                "token source location scope still open".into(),
            ));
        }
        self.builder.finish()
    }

    /// Serialize the collected information.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] for unbalanced calls and the errors of
    /// [`write_legacy`].
    pub fn finish(self) -> Result<Vec<u8>> {
        let options = self.options.clone();
        let info = self.into_info()?;
        write_legacy(&info, &options)
    }
}

impl PdbWriter for LegacyPdbWriter {
    fn define_document(&mut self, source: PdbSource) -> usize {
        if let Some(index) = self.documents.iter().position(|known| *known == source) {
            return index;
        }
        self.documents.push(source.clone());
        self.builder.define_document(source)
    }

    fn open_method(&mut self, token: Token) -> Result<()> {
        self.builder.open_method(token)?;
        self.method = Some(OpenMethod {
            token,
            depth: 1,
            root_open: false,
            runs: Vec::new(),
        });
        Ok(())
    }

    fn close_method(&mut self, offset: u32) -> Result<()> {
        let method = self.current("close_method")?;
        if method.depth > 1 {
            return Err(Error::ScopeMismatch(format!(
                "method {} closed with {} open scopes",
                method.token,
                method.depth - 1
            )));
        }

        let runs = std::mem::take(&mut method.runs);
        let root_open = method.root_open;
        for (source, lines) in runs {
            self.builder.define_sequence_points(source, lines)?;
        }
        if root_open {
            self.builder.close_scope(offset)?;
        }
        self.builder.close_method(offset)?;
        self.method = None;
        Ok(())
    }

    fn open_scope(&mut self, offset: u32) -> Result<()> {
        self.ensure_root("open_scope")?;
        self.builder.open_scope(offset)?;
        self.current("open_scope")?.depth += 1;
        Ok(())
    }

    fn close_scope(&mut self, offset: u32) -> Result<()> {
        let method = self.current("close_scope")?;
        if method.depth <= 1 {
            return Err(Error::ScopeMismatch(
                "close_scope would close the root scope".into(),
            ));
        }
        method.depth -= 1;
        self.builder.close_scope(offset)
    }

    fn define_local_variable(
        &mut self,
        index: u32,
        name: &str,
        compiler_generated: bool,
        signature_token: Token,
    ) -> Result<()> {
        self.ensure_root("define_local_variable")?;
        self.builder.define_local_variable(PdbSlot {
            index,
            name: name.to_string(),
            compiler_generated,
            signature_token,
        })
    }

    fn define_local_constant(
        &mut self,
        name: &str,
        value: PdbConstantValue,
        signature_token: Token,
    ) -> Result<()> {
        self.ensure_root("define_local_constant")?;
        self.builder.define_local_constant(PdbConstant {
            name: name.to_string(),
            signature_token,
            value,
        })
    }

    fn define_sequence_point(&mut self, location: &SourceLocation, offset: u32) -> Result<()> {
        if location.source >= self.documents.len() {
            return Err(Error::OutOfBounds);
        }
        let method = self.current("define_sequence_point")?;
        let line = location.at(offset);
        match method.runs.last_mut() {
            Some((source, lines)) if *source == location.source => lines.push(line),
            _ => method.runs.push((location.source, vec![line])),
        }
        Ok(())
    }

    fn using_namespace(&mut self, name: &str) -> Result<()> {
        self.ensure_root("using_namespace")?;
        self.builder.using_namespace(name)
    }

    fn set_entry_point(&mut self, token: Token) -> Result<()> {
        self.builder.set_entry_point(token);
        Ok(())
    }

    fn define_custom_metadata(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let token = self.current("define_custom_metadata")?.token;
        match name {
            OEM_MD2 => {
                let md2 = read_md2(data)?;
                self.builder
                    .set_iterator_info(md2.iterator_class, md2.iterator_scopes)
            }
            OEM_ASYNC_METHOD_INFO => self
                .builder
                .set_async_info(read_async_method_info(data, token)?),
            _ => self.builder.add_custom_metadata(name, data.to_vec()),
        }
    }

    fn define_token_source_location(
        &mut self,
        token: Token,
        location: &SourceLocation,
    ) -> Result<()> {
        if !self.in_token_scope {
            return Err(Error::ScopeMismatch(
                "token source location outside of its scope".into(),
            ));
        }
        self.builder.define_token_source_location(token, location)
    }

    fn open_token_source_locations_scope(&mut self) -> Result<()> {
        if self.in_token_scope {
            return Err(Error::ScopeMismatch(
                "token source location scope already open".into(),
            ));
        }
        self.in_token_scope = true;
        Ok(())
    }

    fn close_token_source_locations_scope(&mut self) -> Result<()> {
        if !self.in_token_scope {
            return Err(Error::ScopeMismatch(
                "token source location scope not open".into(),
            ));
        }
        self.in_token_scope = false;
        Ok(())
    }

    fn debug_directory(&self) -> Result<PeDebugDirectory> {
        PeDebugDirectory::codeview(&self.options.guid, self.options.age, &self.options.pdb_path)
    }
}

fn emit_scope_content(writer: &mut dyn PdbWriter, scope: &PdbScope) -> Result<()> {
    for namespace in &scope.used_namespaces {
        writer.using_namespace(namespace)?;
    }
    for slot in &scope.slots {
        writer.define_local_variable(
            slot.index,
            &slot.name,
            slot.compiler_generated,
            slot.signature_token,
        )?;
    }
    for constant in &scope.constants {
        writer.define_local_constant(
            &constant.name,
            constant.value.clone(),
            constant.signature_token,
        )?;
    }
    for nested in &scope.scopes {
        writer.open_scope(nested.offset)?;
        emit_scope_content(writer, nested)?;
        writer.close_scope(nested.end())?;
    }
    Ok(())
}

/// Replay a decoded function through `writer`. `sources` are the documents the function's
/// [`crate::pdb::PdbLines`] refer to; they are defined in `writer` as needed.
///
/// A single top-level scope spanning the whole method becomes the writer's root scope.
///
/// # Errors
/// Returns [`Error::OutOfBounds`] for a document index outside `sources` and any error of the
/// writer.
pub fn emit_function(
    writer: &mut dyn PdbWriter,
    function: &PdbFunction,
    sources: &[PdbSource],
) -> Result<()> {
    let mut documents = Vec::with_capacity(function.lines.len());
    for lines in &function.lines {
        let source = sources.get(lines.source).ok_or(Error::OutOfBounds)?;
        documents.push(writer.define_document(source.clone()));
    }

    writer.open_method(function.token)?;

    if function.iterator_class.is_some() || !function.iterator_scopes.is_empty() {
        let md2 = write_md2(&Md2 {
            iterator_class: function.iterator_class.clone(),
            iterator_scopes: function.iterator_scopes.clone(),
        })?;
        writer.define_custom_metadata(OEM_MD2, &md2)?;
    }
    if let Some(async_info) = &function.async_info {
        writer.define_custom_metadata(
            OEM_ASYNC_METHOD_INFO,
            &write_async_method_info(async_info)?,
        )?;
    }
    for (name, data) in &function.custom_metadata {
        writer.define_custom_metadata(name, data)?;
    }

    for (lines, source) in function.lines.iter().zip(documents) {
        for line in &lines.lines {
            writer.define_sequence_point(
                &SourceLocation {
                    source,
                    start_line: line.line_begin,
                    start_column: line.col_begin,
                    end_line: line.line_end,
                    end_column: line.col_end,
                },
                line.offset,
            )?;
        }
    }

    match function.scopes.as_slice() {
        [root] if root.offset == 0 && root.length == function.length => {
            emit_scope_content(writer, root)?;
        }
        scopes => {
            for scope in scopes {
                writer.open_scope(scope.offset)?;
                emit_scope_content(writer, scope)?;
                writer.close_scope(scope.end())?;
            }
        }
    }

    trace!(token = %function.token, "emitted function");
    writer.close_method(function.length)
}
