//! In-memory debug symbol model.
//!
//! Both physical formats decode into a [`PdbInfo`], and the legacy writer serializes one back.
//! A [`PdbFunction`] owns a tree of lexical [`PdbScope`]s and its sequence points grouped by
//! document ([`PdbLines`]). Documents are [`PdbSource`] records referenced by index.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::pdb::{ChecksumAlgorithm, PdbSource};
//!
//! let source = PdbSource::with_checksum_of("Program.cs", b"class P {}", ChecksumAlgorithm::Sha1);
//! assert_eq!(source.checksum.len(), 20);
//! assert_eq!(source.checksum_algorithm, ChecksumAlgorithm::Sha1.guid());
//! ```

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
};

use md5::{Digest, Md5};
use sha1::Sha1;
use uguid::{guid, Guid};

use crate::token::Token;

/// Line number the compilers use for hidden sequence points
pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// C# language id
pub const LANGUAGE_CSHARP: Guid = guid!("3f5162f8-07c6-11d3-9053-00c04fa302a1");
/// Visual Basic language id
pub const LANGUAGE_BASIC: Guid = guid!("3a12d0b8-c26c-11d0-b442-00a0244a1dd2");
/// F# language id
pub const LANGUAGE_FSHARP: Guid = guid!("ab4f38c9-b6e6-43ba-be3b-58080b2ccce3");
/// Microsoft vendor id
pub const VENDOR_MICROSOFT: Guid = guid!("994b45c4-e6e9-11d2-903f-00c04fa302a1");
/// Text document type
pub const DOCUMENT_TYPE_TEXT: Guid = guid!("5a869d0b-6611-11d3-bd2a-0000f80849bd");

/// The physical format a [`PdbInfo`] was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdbFormat {
    /// MSF container with CodeView records
    Legacy,
    /// ECMA-335 metadata with the `#Pdb` stream
    Portable,
}

/// Hash algorithm of a document checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    /// SHA-1, 20 bytes
    Sha1,
    /// MD5, 16 bytes
    Md5,
}

impl ChecksumAlgorithm {
    /// The algorithm id stored in document records
    #[must_use]
    pub const fn guid(self) -> Guid {
        match self {
            ChecksumAlgorithm::Sha1 => guid!("ff1816ec-aa5e-4d10-87f7-6f4963833460"),
            ChecksumAlgorithm::Md5 => guid!("406ea660-64cf-4c82-b6f0-42d48172a799"),
        }
    }

    /// Look up an algorithm by its id
    #[must_use]
    pub fn from_guid(guid: &Guid) -> Option<Self> {
        [ChecksumAlgorithm::Sha1, ChecksumAlgorithm::Md5]
            .into_iter()
            .find(|algorithm| algorithm.guid() == *guid)
    }

    /// Hash `data`
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ChecksumAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            ChecksumAlgorithm::Md5 => Md5::digest(data).to_vec(),
        }
    }

    /// The CodeView checksum kind byte
    #[must_use]
    pub const fn codeview_kind(self) -> u8 {
        match self {
            ChecksumAlgorithm::Md5 => 1,
            ChecksumAlgorithm::Sha1 => 2,
        }
    }

    /// The algorithm with CodeView checksum kind `kind`
    #[must_use]
    pub const fn from_codeview_kind(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(ChecksumAlgorithm::Md5),
            2 => Some(ChecksumAlgorithm::Sha1),
            _ => None,
        }
    }
}

/// A source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbSource {
    /// File name as recorded by the compiler
    pub name: String,
    /// Language id
    pub language: Guid,
    /// Language vendor id
    pub vendor: Guid,
    /// Document type id
    pub doc_type: Guid,
    /// Checksum algorithm id, [`Guid::ZERO`] when there is no checksum
    pub checksum_algorithm: Guid,
    /// Checksum bytes
    pub checksum: Vec<u8>,
}

impl PdbSource {
    /// A C# text document without a checksum
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        PdbSource {
            name: name.into(),
            language: LANGUAGE_CSHARP,
            vendor: VENDOR_MICROSOFT,
            doc_type: DOCUMENT_TYPE_TEXT,
            checksum_algorithm: Guid::ZERO,
            checksum: Vec::new(),
        }
    }

    /// A C# text document whose checksum is computed from `contents`
    #[must_use]
    pub fn with_checksum_of(
        name: impl Into<String>,
        contents: &[u8],
        algorithm: ChecksumAlgorithm,
    ) -> Self {
        PdbSource {
            checksum_algorithm: algorithm.guid(),
            checksum: algorithm.digest(contents),
            ..PdbSource::new(name)
        }
    }

    /// The checksum algorithm, if it is one this crate can compute
    #[must_use]
    pub fn algorithm(&self) -> Option<ChecksumAlgorithm> {
        ChecksumAlgorithm::from_guid(&self.checksum_algorithm)
    }
}

/// One sequence point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdbLine {
    /// IL offset
    pub offset: u32,
    /// First line
    pub line_begin: u32,
    /// First column
    pub col_begin: u16,
    /// Last line
    pub line_end: u32,
    /// Column after the last character
    pub col_end: u16,
}

impl PdbLine {
    /// A sequence point that hides the code from the debugger
    #[must_use]
    pub fn hidden(offset: u32) -> Self {
        PdbLine {
            offset,
            line_begin: HIDDEN_LINE,
            col_begin: 0,
            line_end: HIDDEN_LINE,
            col_end: 0,
        }
    }

    /// True for hidden sequence points
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.line_begin == HIDDEN_LINE
    }
}

/// Sequence points of one function in one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbLines {
    /// Index into [`PdbInfo::sources`]
    pub source: usize,
    /// Sequence points in offset order
    pub lines: Vec<PdbLine>,
}

/// A source span, as passed to the generator and the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// Index into the document list
    pub source: usize,
    /// First line
    pub start_line: u32,
    /// First column
    pub start_column: u16,
    /// Last line
    pub end_line: u32,
    /// Column after the last character
    pub end_column: u16,
}

impl SourceLocation {
    /// The sequence point for this location at `offset`
    #[must_use]
    pub fn at(&self, offset: u32) -> PdbLine {
        PdbLine {
            offset,
            line_begin: self.start_line,
            col_begin: self.start_column,
            line_end: self.end_line,
            col_end: self.end_column,
        }
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PdbSlot {
    /// Index in the local signature
    pub index: u32,
    /// Source name
    pub name: String,
    /// Introduced by the compiler, hidden from the user
    pub compiler_generated: bool,
    /// `StandAloneSig` token of the method's local signature
    pub signature_token: Token,
}

/// Value of a named constant.
///
/// The variants are exactly the numeric leaves CodeView can distinguish; the portable decoder
/// folds `bool` into [`PdbConstantValue::I8`] and `char`/`byte` into [`PdbConstantValue::U16`].
#[derive(Debug, Clone, PartialEq)]
pub enum PdbConstantValue {
    /// Signed byte
    I8(i8),
    /// Signed 16-bit integer
    I16(i16),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Signed 64-bit integer
    I64(i64),
    /// Unsigned 64-bit integer
    U64(u64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// String
    String(String),
}

/// A named constant visible in a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct PdbConstant {
    /// Source name
    pub name: String,
    /// `StandAloneSig` token describing the constant's type
    pub signature_token: Token,
    /// The value
    pub value: PdbConstantValue,
}

/// A lexical scope `[offset, offset + length)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdbScope {
    /// First IL offset
    pub offset: u32,
    /// Length in IL bytes
    pub length: u32,
    /// Locals declared here
    pub slots: Vec<PdbSlot>,
    /// Constants declared here
    pub constants: Vec<PdbConstant>,
    /// `using` directives in effect
    pub used_namespaces: Vec<String>,
    /// Nested scopes
    pub scopes: Vec<PdbScope>,
}

impl PdbScope {
    /// A scope without content
    #[must_use]
    pub fn new(offset: u32, length: u32) -> Self {
        PdbScope {
            offset,
            length,
            ..PdbScope::default()
        }
    }

    /// First offset after the scope
    #[must_use]
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    /// True if `other` lies within this scope
    #[must_use]
    pub fn contains(&self, other: &PdbScope) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// This scope followed by all nested scopes, depth first
    #[must_use]
    pub fn flatten(&self) -> Vec<&PdbScope> {
        let mut result = vec![self];
        for scope in &self.scopes {
            result.extend(scope.flatten());
        }
        result
    }
}

/// Offset range of an iterator local's scope in a state machine `MoveNext`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IteratorScope {
    /// First IL offset
    pub offset: u32,
    /// Length in IL bytes
    pub length: u32,
}

/// Stepping information of an async state machine `MoveNext` method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbAsyncInfo {
    /// The user-visible async method
    pub kickoff_method: Token,
    /// Offset of the compiler generated catch handler, `None` unless the method returns void
    pub catch_handler_offset: Option<u32>,
    /// Offsets where execution awaits
    pub yield_offsets: Vec<u32>,
    /// Offsets where execution resumes, parallel to `yield_offsets`
    pub resume_offsets: Vec<u32>,
    /// The method that contains the resume offsets
    pub move_next_method: Token,
}

/// Debug information of one method.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdbFunction {
    /// `MethodDef` token
    pub token: Token,
    /// Length of the IL code covered by the root scope
    pub length: u32,
    /// Top-level scopes
    pub scopes: Vec<PdbScope>,
    /// Sequence points grouped by document
    pub lines: Vec<PdbLines>,
    /// Async stepping information
    pub async_info: Option<PdbAsyncInfo>,
    /// Name of the iterator state machine class, for the kickoff method of an iterator
    pub iterator_class: Option<String>,
    /// Per-local scopes of hoisted iterator variables
    pub iterator_scopes: Vec<IteratorScope>,
    /// Opaque compiler metadata, by name
    pub custom_metadata: Vec<(String, Vec<u8>)>,
}

impl PdbFunction {
    /// An empty function
    #[must_use]
    pub fn new(token: Token) -> Self {
        PdbFunction {
            token,
            ..PdbFunction::default()
        }
    }

    /// All scopes depth first
    #[must_use]
    pub fn all_scopes(&self) -> Vec<&PdbScope> {
        self.scopes.iter().flat_map(PdbScope::flatten).collect()
    }

    /// Number of sequence points in all documents
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.iter().map(|lines| lines.lines.len()).sum()
    }

    /// The sequence point covering `offset`, with its document
    #[must_use]
    pub fn line_for(&self, offset: u32) -> Option<(usize, &PdbLine)> {
        self.lines
            .iter()
            .flat_map(|lines| lines.lines.iter().map(move |line| (lines.source, line)))
            .filter(|(_, line)| line.offset <= offset)
            .max_by_key(|(_, line)| line.offset)
    }
}

/// Node of the per-token source location list.
///
/// Dropping, cloning, comparing and formatting walk the list iteratively, so a token may carry
/// any number of locations.
pub struct PdbTokenLine {
    /// Token the location belongs to
    pub token: Token,
    /// Index into [`PdbInfo::sources`]
    pub source: usize,
    /// First line
    pub line: u32,
    /// First column
    pub column: u16,
    /// Last line
    pub end_line: u32,
    /// Last column
    pub end_column: u16,
    /// The next location for the same token
    pub next: Option<Box<PdbTokenLine>>,
}

impl PdbTokenLine {
    /// A single-node list
    #[must_use]
    pub fn new(token: Token, location: &SourceLocation) -> Self {
        PdbTokenLine {
            token,
            source: location.source,
            line: location.start_line,
            column: location.start_column,
            end_line: location.end_line,
            end_column: location.end_column,
            next: None,
        }
    }

    /// Append a node after the last one
    pub fn append(&mut self, node: PdbTokenLine) {
        self.extend(std::iter::once(node));
    }

    /// Append `nodes` in order after the last node. The list is walked once per call.
    pub fn extend<I: IntoIterator<Item = PdbTokenLine>>(&mut self, nodes: I) {
        let mut tail = &mut self.next;
        while let Some(next) = tail {
            tail = &mut next.next;
        }
        for node in nodes {
            tail = &mut tail.insert(Box::new(node)).next;
        }
    }

    /// A copy of this node without its successors
    fn detached(&self) -> PdbTokenLine {
        PdbTokenLine {
            token: self.token,
            source: self.source,
            line: self.line,
            column: self.column,
            end_line: self.end_line,
            end_column: self.end_column,
            next: None,
        }
    }

    fn key(&self) -> (Token, usize, u32, u16, u32, u16) {
        (
            self.token,
            self.source,
            self.line,
            self.column,
            self.end_line,
            self.end_column,
        )
    }

    /// Iterate this node and its successors
    pub fn iter(&self) -> impl Iterator<Item = &PdbTokenLine> {
        std::iter::successors(Some(self), |node| node.next.as_deref())
    }

    /// The location stored in this node
    #[must_use]
    pub fn location(&self) -> SourceLocation {
        SourceLocation {
            source: self.source,
            start_line: self.line,
            start_column: self.column,
            end_line: self.end_line,
            end_column: self.end_column,
        }
    }
}

impl Drop for PdbTokenLine {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

impl Clone for PdbTokenLine {
    fn clone(&self) -> Self {
        let rest: Vec<&PdbTokenLine> = self.iter().skip(1).collect();
        let mut chain = None;
        for node in rest.into_iter().rev() {
            let mut copy = node.detached();
            copy.next = chain;
            chain = Some(Box::new(copy));
        }
        let mut head = self.detached();
        head.next = chain;
        head
    }
}

impl PartialEq for PdbTokenLine {
    fn eq(&self, other: &Self) -> bool {
        self.iter().map(Self::key).eq(other.iter().map(Self::key))
    }
}

impl Eq for PdbTokenLine {}

impl fmt::Debug for PdbTokenLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|node| (node.token, node.location())))
            .finish()
    }
}

/// Debug information of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct PdbInfo {
    /// Functions in token order
    pub functions: Vec<PdbFunction>,
    /// Source locations by token
    pub token_lines: HashMap<Token, PdbTokenLine>,
    /// Documents
    pub sources: Vec<PdbSource>,
    /// Signature matching the CodeView record of the image
    pub guid: Guid,
    /// Age matching the CodeView record of the image
    pub age: u32,
    /// Entry point method
    pub entry_point: Option<Token>,
    /// Source server script
    pub source_server_data: Option<String>,
    /// `guid` as 32 lowercase hex digits followed by `age` in uppercase hex
    pub debug_information_version: String,
    /// Format the information was read from
    pub format: PdbFormat,
}

impl PdbInfo {
    /// An empty model for the given identity
    #[must_use]
    pub fn new(guid: Guid, age: u32, format: PdbFormat) -> Self {
        PdbInfo {
            functions: Vec::new(),
            token_lines: HashMap::new(),
            sources: Vec::new(),
            guid,
            age,
            entry_point: None,
            source_server_data: None,
            debug_information_version: debug_information_version(&guid, age),
            format,
        }
    }

    /// The function with `token`
    #[must_use]
    pub fn function(&self, token: Token) -> Option<&PdbFunction> {
        self.functions
            .binary_search_by_key(&token, |function| function.token)
            .ok()
            .map(|index| &self.functions[index])
    }

    /// Thread `nodes` onto the end of the location list of `token`
    pub(crate) fn append_token_lines(&mut self, token: Token, nodes: Vec<PdbTokenLine>) {
        let mut nodes = nodes.into_iter();
        match self.token_lines.entry(token) {
            Entry::Occupied(mut head) => head.get_mut().extend(nodes),
            Entry::Vacant(slot) => {
                if let Some(first) = nodes.next() {
                    slot.insert(first).extend(nodes);
                }
            }
        }
    }

    /// Source locations recorded for `token`
    pub fn token_locations(&self, token: Token) -> impl Iterator<Item = &PdbTokenLine> {
        self.token_lines
            .get(&token)
            .into_iter()
            .flat_map(PdbTokenLine::iter)
    }
}

/// Format the debug information version string of a symbol file identity.
///
/// The GUID is written in its in-memory byte order, which is how debuggers build symbol
/// server paths.
#[must_use]
pub fn debug_information_version(guid: &Guid, age: u32) -> String {
    use std::fmt::Write;

    let mut version = String::with_capacity(40);
    for byte in guid.to_bytes() {
        let _ = write!(version, "{byte:02x}");
    }
    let _ = write!(version, "{age:X}");
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksums() {
        let sha1 = PdbSource::with_checksum_of("a.cs", b"abc", ChecksumAlgorithm::Sha1);
        assert_eq!(
            sha1.checksum,
            vec![
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
        assert_eq!(sha1.algorithm(), Some(ChecksumAlgorithm::Sha1));

        let md5 = PdbSource::with_checksum_of("a.cs", b"abc", ChecksumAlgorithm::Md5);
        assert_eq!(md5.checksum.len(), 16);
        assert_eq!(md5.checksum[..4], [0x90, 0x01, 0x50, 0x98]);

        assert_eq!(PdbSource::new("b.cs").algorithm(), None);
    }

    #[test]
    fn version_string() {
        let guid = Guid::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
            0x0F, 0x10,
        ]);
        assert_eq!(
            debug_information_version(&guid, 0x1A),
            "0102030405060708090a0b0c0d0e0f101A"
        );
        assert_eq!(
            PdbInfo::new(guid, 1, PdbFormat::Legacy).debug_information_version,
            "0102030405060708090a0b0c0d0e0f101"
        );
    }

    #[test]
    fn hidden_lines() {
        assert!(PdbLine::hidden(4).is_hidden());
        let location = SourceLocation {
            source: 0,
            start_line: 3,
            start_column: 5,
            end_line: 3,
            end_column: 9,
        };
        assert!(!location.at(0).is_hidden());
    }

    #[test]
    fn token_line_append() {
        let location = SourceLocation {
            source: 1,
            start_line: 10,
            start_column: 1,
            end_line: 10,
            end_column: 2,
        };
        let token = Token(0x0600_0001);
        let mut head = PdbTokenLine::new(token, &location);
        head.append(PdbTokenLine::new(
            token,
            &SourceLocation {
                start_line: 11,
                ..location
            },
        ));
        head.append(PdbTokenLine::new(
            token,
            &SourceLocation {
                start_line: 12,
                ..location
            },
        ));
        let lines: Vec<u32> = head.iter().map(|node| node.line).collect();
        assert_eq!(lines, vec![10, 11, 12]);
    }

    #[test]
    fn long_token_line_lists() {
        let token = Token(0x0600_0001);
        let location = |line| SourceLocation {
            source: 0,
            start_line: line,
            start_column: 1,
            end_line: line,
            end_column: 2,
        };
        let mut head = PdbTokenLine::new(token, &location(1));
        head.extend((2..=100_000).map(|line| PdbTokenLine::new(token, &location(line))));
        head.extend((100_001..=200_000).map(|line| PdbTokenLine::new(token, &location(line))));
        assert_eq!(head.iter().count(), 200_000);
        assert_eq!(head.iter().last().map(|node| node.line), Some(200_000));

        let copy = head.clone();
        assert_eq!(copy, head);

        let mut shorter = head.clone();
        shorter.next = None;
        assert_ne!(shorter, head);
    }

    #[test]
    fn scope_queries() {
        let mut root = PdbScope::new(0, 30);
        root.scopes.push(PdbScope::new(10, 10));
        assert_eq!(root.end(), 30);
        assert!(root.contains(&root.scopes[0]));
        assert_eq!(root.flatten().len(), 2);

        let mut function = PdbFunction::new(Token(0x0600_0001));
        function.scopes.push(root);
        function.lines.push(PdbLines {
            source: 0,
            lines: vec![PdbLine::hidden(0), PdbLine::hidden(8)],
        });
        assert_eq!(function.all_scopes().len(), 2);
        assert_eq!(function.line_count(), 2);
        assert_eq!(function.line_for(9).map(|(_, line)| line.offset), Some(8));
    }
}
