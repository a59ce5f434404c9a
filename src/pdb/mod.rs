//! Debug symbols of .NET method bodies.
//!
//! Two physical formats decode into one model:
//!
//! - legacy Windows PDB files, an MSF container ([`msf`]) with CodeView symbol records and C13
//!   line subsections ([`codeview`]); read with [`read_legacy`], written with [`write_legacy`]
//! - portable PDB files, ECMA-335 metadata with the `#Pdb` stream; read with [`read_portable`]
//!
//! [`load_pdb`] picks the decoder from the leading bytes and [`load_for_image`] finds and loads
//! the PDB that belongs to a PE image. Code generators emit symbols through the [`PdbWriter`]
//! trait.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::pdb::{load_pdb, write_legacy, PdbBuilder, PdbFormat, PdbWriterOptions};
//! use dotsym::token::Token;
//!
//! let mut builder = PdbBuilder::new(uguid::Guid::ZERO, 1, PdbFormat::Legacy);
//! builder.open_method(Token(0x0600_0001))?;
//! builder.open_scope(0)?;
//! builder.close_scope(4)?;
//! builder.close_method(4)?;
//! let info = builder.finish()?;
//!
//! let bytes = write_legacy(&info, &PdbWriterOptions::default())?;
//! assert_eq!(load_pdb(&bytes)?.functions, info.functions);
//! # Ok::<(), dotsym::Error>(())
//! ```

mod builder;
pub mod codeview;
mod detect;
mod legacy;
mod model;
pub mod msf;
mod portable;
mod writer;

pub use builder::PdbBuilder;
pub use detect::{
    convert_to_legacy, find_associated_pdb, load_for_image, load_pdb, sniff, DiscoveryOptions,
};
pub use legacy::{hash_string_v1, read_legacy, write_legacy};
pub use model::{
    debug_information_version, ChecksumAlgorithm, IteratorScope, PdbAsyncInfo, PdbConstant,
    PdbConstantValue, PdbFormat, PdbFunction, PdbInfo, PdbLine, PdbLines, PdbScope, PdbSlot,
    PdbSource, PdbTokenLine, SourceLocation, DOCUMENT_TYPE_TEXT, HIDDEN_LINE, LANGUAGE_BASIC,
    LANGUAGE_CSHARP, LANGUAGE_FSHARP, VENDOR_MICROSOFT,
};
pub use portable::{
    read_portable, ASYNC_METHOD_STEPPING_INFORMATION, METADATA_SIGNATURE,
    STATE_MACHINE_HOISTED_LOCAL_SCOPES,
};
pub use writer::{emit_function, LegacyPdbWriter, PdbWriter, PdbWriterOptions, PeDebugDirectory};
