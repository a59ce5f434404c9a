// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # dotsym
//!
//! Method bodies, debug symbols and flow graphs for .NET assemblies, in pure Rust.
//!
//! `dotsym` covers the part of a .NET toolchain that sits between a metadata reader and a code
//! generator: it decodes and re-encodes CIL method bodies, reads and writes the PDB files that
//! map them back to source, and builds control and data flow graphs over them. It runs on any
//! platform Rust supports and needs neither Windows nor the .NET runtime.
//!
//! ## Features
//!
//! - **Method body codec** - tiny and fat headers, exception clauses, every ECMA-335 opcode
//! - **IL generation** - labels, automatic short/long branch selection, scopes and sequence
//!   points recorded alongside the code
//! - **PDB reading** - legacy MSF/CodeView files and portable PDB metadata into one model
//! - **PDB writing** - legacy MSF files with C13 line information
//! - **Flow graphs** - basic blocks, operand flow, types, exception handler nesting and
//!   local definitions, with dominators on demand
//!
//! ## Quick Start
//!
//! ```rust
//! use dotsym::assembly::{decode_operations, MethodBody};
//!
//! // Tiny header, two bytes of code: ldc.i4.1; ret
//! let body = MethodBody::parse(&[0x0A, 0x17, 0x2A])?;
//! let operations = decode_operations(&body.code)?;
//! assert_eq!(operations.len(), 2);
//! assert_eq!(body.to_bytes()?, vec![0x0A, 0x17, 0x2A]);
//! # Ok::<(), dotsym::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - opcodes, the method body codec, [`assembly::IlGenerator`] and
//!   [`assembly::IlRewriter`]
//! - [`pdb`] - the symbol model, the legacy and portable readers, the legacy writer and
//!   discovery of the PDB that belongs to an image
//! - [`cdfg`] - control and data flow graphs
//! - [`host`] - the metadata queries graphs are built against
//! - [`solver`] - the interface to an optional satisfiability backend
//! - [`File`] and [`Parser`] - PE images and little-endian reading; [`writer`] - writing
//! - [`Error`] and [`Result`] - error handling
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T, Error>`](Result). Missing optional data, such as an
//! image without a debug directory, is `Ok(None)` rather than an error:
//!
//! ```rust
//! use dotsym::{assembly::MethodBody, Error};
//!
//! match MethodBody::parse(&[0x03]) {
//!     Ok(_) => unreachable!(),
//!     Err(Error::Malformed { message, .. }) => println!("malformed body: {message}"),
//!     Err(Error::OutOfBounds) => println!("truncated body"),
//!     Err(error) => println!("other error: {error}"),
//! }
//! ```
//!
//! ## Logging
//!
//! The crate emits [`tracing`](https://docs.rs/tracing) events and never installs a subscriber.
#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Little-endian output buffers
pub mod writer;

/// Metadata tokens
pub mod token;

/// CIL opcodes, method bodies and IL generation
///
/// # Key Types
///
/// - [`assembly::MethodBody`] - header, code and exception clauses of a method
/// - [`assembly::Operation`] - one decoded instruction with resolved branch targets
/// - [`assembly::IlGenerator`] - emits code with labels, scopes and sequence points
/// - [`assembly::IlRewriter`] - re-emits a body with canonical branch and variable forms
///
/// # Examples
///
/// ```rust
/// use dotsym::assembly::{decode_operations, encode_operations, OpCode};
///
/// let code = [0x00, 0x2B, 0x00, 0x2A]; // nop; br.s +0; ret
/// let operations = decode_operations(&code)?;
/// assert_eq!(operations[1].opcode, OpCode::BrS);
/// assert_eq!(operations[1].targets(), &[3]);
/// assert_eq!(encode_operations(&operations)?, code);
/// # Ok::<(), dotsym::Error>(())
/// ```
pub mod assembly;

/// Debug symbols: the PDB model, readers, writer and discovery
pub mod pdb;

/// Metadata queries needed to build flow graphs
pub mod host;

/// Control and data flow graphs of method bodies
pub mod cdfg;

/// Satisfiability backend interface
pub mod solver;

/// `dotsym` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust
/// use dotsym::{token::Token, Result};
///
/// fn method_row(token: Token) -> Result<u32> {
///     if !token.is_method_def() {
///         return Err(dotsym::Error::NotSupported);
///     }
///     Ok(token.row())
/// }
///
/// assert_eq!(method_row(Token(0x0600_0003))?, 3);
/// # Ok::<(), dotsym::Error>(())
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dotsym` Error type
///
/// See [`Error`] for the variants.
pub use error::Error;

/// Read access to PE images and raw little-endian data
pub use file::{parser::Parser, File};
