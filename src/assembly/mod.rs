//! CIL method bodies: decoding, generation and rewriting.
//!
//! This module covers the code half of the crate. Method bodies are parsed into a
//! [`MethodBody`] (header, code, exception clauses), the code is decoded into [`Operation`]s, and
//! new code is produced with the label-based [`IlGenerator`] or by replaying an existing body
//! through the [`IlRewriter`].
//!
//! # Key Types
//! - [`OpCode`] - The static opcode table with operand kinds, flow and stack behaviour
//! - [`Operation`] - A decoded instruction with absolute branch targets
//! - [`MethodBody`] - Tiny/fat header, code and exception handling clauses
//! - [`IlGenerator`] - Emits code against [`Label`]s and tracks scopes and stack depth
//! - [`IlRewriter`] - Re-emits a decoded body, widening branches and replaying debug scopes
//!
//! # Example
//! ```rust
//! use dotsym::assembly::{decode_operations, encode_operations, MethodBody};
//!
//! let body = MethodBody::parse(&[0x0A, 0x17, 0x2A])?;
//! let operations = decode_operations(&body.code)?;
//! assert_eq!(encode_operations(&operations)?, body.code);
//! assert_eq!(body.to_bytes()?, vec![0x0A, 0x17, 0x2A]);
//! # Ok::<(), dotsym::Error>(())
//! ```

mod body;
mod decoder;
mod generator;
mod label;
mod opcodes;
mod operation;
mod rewriter;

pub use body::{
    ExceptionHandler, ExceptionHandlerFlags, HandlerKind, MethodBody, MethodBodyFlags,
    SectionFlags,
};
pub use decoder::{decode_operation, decode_operations, encode_operations};
pub use generator::{
    GeneratedBody, IlGenerator, SequencePoint, SynchronizationInfo, SynchronizationPoint,
};
pub use label::Label;
pub use opcodes::{
    FlowControl, OpCode, OperandKind, StackPop, StackPush, VariableKind, FE_PREFIX,
};
pub use operation::{Operation, OperationValue};
pub use rewriter::{IlRewriter, LocalScopeProvider, RewriterOptions, RewrittenBody};
