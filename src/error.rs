use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into three groups. Format errors (bad magic, truncated streams, unresolved labels,
/// unbalanced scopes) abort the unit being processed. Missing optional data, such as an image
/// without symbols, is never reported through this type; those APIs return `Ok(None)` instead.
/// The remaining variants wrap I/O and PE parsing failures.
///
/// # Error Categories
///
/// ## Binary Format Errors
/// - [`Error::Malformed`] - Corrupted or invalid binary structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::NotSupported`] - Unsupported format or feature
/// - [`Error::Empty`] - Empty input provided
///
/// ## Code Generation Errors
/// - [`Error::UnmarkedLabel`] - A label was never marked, or belongs to another generator
/// - [`Error::LabelAlreadyMarked`] - A label was bound to two positions
/// - [`Error::ScopeMismatch`] - Open/close calls were not properly nested
///
/// ## Graph Construction Errors
/// - [`Error::InvalidBranchTarget`] - A branch points into the middle of an instruction
/// - [`Error::StackUnderflow`] - An instruction pops more values than the stack holds
/// - [`Error::GraphError`] - Inconsistent exception handler layout
///
/// # Examples
///
/// ```rust,no_run
/// use dotsym::{pdb::load_pdb, Error};
///
/// let data = std::fs::read("Sample.pdb")?;
/// match load_pdb(&data) {
///     Ok(info) => println!("{} functions", info.functions.len()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed symbols: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted, or a size computation overflowed.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This input type or feature is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A label was never marked, or does not belong to the generator it was used with.
    ///
    /// The associated value is the label id.
    #[error("Label {0} was never marked")]
    UnmarkedLabel(u32),

    /// A label was marked a second time.
    #[error("Label {0} was already marked")]
    LabelAlreadyMarked(u32),

    /// A branch target does not start an instruction of the method body.
    ///
    /// The associated value is the offending target offset.
    #[error("Branch target {0:#x} does not start an instruction")]
    InvalidBranchTarget(u32),

    /// Open/close calls of scopes or methods were not properly nested.
    #[error("Scope mismatch - {0}")]
    ScopeMismatch(String),

    /// An instruction consumes more operands than the evaluation stack holds.
    ///
    /// The associated value is the offset of the instruction.
    #[error("Evaluation stack underflow at {0:#x}")]
    StackUnderflow(u32),

    /// Inconsistent control flow graph input, such as badly ordered exception handlers.
    #[error("{0}")]
    GraphError(String),
}
