//! Binary emission substrate.
//!
//! Everything this crate serializes (method bodies, MSF containers, CodeView records) is written
//! through a [`BinaryWriter`] on top of a [`ByteBuffer`]. The buffer keeps a cursor separate from
//! its high-water length so that headers can be back-patched after their payload is known.
//!
//! # Key Components
//!
//! - [`crate::writer::ByteBuffer`] - Growable byte array with position tracking
//! - [`crate::writer::BinaryWriter`] - Fixed-width, string and compressed integer encoders

mod binary;
mod buffer;

pub use binary::BinaryWriter;
pub use buffer::ByteBuffer;
