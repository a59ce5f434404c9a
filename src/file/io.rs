//! Low-level little-endian reading utilities.
//!
//! Every binary structure this crate decodes (method bodies, MSF pages, CodeView records,
//! portable PDB tables) is little-endian. The functions here perform bounds-checked reads of
//! primitive values and advance a caller-owned offset, so decoders can walk a buffer without
//! ever indexing out of range.
//!
//! # Key Components
//!
//! - [`crate::file::io::CilIO`] - Trait implemented by every primitive that can be read
//! - [`crate::file::io::read_le`] - Read a value from the start of a buffer
//! - [`crate::file::io::read_le_at`] - Read a value at an offset and advance it
//! - [`crate::file::io::read_le_at_dyn`] - Read a 2 or 4 byte index, promoted to `u32`
//!
//! # Examples
//!
//! ```rust,ignore
//! use dotsym::file::io::{read_le, read_le_at};
//!
//! let data = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00];
//! let value: u32 = read_le(&data)?;
//! assert_eq!(value, 1);
//!
//! let mut offset = 4;
//! let short: u16 = read_le_at(&data, &mut offset)?;
//! assert_eq!(short, 2);
//! assert_eq!(offset, 6);
//! # Ok::<(), dotsym::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for primitive types that can be decoded from little-endian bytes.
///
/// Implemented for all fixed-width integers and IEEE floats.
pub trait CilIO: Sized {
    /// Fixed-size byte array backing this type
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Decode a value from its little-endian representation
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Mutable reference to the offset position (will be advanced after reading)
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes. The offset is left
/// untouched in that case.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Reads either a 2-byte or 4-byte little-endian value, promoting it to `u32`.
///
/// Metadata table columns and heap indices switch between both widths depending on the
/// size of the referenced table or heap.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at_dyn(data: &[u8], offset: &mut usize, is_large: bool) -> Result<u32> {
    let res = if is_large {
        read_le_at::<u32>(data, offset)?
    } else {
        u32::from(read_le_at::<u16>(data, offset)?)
    };

    Ok(res)
}
