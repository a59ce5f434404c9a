//! Growable byte buffer with an explicit cursor.

use crate::{Error::OutOfBounds, Result};

const DEFAULT_CAPACITY: usize = 64;
const MIN_GROWTH: usize = 16;

/// A resizable byte array with position tracking.
///
/// Unlike a plain `Vec<u8>`, the cursor can be moved anywhere, including past the end. The
/// logical length is the high-water mark of every position ever set, so seeking back to patch a
/// header and then writing never shrinks the buffer. Storage grows by doubling, starting from the
/// current capacity (16 if it is zero), until it exceeds the requested position.
///
/// Positions are limited to `u32::MAX` because every offset of the formats produced with this
/// buffer is a 32-bit quantity.
///
/// # Examples
///
/// ```rust
/// use dotsym::writer::ByteBuffer;
///
/// let mut buffer = ByteBuffer::new();
/// buffer.write_bytes(&[1, 2, 3, 4])?;
/// buffer.set_position(1)?;
/// buffer.write_u8(0xFF)?;
///
/// assert_eq!(buffer.len(), 4);
/// assert_eq!(buffer.as_slice(), &[1, 0xFF, 3, 4]);
/// # Ok::<(), dotsym::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    length: usize,
    position: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// Create an empty buffer with a capacity of 64 bytes
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer with the given initial capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            storage: vec![0; capacity],
            length: 0,
            position: 0,
        }
    }

    /// Current cursor position
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor, growing the storage when `position` reaches the capacity and raising the
    /// length when `position` exceeds it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `position` exceeds `u32::MAX` or the new capacity
    /// can not be computed without overflow.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > u32::MAX as usize {
            return Err(OutOfBounds);
        }

        if position >= self.storage.len() {
            self.grow(position)?;
        }
        if position > self.length {
            self.length = position;
        }
        self.position = position;
        Ok(())
    }

    fn grow(&mut self, required: usize) -> Result<()> {
        let current = self.storage.len();
        let mut capacity = if current == 0 {
            MIN_GROWTH
        } else {
            current.checked_mul(2).ok_or(OutOfBounds)?
        };

        while required >= capacity {
            capacity = capacity.checked_mul(2).ok_or(OutOfBounds)?;
        }

        self.storage.resize(capacity, 0);
        Ok(())
    }

    /// Logical length (high-water mark)
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Allocated storage size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The first `len()` bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.length]
    }

    /// Copy of the first `len()` bytes
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Consume the buffer, returning the first `len()` bytes
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.storage.truncate(self.length);
        self.storage
    }

    /// Write one byte at the cursor.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        let start = self.position;
        self.set_position(start + 1)?;
        self.storage[start] = value;
        Ok(())
    }

    /// Write `bytes` at the cursor.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.position;
        let end = start.checked_add(bytes.len()).ok_or(OutOfBounds)?;
        self.set_position(end)?;
        self.storage[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Write `count` zero bytes at the cursor.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_zeros(&mut self, count: usize) -> Result<()> {
        let start = self.position;
        let end = start.checked_add(count).ok_or(OutOfBounds)?;
        self.set_position(end)?;
        self.storage[start..end].fill(0);
        Ok(())
    }

    /// Overwrite bytes at `position` and restore the cursor afterwards.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer can not grow.
    pub fn write_at(&mut self, position: usize, bytes: &[u8]) -> Result<()> {
        let saved = self.position;
        self.set_position(position)?;
        self.write_bytes(bytes)?;
        self.set_position(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let buffer = ByteBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.position(), 0);
        assert!(buffer.as_slice().is_empty());
    }

    #[test]
    fn grows_by_doubling() {
        let mut buffer = ByteBuffer::new();
        buffer.set_position(64).unwrap();
        assert_eq!(buffer.capacity(), 128);

        buffer.set_position(1000).unwrap();
        assert_eq!(buffer.capacity(), 1024);

        let mut zero = ByteBuffer::with_capacity(0);
        zero.write_u8(7).unwrap();
        assert_eq!(zero.capacity(), 16);
        assert_eq!(zero.as_slice(), &[7]);
    }

    #[test]
    fn high_water_mark() {
        let mut buffer = ByteBuffer::new();
        buffer.write_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        buffer.set_position(2).unwrap();
        buffer.write_u8(9).unwrap();
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.position(), 3);
        assert_eq!(buffer.as_slice(), &[1, 2, 9, 4, 5, 6]);

        buffer.set_position(10).unwrap();
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.to_vec(), vec![1, 2, 9, 4, 5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn write_at_restores_cursor() {
        let mut buffer = ByteBuffer::new();
        buffer.write_zeros(8).unwrap();
        buffer.write_at(2, &[0xAA, 0xBB]).unwrap();
        assert_eq!(buffer.position(), 8);
        assert_eq!(buffer.into_vec(), vec![0, 0, 0xAA, 0xBB, 0, 0, 0, 0]);
    }

    #[test]
    fn rejects_positions_beyond_u32() {
        let mut buffer = ByteBuffer::new();
        assert!(matches!(
            buffer.set_position(u32::MAX as usize + 1),
            Err(crate::Error::OutOfBounds)
        ));
        assert_eq!(buffer.position(), 0);
    }
}
