use super::Backend;
use crate::{Error::OutOfBounds, Result};

use memmap2::Mmap;
use std::{fs, path::Path};

/// Image backed by a memory-mapped file on disk
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Map the file at `path` read-only.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file can not be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path)?;

        // The mapping is read-only and lives as long as this backend.
        let mmap = unsafe { Mmap::map(&file) }?;

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        self.data.get(offset..offset_end).ok_or(OutOfBounds)
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error::FileError;
    use std::path::PathBuf;

    #[test]
    fn physical() {
        let path = std::env::temp_dir().join(format!("dotsym_physical_{}.bin", std::process::id()));
        std::fs::write(&path, [0x4D, 0x5A, 0x90, 0x00, 0x03]).unwrap();

        let physical = Physical::new(&path).unwrap();
        assert_eq!(physical.len(), 5);
        assert_eq!(physical.data()[0], 0x4D);
        assert_eq!(physical.data_slice(1, 2).unwrap(), &[0x5A, 0x90]);
        assert!(physical.data_slice(4, 2).is_err());
        assert!(physical.data_slice(usize::MAX, 1).is_err());

        drop(physical);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn invalid_file_path() {
        let result = Physical::new(PathBuf::from("/nonexistent/path/to/file.dll"));
        match result {
            Err(FileError(io_error)) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected FileError"),
        }
    }
}
