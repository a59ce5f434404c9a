//! Multi-Stream Format (MSF 7.00) container.
//!
//! A legacy PDB is a paged file holding numbered streams. Page 0 is the superblock:
//!
//! ```text
//! magic[32] page_size free_page_map page_count directory_size reserved directory_root[]
//! ```
//!
//! `directory_root` lists the pages that hold the page numbers of the stream directory. The
//! directory itself is `stream_count, sizes[stream_count], pages[..]` where every stream lists
//! `ceil(size / page_size)` page numbers. A size of `0xFFFF_FFFF` marks a deleted stream.
//!
//! Pages 1 and 2 of every `page_size` page interval are reserved for the free page maps.

use tracing::{debug, trace};

use crate::{
    file::io::read_le_at,
    writer::BinaryWriter,
    Error::OutOfBounds,
    Result,
};

/// The 32 byte MSF 7.00 signature
pub const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// Page sizes accepted by readers
pub const PAGE_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

const NIL_STREAM_SIZE: u32 = 0xFFFF_FFFF;
const SUPERBLOCK_FIXED_SIZE: usize = 52;

fn pages_for(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size)
}

/// The streams of an MSF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msf {
    page_size: u32,
    streams: Vec<Vec<u8>>,
}

impl Msf {
    /// Read every stream of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad signature or page size and
    /// [`crate::Error::OutOfBounds`] if a page number points past the end of the file.
    pub fn parse(data: &[u8]) -> Result<Msf> {
        if data.len() < SUPERBLOCK_FIXED_SIZE || &data[..32] != MSF_MAGIC {
            return Err(malformed_error!("Not an MSF 7.00 file"));
        }

        let mut cursor = 32;
        let page_size = read_le_at::<u32>(data, &mut cursor)?;
        let _free_page_map = read_le_at::<u32>(data, &mut cursor)?;
        let page_count = read_le_at::<u32>(data, &mut cursor)?;
        let directory_size = read_le_at::<u32>(data, &mut cursor)? as usize;
        let _reserved = read_le_at::<u32>(data, &mut cursor)?;

        if !PAGE_SIZES.contains(&page_size) {
            return Err(malformed_error!("Invalid MSF page size {}", page_size));
        }
        let page_size_usize = page_size as usize;
        if (page_count as usize).saturating_mul(page_size_usize) > data.len() {
            debug!(
                page_count,
                len = data.len(),
                "MSF page count exceeds the file, trusting page numbers only"
            );
        }

        let directory_pages = pages_for(directory_size, page_size_usize);
        let root_pages = pages_for(directory_pages * 4, page_size_usize);
        let mut directory_page_list = Vec::with_capacity(directory_pages);
        for _ in 0..root_pages {
            let root = read_le_at::<u32>(data, &mut cursor)?;
            let root_page = read_page(data, root, page_size_usize)?;
            let mut inner = 0;
            while inner < page_size_usize && directory_page_list.len() < directory_pages {
                directory_page_list.push(read_le_at::<u32>(root_page, &mut inner)?);
            }
        }

        let directory = gather(data, &directory_page_list, directory_size, page_size_usize)?;

        let mut cursor = 0;
        let stream_count = read_le_at::<u32>(&directory, &mut cursor)? as usize;
        if stream_count > directory.len() / 4 {
            return Err(OutOfBounds);
        }
        let mut sizes = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            sizes.push(read_le_at::<u32>(&directory, &mut cursor)?);
        }

        let mut streams = Vec::with_capacity(stream_count);
        for size in sizes {
            if size == NIL_STREAM_SIZE || size == 0 {
                streams.push(Vec::new());
                continue;
            }
            let size = size as usize;
            let count = pages_for(size, page_size_usize);
            let mut pages = Vec::with_capacity(count);
            for _ in 0..count {
                pages.push(read_le_at::<u32>(&directory, &mut cursor)?);
            }
            streams.push(gather(data, &pages, size, page_size_usize)?);
        }

        trace!(page_size, streams = streams.len(), "parsed MSF directory");
        Ok(Msf { page_size, streams })
    }

    /// Page size of the file
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of streams, including empty ones
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Content of stream `index`, `None` if it does not exist
    #[must_use]
    pub fn stream(&self, index: u32) -> Option<&[u8]> {
        self.streams.get(index as usize).map(Vec::as_slice)
    }
}

fn read_page(data: &[u8], number: u32, page_size: usize) -> Result<&[u8]> {
    let start = (number as usize)
        .checked_mul(page_size)
        .ok_or(OutOfBounds)?;
    let end = start.checked_add(page_size).ok_or(OutOfBounds)?;
    // The last page of a file may be short
    data.get(start..end.min(data.len()))
        .filter(|page| !page.is_empty())
        .ok_or(OutOfBounds)
}

fn gather(data: &[u8], pages: &[u32], size: usize, page_size: usize) -> Result<Vec<u8>> {
    let mut content = Vec::with_capacity(size);
    for number in pages {
        let chunk = read_page(data, *number, page_size)?;
        let take = (size - content.len()).min(chunk.len());
        content.extend_from_slice(&chunk[..take]);
    }
    if content.len() < size {
        return Err(OutOfBounds);
    }
    Ok(content)
}

/// Lays out streams into an MSF file.
#[derive(Debug, Clone)]
pub struct MsfWriter {
    page_size: u32,
    streams: Vec<Vec<u8>>,
}

impl MsfWriter {
    /// An empty file with the given page size.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the page size is not one of [`PAGE_SIZES`].
    pub fn new(page_size: u32) -> Result<Self> {
        if !PAGE_SIZES.contains(&page_size) {
            return Err(malformed_error!("Invalid MSF page size {}", page_size));
        }
        Ok(MsfWriter {
            page_size,
            streams: Vec::new(),
        })
    }

    /// Append a stream and return its index
    pub fn add_stream(&mut self, data: Vec<u8>) -> u32 {
        self.streams.push(data);
        (self.streams.len() - 1) as u32
    }

    /// Replace the content of stream `index`, adding empty streams up to it
    pub fn set_stream(&mut self, index: u32, data: Vec<u8>) {
        let index = index as usize;
        if self.streams.len() <= index {
            self.streams.resize(index + 1, Vec::new());
        }
        self.streams[index] = data;
    }

    /// Number of streams added so far
    #[must_use]
    pub fn stream_count(&self) -> u32 {
        self.streams.len() as u32
    }

    fn is_free_page_map(&self, page: u32) -> bool {
        matches!(page % self.page_size, 1 | 2)
    }

    fn allocate(&self, next: &mut u32, count: usize) -> Vec<u32> {
        let mut pages = Vec::with_capacity(count);
        while pages.len() < count {
            if !self.is_free_page_map(*next) {
                pages.push(*next);
            }
            *next += 1;
        }
        pages
    }

    /// Serialize the file.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the directory root list does not fit into the
    /// superblock.
    pub fn write(self) -> Result<Vec<u8>> {
        let page_size = self.page_size as usize;
        let mut next_page = 1;

        let stream_pages: Vec<Vec<u32>> = self
            .streams
            .iter()
            .map(|stream| self.allocate(&mut next_page, pages_for(stream.len(), page_size)))
            .collect();

        let mut directory = BinaryWriter::new();
        directory.write_u32(self.streams.len() as u32)?;
        for stream in &self.streams {
            directory.write_u32(stream.len() as u32)?;
        }
        for pages in &stream_pages {
            for page in pages {
                directory.write_u32(*page)?;
            }
        }
        let directory = directory.into_vec();
        let directory_pages = self.allocate(&mut next_page, pages_for(directory.len(), page_size));

        let mut root_content = BinaryWriter::new();
        for page in &directory_pages {
            root_content.write_u32(*page)?;
        }
        let root_content = root_content.into_vec();
        let root_pages = self.allocate(&mut next_page, pages_for(root_content.len(), page_size));
        if SUPERBLOCK_FIXED_SIZE + root_pages.len() * 4 > page_size {
            return Err(malformed_error!("MSF directory too large for page size {}", page_size));
        }

        let page_count = next_page.max(3);
        let mut file = vec![0u8; page_count as usize * page_size];

        let mut superblock = BinaryWriter::new();
        superblock.write_bytes(MSF_MAGIC)?;
        superblock.write_u32(self.page_size)?;
        superblock.write_u32(1)?;
        superblock.write_u32(page_count)?;
        superblock.write_u32(directory.len() as u32)?;
        superblock.write_u32(0)?;
        for page in &root_pages {
            superblock.write_u32(*page)?;
        }
        let superblock = superblock.into_vec();
        file[..superblock.len()].copy_from_slice(&superblock);

        // Every page up to page_count is in use; the bits for pages past the end mark them free
        let map_bytes = page_size.min(file.len() - page_size);
        for bit in page_count as usize..map_bytes * 8 {
            file[page_size + bit / 8] |= 1 << (bit % 8);
        }

        scatter(&mut file, &root_content, &root_pages, page_size);
        scatter(&mut file, &directory, &directory_pages, page_size);
        for (stream, pages) in self.streams.iter().zip(&stream_pages) {
            scatter(&mut file, stream, pages, page_size);
        }

        debug!(
            page_size,
            page_count,
            streams = self.streams.len(),
            "wrote MSF file"
        );
        Ok(file)
    }
}

fn scatter(file: &mut [u8], content: &[u8], pages: &[u32], page_size: usize) {
    for (chunk, page) in content.chunks(page_size).zip(pages) {
        let start = *page as usize * page_size;
        file[start..start + chunk.len()].copy_from_slice(chunk);
    }
}
