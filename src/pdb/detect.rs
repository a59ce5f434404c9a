//! Format detection, conversion and discovery of the PDB that belongs to an image.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotsym::pdb::{load_for_image, DiscoveryOptions};
//! use std::path::Path;
//!
//! let options = DiscoveryOptions::default().with_search_path("/symbols");
//! if let Some(info) = load_for_image(Path::new("App.dll"), &options)? {
//!     println!("{} functions", info.functions.len());
//! }
//! # Ok::<(), dotsym::Error>(())
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::{
    file::File,
    pdb::{
        msf::MSF_MAGIC, portable::METADATA_SIGNATURE, read_legacy, read_portable, write_legacy,
        PdbFormat, PdbInfo, PdbWriterOptions,
    },
    Result,
};

/// Where [`find_associated_pdb`] looks for symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Directories searched for the PDB file name, in order
    pub search_paths: Vec<PathBuf>,
    /// Try the path recorded in the image's CodeView record first
    pub use_codeview_path: bool,
}

impl DiscoveryOptions {
    /// Only look next to the image
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a search directory
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            search_paths: Vec::new(),
            use_codeview_path: true,
        }
    }
}

/// Identify the format of PDB data from its leading bytes
#[must_use]
pub fn sniff(data: &[u8]) -> Option<PdbFormat> {
    let format = if data.starts_with(&METADATA_SIGNATURE.to_le_bytes()) {
        Some(PdbFormat::Portable)
    } else if data.starts_with(MSF_MAGIC) {
        Some(PdbFormat::Legacy)
    } else {
        None
    };
    trace!(?format, len = data.len(), "sniffed pdb format");
    format
}

/// Decode PDB data of either format.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] if the data is neither format, or the decoder's error.
pub fn load_pdb(data: &[u8]) -> Result<PdbInfo> {
    match sniff(data) {
        Some(PdbFormat::Portable) => read_portable(data),
        Some(PdbFormat::Legacy) => read_legacy(data),
        None => Err(crate::Error::NotSupported),
    }
}

/// Decode PDB data of either format and serialize it as a legacy PDB with the given page size
///
/// # Errors
/// Returns an error if decoding fails or the page size is invalid.
pub fn convert_to_legacy(data: &[u8], page_size: u32) -> Result<Vec<u8>> {
    let info = load_pdb(data)?;
    let options = PdbWriterOptions {
        page_size,
        guid: info.guid,
        age: info.age,
        source_server_data: info.source_server_data.clone(),
        ..PdbWriterOptions::default()
    };
    write_legacy(&info, &options)
}

/// File name part of a path recorded on any platform
fn file_name(recorded: &str) -> Option<&str> {
    recorded
        .rsplit(['\\', '/'])
        .next()
        .filter(|name| !name.is_empty())
}

/// Locate the PDB of the image at `image_path`.
///
/// Candidates in order: the CodeView path, the image path with a `.pdb` extension, the CodeView
/// file name next to the image, then the file name in every search path. The first existing
/// file wins.
#[must_use]
pub fn find_associated_pdb(
    image_path: &Path,
    file: &File,
    options: &DiscoveryOptions,
) -> Option<PathBuf> {
    let codeview = match file.codeview() {
        Ok(codeview) => codeview,
        Err(error) => {
            debug!(%error, "ignoring unreadable debug directory");
            None
        }
    };

    let mut candidates = Vec::new();
    if let Some(codeview) = &codeview {
        if options.use_codeview_path && !codeview.path.is_empty() {
            candidates.push(PathBuf::from(&codeview.path));
        }
    }
    candidates.push(image_path.with_extension("pdb"));

    let pdb_name = codeview
        .as_ref()
        .and_then(|codeview| file_name(&codeview.path))
        .map(str::to_string)
        .or_else(|| {
            image_path
                .with_extension("pdb")
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        });
    if let Some(name) = &pdb_name {
        if let Some(directory) = image_path.parent() {
            candidates.push(directory.join(name));
        }
        for directory in &options.search_paths {
            candidates.push(directory.join(name));
        }
    }

    let found = candidates.into_iter().find(|candidate| candidate.is_file());
    trace!(image = %image_path.display(), found = ?found, "pdb discovery");
    found
}

/// Load the symbols of the image at `path`; `Ok(None)` if no PDB is found.
///
/// A PDB whose guid differs from the image's CodeView record is still returned, with a warning.
///
/// # Errors
/// Returns an error if the image or the PDB can not be read or decoded.
pub fn load_for_image(path: &Path, options: &DiscoveryOptions) -> Result<Option<PdbInfo>> {
    let file = File::from_file(path)?;
    let Some(pdb_path) = find_associated_pdb(path, &file, options) else {
        debug!(image = %path.display(), "no pdb found");
        return Ok(None);
    };

    let info = load_pdb(&std::fs::read(&pdb_path)?)?;
    if let Some(codeview) = file.codeview()? {
        if codeview.guid != info.guid {
            warn!(
                pdb = %pdb_path.display(),
                expected = %codeview.guid,
                found = %info.guid,
                "pdb does not match the image"
            );
        }
    }
    Ok(Some(info))
}
