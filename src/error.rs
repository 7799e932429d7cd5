//! Error taxonomy for diff and merge operations.
//!
//! Fatal variants ([`DeltaError::ManifestMissing`], [`DeltaError::ManifestParse`],
//! [`DeltaError::Extraction`], [`DeltaError::Write`]) abort the enclosing command.
//! Per-entry variants ([`DeltaError::EntryRead`], [`DeltaError::EntryClassify`]) are
//! recorded on the entry that caused them and processing continues.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeltaError {
    /// The archive has no `manifest.json` at its root
    #[error("manifest.json not found in {}", archive.display())]
    ManifestMissing { archive: PathBuf },

    /// The manifest exists but is not a usable image manifest
    #[error("Failed to parse manifest {}: {reason}", path.display())]
    ManifestParse { path: PathBuf, reason: String },

    /// A single member's content could not be read back from its archive
    #[error("Could not read entry {path}: {source}")]
    EntryRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A top-level member could not be classified as reused or new
    #[error("Could not classify entry {path}: {reason}")]
    EntryClassify { path: String, reason: String },

    /// Bulk extraction of an archive failed
    #[error("Failed to extract {}: {source}", archive.display())]
    Extraction {
        archive: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Creating or finalising an output archive failed
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeltaError {
    /// True for errors that only affect one archive member.
    pub fn is_per_entry(&self) -> bool {
        matches!(
            self,
            DeltaError::EntryRead { .. } | DeltaError::EntryClassify { .. }
        )
    }
}
