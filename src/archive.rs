//! Read, filter and write image tarballs entry by entry.
//!
//! - [`open_archive`]: open a plain or gzip-compressed tarball (detected by magic bytes).
//! - [`for_each_entry`] / [`walk_entries`]: stream every member as an [`ArchiveEntry`] plus
//!   its live content reader; the reader borrows the open archive, so it cannot outlive it.
//! - [`list_entries`]: metadata of every member, content skipped.
//! - [`EntryWriter`]: copy selected members into a new tarball, one member at a time,
//!   with per-member failures reported as values. The tarball only appears at its final
//!   path once [`EntryWriter::finish`] succeeds.
//! - [`pack_directory`]: write every non-directory under a directory tree into a tarball.

use crate::error::DeltaError;
use crate::layer_set::{self, normalize_entry_path};
use crate::notifier::Notifier;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar_rs as tar;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opens `tar_path` for sequential reading, transparently un-gzipping it.
pub fn open_archive(tar_path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open tar file: {}", tar_path.display()))?;

    let mut buf_reader = BufReader::new(file);
    let is_gzip = buf_reader
        .fill_buf()
        .context("Failed to read magic bytes from tar file")?
        .starts_with(&GZIP_MAGIC);

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(buf_reader))
    } else {
        Box::new(buf_reader)
    };

    Ok(tar::Archive::new(reader))
}

/// Metadata of one archive member.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Normalized slash-separated path (no `./` prefix, no trailing `/`)
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub link_name: Option<PathBuf>,
    utf8_path: bool,
    header: tar::Header,
}

impl ArchiveEntry {
    fn from_tar<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let raw_path = entry.path().context("Failed to get entry path")?;
        let raw = raw_path.to_string_lossy();
        let header = entry.header().clone();
        let link_name = entry
            .link_name()
            .context("Failed to get link target")?
            .map(|link| link.into_owned());

        Ok(ArchiveEntry {
            path: normalize_entry_path(&raw),
            is_dir: header.entry_type().is_dir() || raw.ends_with('/'),
            size: entry.size(),
            link_name,
            utf8_path: std::str::from_utf8(&entry.path_bytes()).is_ok(),
            header,
        })
    }

    /// False when the raw member name is not valid UTF-8 and `path` is a lossy rendering.
    pub fn has_utf8_path(&self) -> bool {
        self.utf8_path
    }

    pub fn mode(&self) -> Option<u32> {
        self.header.mode().ok()
    }

    pub fn root_segment(&self) -> &str {
        layer_set::top_level_segment(&self.path)
    }

    pub fn is_root_level(&self) -> bool {
        layer_set::is_root_level(&self.path)
    }

    /// A directory sitting directly at the archive root (a layer candidate).
    pub fn is_top_level_dir(&self) -> bool {
        self.is_dir && self.is_root_level()
    }

    /// A non-directory sitting directly at the archive root (`manifest.json`, configs, ...).
    pub fn is_loose_file(&self) -> bool {
        !self.is_dir && self.is_root_level() && !self.path.is_empty()
    }
}

/// What a visitor found out about the member it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// The member's content ran short; the archive may be cut off right after it
    ContentDamaged,
}

/// How a walk over an archive ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Walk {
    pub visited: usize,
    /// Reading stopped at an unreadable header right after a damaged member
    pub ended_early: Option<String>,
}

/// Streams every member of an open archive through `visit`, in archive order.
///
/// `visit` receives the member's content reader, positioned at the start of its data.
/// Anything it does not read is skipped. A member the visitor reports as
/// [`Visit::ContentDamaged`] usually means the archive is truncated inside it; if the next
/// header then cannot be read, the walk stops there and reports it in
/// [`Walk::ended_early`] instead of failing. Any other read error is fatal.
pub fn walk_entries<R, F>(
    archive: &mut tar::Archive<R>,
    tar_path: &Path,
    mut visit: F,
) -> Result<Walk>
where
    R: Read,
    F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<Visit>,
{
    let mut walk = Walk::default();
    let mut damaged: Option<String> = None;

    for entry_result in archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", tar_path.display()))?
    {
        let mut entry = match (entry_result, damaged.take()) {
            (Ok(entry), _) => entry,
            (Err(e), Some(after)) => {
                walk.ended_early = Some(format!("{} (after {})", e, after));
                break;
            }
            (Err(e), None) => {
                return Err(e).with_context(|| {
                    format!("Failed to read tar entry from {}", tar_path.display())
                })
            }
        };
        let record = ArchiveEntry::from_tar(&entry)?;
        if visit(&record, &mut entry)? == Visit::ContentDamaged {
            damaged = Some(record.path.clone());
        }
        walk.visited += 1;
    }

    Ok(walk)
}

/// Opens `tar_path` and walks it with [`walk_entries`]. Returns the number of members visited.
pub fn for_each_entry<F>(tar_path: &Path, mut visit: F) -> Result<usize>
where
    F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<()>,
{
    let mut archive = open_archive(tar_path)?;
    let walk = walk_entries(&mut archive, tar_path, |entry, content| {
        visit(entry, content).map(|()| Visit::Continue)
    })?;
    Ok(walk.visited)
}

/// Lists every member of `tar_path` without reading any content.
pub fn list_entries(tar_path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    for_each_entry(tar_path, |entry, _| {
        entries.push(entry.clone());
        Ok(())
    })?;
    Ok(entries)
}

fn write_error(path: &Path, source: io::Error) -> DeltaError {
    DeltaError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Copies member content into an anonymous temp file so a short or failing read
/// is caught before anything is written to the output archive.
fn spool_content(entry: &ArchiveEntry, content: &mut dyn Read) -> Result<File, DeltaError> {
    let read_error = |source: io::Error| DeltaError::EntryRead {
        path: entry.path.clone(),
        source,
    };

    let mut spool =
        tempfile::tempfile().map_err(|source| write_error(&std::env::temp_dir(), source))?;

    let copied = io::copy(&mut (&mut *content).take(entry.size), &mut spool).map_err(read_error)?;
    if copied != entry.size {
        return Err(read_error(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", entry.size, copied),
        )));
    }

    spool
        .seek(SeekFrom::Start(0))
        .map_err(|source| write_error(&std::env::temp_dir(), source))?;
    Ok(spool)
}

/// Creates a temp file next to `path`, so it can later be renamed onto it.
pub(crate) fn stage_next_to(path: &Path) -> Result<NamedTempFile, DeltaError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    NamedTempFile::new_in(parent).map_err(|source| write_error(path, source))
}

/// Moves a staged file onto `path`, replacing whatever is there.
pub(crate) fn publish(staged: NamedTempFile, path: &Path) -> Result<(), DeltaError> {
    staged
        .persist(path)
        .map(|_| ())
        .map_err(|e| write_error(path, e.error))
}

/// Writes selected members into a fresh tarball.
///
/// Each member keeps its original header (type, mode, ownership, mtime, size); names are
/// written in normalized form. Members go to a temp file in the output's directory;
/// dropping the writer without [`EntryWriter::finish`] leaves `path` untouched.
pub struct EntryWriter {
    path: PathBuf,
    builder: tar::Builder<BufWriter<NamedTempFile>>,
    appended: usize,
}

impl EntryWriter {
    /// Starts a new archive destined for `path`. Any file already there is only
    /// replaced by [`EntryWriter::finish`].
    pub fn create(path: &Path) -> Result<Self, DeltaError> {
        let staged = stage_next_to(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            builder: tar::Builder::new(BufWriter::new(staged)),
            appended: 0,
        })
    }

    /// Appends one member, reading its data from `content`.
    ///
    /// # Errors
    /// - [`DeltaError::EntryRead`] when the content cannot be read in full; nothing is
    ///   written for this member and the archive stays usable.
    /// - [`DeltaError::EntryClassify`] when the member name contains `..` or is not UTF-8.
    /// - [`DeltaError::Write`] when the output archive itself cannot be written.
    pub fn append(&mut self, entry: &ArchiveEntry, content: &mut dyn Read) -> Result<(), DeltaError> {
        let unwritable = if !entry.has_utf8_path() {
            Some("name is not valid UTF-8")
        } else if entry.path.split('/').any(|segment| segment == "..") {
            Some("path escapes the archive root")
        } else {
            None
        };
        if let Some(reason) = unwritable {
            return Err(DeltaError::EntryClassify {
                path: entry.path.clone(),
                reason: reason.to_string(),
            });
        }

        let mut header = entry.header.clone();
        let entry_type = header.entry_type();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let target = entry.link_name.as_ref().ok_or_else(|| DeltaError::EntryRead {
                path: entry.path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, "link entry without target"),
            })?;
            self.builder
                .append_link(&mut header, &entry.path, target)
                .map_err(|source| write_error(&self.path, source))?;
        } else if entry.size == 0 {
            self.builder
                .append_data(&mut header, &entry.path, io::empty())
                .map_err(|source| write_error(&self.path, source))?;
        } else {
            let spool = spool_content(entry, content)?;
            self.builder
                .append_data(&mut header, &entry.path, spool)
                .map_err(|source| write_error(&self.path, source))?;
        }

        self.appended += 1;
        Ok(())
    }

    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Writes the end-of-archive marker and moves the archive onto its final path.
    pub fn finish(self) -> Result<usize, DeltaError> {
        let path = self.path;
        let staged = self
            .builder
            .into_inner()
            .map_err(|source| write_error(&path, source))?
            .into_inner()
            .map_err(|e| write_error(&path, e.into_error()))?;
        publish(staged, &path)?;
        Ok(self.appended)
    }
}

/// Packs every file and symlink below `root` into a new tarball at `output`.
///
/// Member names are paths relative to `root`. Directories get no entries of their own;
/// symlinks are stored as links, never followed. Members are added in file-name order.
/// `output` is only replaced once the whole tarball has been written.
pub fn pack_directory(root: &Path, output: &Path, notifier: &Notifier) -> Result<usize> {
    let mut members = Vec::new();
    for dir_entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let dir_entry =
            dir_entry.with_context(|| format!("Failed to walk directory: {}", root.display()))?;
        if !dir_entry.file_type().is_dir() {
            members.push(dir_entry.into_path());
        }
    }

    let staged = stage_next_to(output)?;
    let mut builder = tar::Builder::new(BufWriter::new(staged));
    builder.follow_symlinks(false);

    let total = members.len() as u64;
    let progress_bar = notifier.create_progress_bar(total, "Packing merged image");

    for (i, member) in members.iter().enumerate() {
        let rel_path = member
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", member.display(), root.display()))?;
        notifier.trace(&format!("Adding {}", rel_path.display()));

        builder
            .append_path_with_name(member, rel_path)
            .map_err(|source| write_error(output, source))?;

        match &progress_bar {
            Some(progress_bar) => progress_bar.inc(1),
            None => notifier.progress(i as u64 + 1, total, "Packing merged image"),
        }
    }

    let staged = builder
        .into_inner()
        .map_err(|source| write_error(output, source))?
        .into_inner()
        .map_err(|e| write_error(output, e.into_error()))?;
    publish(staged, output)?;

    if let Some(progress_bar) = progress_bar {
        progress_bar.finish_and_clear();
    }

    Ok(members.len())
}
