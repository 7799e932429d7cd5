//! Rebuild a full image tarball from a base image tarball and a diff tarball.
//!
//! [`merge_images`] extracts both tarballs into a private workspace, copies the base tree
//! and then the diff tree into a merged tree (diff wins on every path collision), checks
//! the diff's `manifest.json`, and packs the merged tree into the output tarball.
//! The workspace is a [`tempfile::TempDir`] and is removed however the merge ends.

use crate::archive;
use crate::error::DeltaError;
use crate::layer_set;
use crate::notifier::Notifier;
use crate::tar_extractor;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub output: PathBuf,
    /// Layers declared by the diff's manifest (reported only, not used for ordering)
    pub manifest_layers: usize,
    pub files_packed: usize,
}

/// Scratch directories owned by a single merge.
struct MergeWorkspace {
    _temp_dir: TempDir,
    base: PathBuf,
    diff: PathBuf,
    merged: PathBuf,
}

impl MergeWorkspace {
    fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir().context("Failed to create temporary directory")?;
        let base = temp_dir.path().join("base");
        let diff = temp_dir.path().join("diff");
        let merged = temp_dir.path().join("merged");

        for dir in [&base, &diff, &merged] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        Ok(Self {
            _temp_dir: temp_dir,
            base,
            diff,
            merged,
        })
    }
}

/// Removes whatever occupies `path` unless it is already a real directory.
fn make_room_for_dir(path: &Path) -> Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if !metadata.is_dir() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove file: {}", path.display()))?;
        }
    }
    Ok(())
}

/// Removes whatever occupies `path` so a file or symlink can be written there.
fn make_room_for_file(path: &Path) -> Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.is_dir() {
            fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove directory: {}", path.display()))?;
        } else {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove file: {}", path.display()))?;
        }
    }
    Ok(())
}

/// Copies the tree under `src` into `dest`, replacing anything already at the same paths.
///
/// Directories are merged (union of children); files and symlinks are replaced whole.
/// Symlinks are copied as symlinks. Returns the number of files and symlinks copied.
pub fn overlay_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0usize;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", src.display()))?;
        let rel_path = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} is outside {}", entry.path().display(), src.display()))?;
        let target = dest.join(rel_path);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            make_room_for_dir(&target)?;
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
            continue;
        }

        make_room_for_file(&target)?;

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink: {}", entry.path().display()))?;

            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).with_context(|| {
                format!(
                    "Failed to create symlink {} -> {}",
                    target.display(),
                    link.display()
                )
            })?;

            #[cfg(not(unix))]
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy symlink target {}", link.display())
            })?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }

        copied += 1;
    }

    Ok(copied)
}

fn extract_into(archive_path: &Path, dir: &Path, notifier: &Notifier) -> Result<usize, DeltaError> {
    tar_extractor::extract_tar(archive_path, dir, notifier).map_err(|source| {
        DeltaError::Extraction {
            archive: archive_path.to_path_buf(),
            source,
        }
    })
}

/// Reconstructs a full image tarball at `output` from `base_archive` plus `diff_archive`.
///
/// Output members are the merged tree's files and symlinks in file-name order, named
/// relative to the tree root, with no directory entries. An existing file at `output` is
/// overwritten.
///
/// # Errors
/// - [`DeltaError::Extraction`] when either tarball cannot be extracted.
/// - [`DeltaError::ManifestMissing`] / [`DeltaError::ManifestParse`] when the diff has no
///   usable `manifest.json`.
/// - [`DeltaError::Write`] when the output tarball cannot be written.
pub fn merge_images(
    base_archive: &Path,
    diff_archive: &Path,
    output: &Path,
    notifier: &Notifier,
) -> Result<MergeSummary> {
    notifier.info(&format!(
        "Starting image merge: {} + {} -> {}",
        base_archive.display(),
        diff_archive.display(),
        output.display()
    ));

    let workspace = MergeWorkspace::new()?;

    notifier.info(&format!("Extracting base image: {}", base_archive.display()));
    let base_entries = extract_into(base_archive, &workspace.base, notifier)?;

    notifier.info(&format!("Extracting diff image: {}", diff_archive.display()));
    let diff_entries = extract_into(diff_archive, &workspace.diff, notifier)?;
    notifier.debug(&format!(
        "Extracted {} base entries and {} diff entries",
        base_entries, diff_entries
    ));

    notifier.info("Merging files");
    overlay_tree(&workspace.base, &workspace.merged).context("Failed to copy base tree")?;
    let overridden =
        overlay_tree(&workspace.diff, &workspace.merged).context("Failed to overlay diff tree")?;
    notifier.debug(&format!("Overlaid {} files from diff", overridden));

    let image = layer_set::read_manifest(&workspace.diff, diff_archive)?;
    let manifest_layers = image.layers.len();
    notifier.info(&format!("Found {} layers in manifest", manifest_layers));
    if let Some(config) = &image.config {
        notifier.debug(&format!("Diff image config: {}", config));
    }

    notifier.info(&format!("Creating output tar: {}", output.display()));
    let files_packed = archive::pack_directory(&workspace.merged, output, notifier)?;

    notifier.info(&format!(
        "Successfully merged image created at: {}",
        output.display()
    ));

    Ok(MergeSummary {
        output: output.to_path_buf(),
        manifest_layers,
        files_packed,
    })
}
