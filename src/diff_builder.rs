//! Build a minimal diff tarball of a new image against a base image's layers.
//!
//! [`build_diff`] walks the new image tarball once, in archive order:
//! 1. every top-level directory is classified [`Classification::Reused`] when the base
//!    [`LayerSet`] declares it, [`Classification::New`] otherwise;
//! 2. members under a `New` directory, and loose top-level files (`manifest.json`, image
//!    configs, ...), are copied into the diff tarball;
//! 3. reused layer names are written to the side-car `<diff>.json`.
//!
//! Per-member problems never abort the walk: they come back as
//! [`EntryOutcome::Skipped`] and are listed in the [`DiffSummary`]. A tarball cut off
//! inside a copied member yields a diff of everything before the cut.
//!
//! Neither the diff nor its side-car replaces an existing file until the whole run has
//! succeeded.

use crate::archive::{self, ArchiveEntry, EntryWriter, Visit};
use crate::error::DeltaError;
use crate::layer_set::{self, LayerSet};
use crate::notifier::Notifier;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const SIDECAR_SUFFIX: &str = ".json";

const BYTES_PER_MEGABYTE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Reused,
    New,
}

/// Classifies one top-level directory name against the base layers.
pub fn classify_top_level(name: &str, base: &LayerSet) -> Result<Classification, DeltaError> {
    let reason = match name {
        "" => Some("empty name"),
        "." | ".." => Some("relative name"),
        _ if name.contains('\0') => Some("NUL in name"),
        _ => None,
    };
    if let Some(reason) = reason {
        return Err(DeltaError::EntryClassify {
            path: name.to_string(),
            reason: reason.to_string(),
        });
    }

    if base.contains(name) {
        Ok(Classification::Reused)
    } else {
        Ok(Classification::New)
    }
}

/// Classifies the top-level directory `entry`, rejecting names that are not UTF-8.
fn classify_entry(entry: &ArchiveEntry, base: &LayerSet) -> Result<Classification, DeltaError> {
    if !entry.has_utf8_path() {
        return Err(DeltaError::EntryClassify {
            path: entry.path.clone(),
            reason: "name is not valid UTF-8".to_string(),
        });
    }
    classify_top_level(entry.root_segment(), base)
}

/// Path of the side-car file listing reused layers: `<diff_path>.json`.
pub fn sidecar_path(diff_path: &Path) -> PathBuf {
    let mut name = OsString::from(diff_path.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: DeltaError,
}

#[derive(Debug)]
pub enum EntryOutcome {
    Included { size: u64 },
    Skipped(SkippedEntry),
}

/// Classification of top-level names, in first-encounter order.
///
/// A name seen twice keeps its latest classification.
#[derive(Debug, Default)]
struct Classifier {
    classes: HashMap<String, Classification>,
    order: Vec<String>,
}

impl Classifier {
    fn record(&mut self, name: &str, class: Classification) {
        if self.classes.insert(name.to_string(), class).is_none() {
            self.order.push(name.to_string());
        }
    }

    fn names_with(&self, class: Classification) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.classes.get(name.as_str()) == Some(&class))
            .cloned()
            .collect()
    }

    /// Whether a member belongs in the diff, given everything classified so far.
    fn includes(&self, entry: &ArchiveEntry) -> bool {
        entry.is_loose_file()
            || self.classes.get(entry.root_segment()) == Some(&Classification::New)
    }
}

/// Result of a [`build_diff`] run.
#[derive(Debug)]
pub struct DiffSummary {
    pub output: PathBuf,
    pub sidecar: PathBuf,
    /// Layers found in both images, in archive order; written to the side-car
    pub reused_layers: Vec<String>,
    pub new_layers: Vec<String>,
    pub included_entries: usize,
    /// Bytes of member data written to the diff
    pub total_bytes: u64,
    pub skipped: Vec<SkippedEntry>,
}

impl DiffSummary {
    pub fn transfer_megabytes(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_MEGABYTE
    }

    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "=== compare between two images ===".to_string(),
            format!("- reused layers: {}", self.reused_layers.len()),
            format!("- new layers: {}", self.new_layers.len()),
            format!("- transfer size: {:.2} MB", self.transfer_megabytes()),
            format!("- diff file: {}", self.output.display()),
        ];
        if !self.skipped.is_empty() {
            lines.push(format!("- skipped entries: {}", self.skipped.len()));
            for skipped in &self.skipped {
                lines.push(format!("  - {}: {}", skipped.path, skipped.reason));
            }
        }
        lines.push("=======================".to_string());
        lines
    }
}

/// Writes the side-car content to a temp file next to `path`; published after the diff.
fn stage_sidecar(path: &Path, reused_layers: &[String]) -> Result<NamedTempFile, DeltaError> {
    let to_write_error = |source: std::io::Error| DeltaError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(archive::stage_next_to(path)?);
    serde_json::to_writer(&mut writer, reused_layers).map_err(|e| to_write_error(e.into()))?;
    writer
        .into_inner()
        .map_err(|e| to_write_error(e.into_error()))
}

fn copy_entry(writer: &mut EntryWriter, entry: &ArchiveEntry, content: &mut dyn Read) -> Result<EntryOutcome, DeltaError> {
    match writer.append(entry, content) {
        Ok(()) => Ok(EntryOutcome::Included { size: entry.size }),
        Err(reason) if reason.is_per_entry() => Ok(EntryOutcome::Skipped(SkippedEntry {
            path: entry.path.clone(),
            reason,
        })),
        Err(fatal) => Err(fatal),
    }
}

/// Writes the diff of `new_archive` against `base` to `output`, plus the
/// `<output>.json` side-car listing reused layers.
///
/// Any file already at `output` is replaced, but only once the diff is complete; on
/// error the previous diff and side-car are left as they were. Members are handled in
/// archive order, so a member listed before its top-level directory is not included.
///
/// # Errors
/// Fails when `new_archive` cannot be read as a tarball, or when the diff or its
/// side-car cannot be written. Unreadable or unclassifiable members are skipped and
/// reported in [`DiffSummary::skipped`] instead; if the tarball ends inside such a
/// member, the members read so far still make up the diff.
pub fn build_diff(
    new_archive: &Path,
    base: &LayerSet,
    output: &Path,
    notifier: &Notifier,
) -> Result<DiffSummary> {
    notifier.info(&format!(
        "Comparing {} against {} base layers",
        new_archive.display(),
        base.len()
    ));

    let mut source = archive::open_archive(new_archive)
        .with_context(|| format!("Failed to open image tarball: {}", new_archive.display()))?;

    let mut writer = EntryWriter::create(output)?;
    let mut classifier = Classifier::default();
    let mut skipped = Vec::new();
    let mut included_entries = 0usize;
    let mut total_bytes = 0u64;

    let walk = archive::walk_entries(&mut source, new_archive, |entry, content| {
        if entry.path.is_empty() {
            // The archive root itself ("./")
            return Ok(Visit::Continue);
        }

        if entry.is_top_level_dir() {
            match classify_entry(entry, base) {
                Ok(class) => {
                    notifier.debug(&format!("{}: {:?}", entry.path, class));
                    classifier.record(entry.root_segment(), class);
                }
                Err(reason) => {
                    notifier.warn(&format!("Could not process {}: {}", entry.path, reason));
                    skipped.push(SkippedEntry {
                        path: entry.path.clone(),
                        reason,
                    });
                }
            }
        }

        if !classifier.includes(entry) {
            return Ok(Visit::Continue);
        }

        let visit = match copy_entry(&mut writer, entry, content)? {
            EntryOutcome::Included { size } => {
                notifier.trace(&format!("Added {} ({} bytes)", entry.path, size));
                included_entries += 1;
                total_bytes += size;
                Visit::Continue
            }
            EntryOutcome::Skipped(skip) => {
                notifier.warn(&format!(
                    "Could not add {} to diff: {}",
                    skip.path, skip.reason
                ));
                let visit = match skip.reason {
                    DeltaError::EntryRead { .. } => Visit::ContentDamaged,
                    _ => Visit::Continue,
                };
                skipped.push(skip);
                visit
            }
        };
        Ok(visit)
    })
    .with_context(|| format!("Failed to read image tarball: {}", new_archive.display()))?;

    if let Some(reason) = &walk.ended_early {
        notifier.warn(&format!(
            "{} ends early, remaining entries are not in the diff: {}",
            new_archive.display(),
            reason
        ));
    }
    notifier.debug(&format!("Visited {} entries", walk.visited));

    let reused_layers = classifier.names_with(Classification::Reused);
    let new_layers = classifier.names_with(Classification::New);

    let sidecar = sidecar_path(output);
    let staged_sidecar = stage_sidecar(&sidecar, &reused_layers)?;
    writer.finish()?;
    archive::publish(staged_sidecar, &sidecar)?;

    let summary = DiffSummary {
        output: output.to_path_buf(),
        sidecar,
        reused_layers,
        new_layers,
        included_entries,
        total_bytes,
        skipped,
    };

    notifier.info(&format!(
        "total {:.2} MB to transfer",
        summary.transfer_megabytes()
    ));
    notifier.info(&format!("kept old layers: {}", summary.reused_layers.len()));
    notifier.info(&format!("new layers: {}", summary.new_layers.len()));

    Ok(summary)
}

/// Reads the base image's layers and writes the diff of `new_image` against them.
///
/// Returns `Ok(None)` without touching `output` when the base image has no
/// `manifest.json`; the failure is logged. Every other error propagates.
pub fn compare_images(
    base_image: &Path,
    new_image: &Path,
    output: &Path,
    notifier: &Notifier,
) -> Result<Option<DiffSummary>> {
    let base_layers = match layer_set::extract_layer_identifiers(base_image, notifier) {
        Ok(layers) => layers,
        Err(e) if matches!(e.downcast_ref::<DeltaError>(), Some(DeltaError::ManifestMissing { .. })) => {
            notifier.error(&format!("Failed to extract base image layers info: {}", e));
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to read base image layers: {}", base_image.display())
            })
        }
    };

    let summary = build_diff(new_image, &base_layers, output, notifier)?;
    for line in summary.report_lines() {
        notifier.info(&line);
    }

    Ok(Some(summary))
}
