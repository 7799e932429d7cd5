//! Layer identifiers declared by an image archive's `manifest.json`.
//!
//! A `docker save` tarball carries a `manifest.json` at its root: a JSON array whose first
//! element lists the image's layers in order, e.g. `"3f2a.../layer.tar"`. The first path
//! segment of each entry is the layer's identifier, which is also the name of the top-level
//! directory holding it inside the archive.
//!
//! - [`top_level_segment`] / [`is_root_level`] / [`normalize_entry_path`]: the path parsing
//!   shared by manifest reading and diff classification.
//! - [`read_manifest`]: load and validate `manifest.json` from an extracted archive.
//! - [`extract_layer_identifiers`]: extract an archive to a scratch directory and build its
//!   [`LayerSet`].

use crate::error::DeltaError;
use crate::notifier::Notifier;
use crate::tar_extractor;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";

/// First segment of a slash-separated archive path (the whole path if it has no `/`).
pub fn top_level_segment(path: &str) -> &str {
    path.split_once('/').map_or(path, |(head, _)| head)
}

/// True when the path names something directly at the archive root.
pub fn is_root_level(path: &str) -> bool {
    !path.contains('/')
}

/// Strips `./` and `/` prefixes and trailing slashes from a tar member name.
pub fn normalize_entry_path(raw: &str) -> String {
    let mut path = raw;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    let path = path.trim_end_matches('/');
    if path == "." {
        String::new()
    } else {
        path.to_string()
    }
}

/// One image described by `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config", default)]
    pub config: Option<String>,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Reads the first image of `manifest.json` from an extracted archive rooted at
/// `extract_dir`. Further images are neither used nor validated.
///
/// `archive` is only used to name the source in errors.
pub fn read_manifest(extract_dir: &Path, archive: &Path) -> Result<ManifestEntry, DeltaError> {
    let manifest_path = extract_dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(DeltaError::ManifestMissing {
            archive: archive.to_path_buf(),
        });
    }

    let parse_error = |reason: String| DeltaError::ManifestParse {
        path: manifest_path.clone(),
        reason,
    };

    let content = fs::read_to_string(&manifest_path).map_err(|e| parse_error(e.to_string()))?;
    let images: Vec<serde_json::Value> =
        serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;

    let first = images
        .into_iter()
        .next()
        .ok_or_else(|| parse_error("manifest lists no images".to_string()))?;

    serde_json::from_value(first).map_err(|e| parse_error(e.to_string()))
}

/// Unique layer identifiers of one image, in manifest order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerSet {
    ordered: Vec<String>,
    members: HashSet<String>,
}

impl LayerSet {
    /// Builds the set from manifest layer paths; duplicate identifiers collapse.
    pub fn from_layer_paths<I, S>(layer_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = LayerSet::default();
        for layer_path in layer_paths {
            let id = top_level_segment(&normalize_entry_path(layer_path.as_ref())).to_string();
            if set.members.insert(id.clone()) {
                set.ordered.push(id);
            }
        }
        set
    }

    pub fn from_manifest(image: &ManifestEntry) -> Self {
        Self::from_layer_paths(&image.layers)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn identifiers(&self) -> &[String] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Extracts `image_archive` into a private scratch directory and returns the layer
/// identifiers its manifest declares.
///
/// The scratch directory is removed when this returns, on success or failure.
///
/// # Errors
/// - [`DeltaError::Extraction`] when the archive cannot be unpacked.
/// - [`DeltaError::ManifestMissing`] when there is no `manifest.json` at its root.
/// - [`DeltaError::ManifestParse`] when the manifest's first image has no `Layers`.
pub fn extract_layer_identifiers(image_archive: &Path, notifier: &Notifier) -> Result<LayerSet> {
    notifier.debug(&format!(
        "Reading layer identifiers from {}",
        image_archive.display()
    ));

    let temp_dir = tempfile::tempdir().context("Failed to create temporary directory")?;

    tar_extractor::extract_tar(image_archive, temp_dir.path(), notifier).map_err(|source| {
        DeltaError::Extraction {
            archive: image_archive.to_path_buf(),
            source,
        }
    })?;

    let image = read_manifest(temp_dir.path(), image_archive)?;
    notifier.debug(&format!(
        "Image config: {}, tags: {}",
        image.config.as_deref().unwrap_or("-"),
        image.repo_tags.as_deref().unwrap_or_default().join(", ")
    ));

    let layers = LayerSet::from_manifest(&image);
    notifier.debug(&format!(
        "Found {} layers: {}",
        layers.len(),
        layers.identifiers().join(", ")
    ));

    Ok(layers)
}
