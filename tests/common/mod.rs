//! Shared fixtures for integration tests: synthetic `docker save` style tarballs.

#![allow(dead_code)]

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tar_rs as tar;

enum FixtureEntry {
    Dir(String),
    RawDir(Vec<u8>),
    File(String, Vec<u8>),
    Fifo(String),
}

/// Builder for an image tarball laid out like `docker save` output:
/// one top-level directory per layer plus loose `manifest.json` / config files.
#[derive(Default)]
pub struct ImageFixture {
    entries: Vec<FixtureEntry>,
}

impl ImageFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.entries.push(FixtureEntry::Dir(path.to_string()));
        self
    }

    /// A directory whose name is written byte for byte, UTF-8 or not.
    pub fn raw_dir(mut self, name: &[u8]) -> Self {
        self.entries.push(FixtureEntry::RawDir(name.to_vec()));
        self
    }

    pub fn fifo(mut self, path: &str) -> Self {
        self.entries.push(FixtureEntry::Fifo(path.to_string()));
        self
    }

    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        self.entries
            .push(FixtureEntry::File(path.to_string(), content.to_vec()));
        self
    }

    /// Adds a layer directory with `VERSION`, `json` and `layer.tar` members.
    pub fn layer(self, id: &str, layer_tar: &[u8]) -> Self {
        self.dir(id)
            .file(&format!("{id}/VERSION"), b"1.0")
            .file(&format!("{id}/json"), format!("{{\"id\":\"{id}\"}}").as_bytes())
            .file(&format!("{id}/layer.tar"), layer_tar)
    }

    pub fn manifest(self, layer_ids: &[&str]) -> Self {
        let content = manifest_json(layer_ids);
        self.file("manifest.json", content.as_bytes())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut builder = tar::Builder::new(File::create(path)?);
        for entry in &self.entries {
            match entry {
                FixtureEntry::Dir(path) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder.append_data(&mut header, path, std::io::empty())?;
                }
                FixtureEntry::RawDir(name) => {
                    let mut header = tar::Header::new_gnu();
                    header.as_old_mut().name[..name.len()].copy_from_slice(name);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append(&header, std::io::empty())?;
                }
                FixtureEntry::Fifo(path) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Fifo);
                    header.set_size(0);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, path, std::io::empty())?;
                }
                FixtureEntry::File(path, content) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, path, content.as_slice())?;
                }
            }
        }
        builder.into_inner()?.flush()?;
        Ok(())
    }
}

pub fn manifest_json(layer_ids: &[&str]) -> String {
    let layers: Vec<String> = layer_ids
        .iter()
        .map(|id| format!("{id}/layer.tar"))
        .collect();
    serde_json::json!([{
        "Config": "config.json",
        "RepoTags": ["fixture:latest"],
        "Layers": layers,
    }])
    .to_string()
}

/// A complete image: config, one directory per layer, manifest listing them in order.
pub fn image(layers: &[(&str, &[u8])]) -> ImageFixture {
    let ids: Vec<&str> = layers.iter().map(|(id, _)| *id).collect();
    layers
        .iter()
        .fold(
            ImageFixture::new().file("config.json", br#"{"os":"linux"}"#),
            |fixture, (id, content)| fixture.layer(id, content),
        )
        .manifest(&ids)
}

/// Regular-file members of a tarball, keyed by normalized path.
pub fn archive_files(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(File::open(path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry
            .path()?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        files.insert(name, content);
    }
    Ok(files)
}

/// Cuts `drop` bytes off the end of the file at `path`.
pub fn chop_tail(path: &Path, drop: usize) -> Result<()> {
    let bytes = std::fs::read(path)?;
    std::fs::write(path, &bytes[..bytes.len() - drop])?;
    Ok(())
}

/// All member paths of a tarball in archive order.
pub fn archive_paths(path: &Path) -> Result<Vec<String>> {
    Ok(layerdelta::archive::list_entries(path)?
        .into_iter()
        .map(|entry| entry.path)
        .collect())
}
