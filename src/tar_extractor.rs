use crate::archive;
use crate::notifier::Notifier;
use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

/// Normalizes a path from a tar archive to be safe for extraction
/// Removes any attempts to escape the root directory
pub(crate) fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => { /* skip "." */ }
            Component::ParentDir => {
                // Don't allow escaping the extraction root
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            // Ignore absolute paths and Windows prefixes
            Component::RootDir | Component::Prefix(_) => { /* ignore */ }
        }
    }

    out
}

/// Removes whatever currently occupies `dest` (file, symlink or directory)
fn clear_destination(dest: &Path) -> Result<()> {
    // symlink_metadata so broken symlinks are detected too
    if let Ok(metadata) = fs::symlink_metadata(dest) {
        if metadata.is_dir() && !metadata.is_symlink() {
            fs::remove_dir_all(dest)
                .with_context(|| format!("Failed to remove directory: {}", dest.display()))?;
        } else {
            fs::remove_file(dest)
                .with_context(|| format!("Failed to remove file: {}", dest.display()))?;
        }
    }
    Ok(())
}

/// Attempts to create a hardlink, falling back to copy if hardlinks aren't supported
/// Returns Err if the target doesn't exist yet (caller retries once)
fn try_link_or_copy(target: &Path, dest: &Path, notifier: &Notifier) -> Result<()> {
    if !target.exists() {
        return Err(anyhow!("hardlink target missing: {}", target.display()));
    }

    clear_destination(dest)?;

    if let Err(e) = fs::hard_link(target, dest) {
        notifier.debug(&format!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            target.display(),
            dest.display()
        ));
        fs::copy(target, dest)
            .with_context(|| format!("Failed to copy {} to {}", target.display(), dest.display()))?;
    }

    Ok(())
}

struct PendingHardlink {
    dest: PathBuf,
    target: PathBuf,
}

/// Extracts a tar archive (plain or gzipped) to the specified directory.
///
/// Later entries replace earlier ones at the same path. Symlinks are recreated with
/// their original target text; hardlinks are created after all regular files so their
/// targets exist.
///
/// Returns the number of entries materialized.
///
/// # Errors
/// Fails on device nodes, FIFOs and other entry types that cannot be materialized, and on
/// hardlinks whose target never appears in the archive.
pub fn extract_tar(tar_path: &Path, extract_dir: &Path, notifier: &Notifier) -> Result<usize> {
    let mut archive = archive::open_archive(tar_path)?;

    fs::create_dir_all(extract_dir)
        .with_context(|| format!("Failed to create directory: {}", extract_dir.display()))?;

    let mut pending_hardlinks = Vec::new();
    let mut extracted = 0usize;

    for entry_result in archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", tar_path.display()))?
    {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().ok();

        let rel_path = normalize_tar_path(&entry.path().context("Failed to get entry path")?);
        if rel_path.as_os_str().is_empty() {
            // The archive root itself ("./")
            continue;
        }

        let dest = extract_dir.join(&rel_path);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        match entry_type {
            tar::EntryType::Directory => {
                if let Ok(metadata) = fs::symlink_metadata(&dest) {
                    if !metadata.is_dir() {
                        clear_destination(&dest)?;
                    }
                }
                fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

                // Keep directories writable so later entries and overlays can land in them
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let safe_mode = mode.unwrap_or(0o755) | 0o700;
                    let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(safe_mode));
                }
            }
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                clear_destination(&dest)?;

                notifier.trace(&format!("Creating file: {}", dest.display()));
                let mut out_file = File::create(&dest)
                    .with_context(|| format!("Failed to create file: {}", dest.display()))?;

                std::io::copy(&mut entry, &mut out_file)
                    .with_context(|| format!("Failed to write file: {}", dest.display()))?;

                // Owner must be able to read it back and replace it during overlay
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Some(mode) = mode {
                        let perms = fs::Permissions::from_mode(mode | 0o600);
                        let _ = fs::set_permissions(&dest, perms);
                    }
                }
            }
            tar::EntryType::Symlink => {
                let link_name = entry
                    .link_name()
                    .context("Failed to get symlink target")?
                    .ok_or_else(|| anyhow!("Symlink without target: {}", rel_path.display()))?
                    .into_owned();

                clear_destination(&dest)?;

                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&link_name, &dest).with_context(|| {
                        format!(
                            "Failed to create symlink {} -> {}",
                            dest.display(),
                            link_name.display()
                        )
                    })?;
                }

                #[cfg(not(unix))]
                {
                    notifier.warn(&format!(
                        "Symlink support not implemented on this platform: {}",
                        dest.display()
                    ));
                    continue;
                }
            }
            tar::EntryType::Link => {
                // Hardlink - save for second pass
                let link_name = entry
                    .link_name()
                    .context("Failed to get hardlink target")?
                    .ok_or_else(|| anyhow!("Hardlink without target: {}", rel_path.display()))?;

                let target = extract_dir.join(normalize_tar_path(&link_name));
                pending_hardlinks.push(PendingHardlink { dest, target });
                continue;
            }
            tar::EntryType::XGlobalHeader
            | tar::EntryType::XHeader
            | tar::EntryType::GNULongName
            | tar::EntryType::GNULongLink => continue,
            _ => {
                return Err(anyhow!(
                    "Unsupported entry type {:?}: {}",
                    entry_type,
                    rel_path.display()
                ));
            }
        }

        extracted += 1;
    }

    // Second pass: hardlinks, with one retry round for links whose target is another link
    let mut failed_hardlinks = Vec::new();
    for hardlink in pending_hardlinks {
        if try_link_or_copy(&hardlink.target, &hardlink.dest, notifier).is_ok() {
            extracted += 1;
        } else {
            failed_hardlinks.push(hardlink);
        }
    }

    for hardlink in failed_hardlinks {
        try_link_or_copy(&hardlink.target, &hardlink.dest, notifier).with_context(|| {
            format!(
                "Broken hardlink {} -> {}",
                hardlink.dest.display(),
                hardlink.target.display()
            )
        })?;
        extracted += 1;
    }

    Ok(extracted)
}
