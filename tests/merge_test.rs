mod common;

use anyhow::Result;
use common::{archive_files, archive_paths, image, ImageFixture};
use layerdelta::{build_diff, extract_layer_identifiers, merge_images, DeltaError, Notifier};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_merge_with_own_diff_reproduces_image() -> Result<()> {
    let dir = TempDir::new()?;
    let notifier = Notifier::new(0);
    let original = dir.path().join("image.tar");
    image(&[("aaa", b"layer-a"), ("bbb", b"layer-b")]).write(&original)?;

    let layers = extract_layer_identifiers(&original, &notifier)?;
    let diff = dir.path().join("diff.tar");
    let diff_summary = build_diff(&original, &layers, &diff, &notifier)?;
    assert_eq!(diff_summary.reused_layers, ["aaa", "bbb"]);

    let output = dir.path().join("merged.tar");
    let summary = merge_images(&original, &diff, &output, &notifier)?;

    assert_eq!(archive_files(&output)?, archive_files(&original)?);
    assert_eq!(summary.manifest_layers, 2);
    assert_eq!(summary.files_packed, 8);
    Ok(())
}

#[test]
fn test_diff_content_wins_on_collision() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    let diff = dir.path().join("diff.tar");
    ImageFixture::new()
        .file("x", b"old")
        .file("keep", b"base only")
        .manifest(&[])
        .write(&base)?;
    ImageFixture::new()
        .file("x", b"new")
        .manifest(&[])
        .write(&diff)?;

    let output = dir.path().join("merged.tar");
    merge_images(&base, &diff, &output, &Notifier::new(0))?;

    let files = archive_files(&output)?;
    assert_eq!(files["x"], b"new");
    assert_eq!(files["keep"], b"base only");
    Ok(())
}

#[test]
fn test_compare_then_merge_rebuilds_new_image() -> Result<()> {
    let dir = TempDir::new()?;
    let notifier = Notifier::new(0);
    let base = dir.path().join("base.tar");
    let new_image = dir.path().join("new.tar");
    image(&[("aaa", b"layer-a"), ("bbb", b"layer-b")]).write(&base)?;
    image(&[("aaa", b"layer-a"), ("ccc", b"layer-c")])
        .file("ccc/extra", b"only in the new image")
        .write(&new_image)?;

    let diff = dir.path().join("diff.tar");
    let base_layers = extract_layer_identifiers(&base, &notifier)?;
    build_diff(&new_image, &base_layers, &diff, &notifier)?;

    let output = dir.path().join("merged.tar");
    let summary = merge_images(&base, &diff, &output, &notifier)?;
    let merged = archive_files(&output)?;

    for (path, content) in archive_files(&new_image)? {
        assert_eq!(merged.get(&path), Some(&content), "{path} differs");
    }
    // Base-only layers survive the overlay; the manifest no longer references them
    assert!(merged.contains_key("bbb/layer.tar"));
    assert_eq!(summary.manifest_layers, 2);
    Ok(())
}

#[test]
fn test_merge_output_has_no_directory_entries() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    image(&[("aaa", b"layer-a")]).write(&base)?;

    let output = dir.path().join("merged.tar");
    merge_images(&base, &base, &output, &Notifier::new(0))?;

    assert_eq!(
        archive_paths(&output)?,
        [
            "aaa/VERSION",
            "aaa/json",
            "aaa/layer.tar",
            "config.json",
            "manifest.json"
        ]
    );
    Ok(())
}

#[test]
fn test_merge_requires_diff_manifest() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    let diff = dir.path().join("diff.tar");
    image(&[("aaa", b"layer-a")]).write(&base)?;
    ImageFixture::new().layer("bbb", b"layer-b").write(&diff)?;

    let output = dir.path().join("merged.tar");
    let err = merge_images(&base, &diff, &output, &Notifier::new(0)).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DeltaError>(),
        Some(DeltaError::ManifestMissing { .. })
    ));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn test_merge_fails_on_corrupt_base() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    let diff = dir.path().join("diff.tar");
    fs::write(&base, b"this is not a tarball")?;
    image(&[("aaa", b"layer-a")]).write(&diff)?;

    let output = dir.path().join("merged.tar");
    let err = merge_images(&base, &diff, &output, &Notifier::new(0)).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DeltaError>(),
        Some(DeltaError::Extraction { .. })
    ));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn test_merge_fails_on_unsupported_entry_type() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    let diff = dir.path().join("diff.tar");
    image(&[("aaa", b"layer-a")]).fifo("aaa/pipe").write(&base)?;
    image(&[("aaa", b"layer-a")]).write(&diff)?;

    let output = dir.path().join("merged.tar");
    fs::write(&output, b"previous merge")?;
    let err = merge_images(&base, &diff, &output, &Notifier::new(0)).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DeltaError>(),
        Some(DeltaError::Extraction { .. })
    ));
    assert_eq!(fs::read(&output)?, b"previous merge");
    Ok(())
}

#[test]
fn test_merge_reads_only_first_manifest_image() -> Result<()> {
    let dir = TempDir::new()?;
    let base = dir.path().join("base.tar");
    let diff = dir.path().join("diff.tar");
    image(&[("aaa", b"layer-a")]).write(&base)?;
    ImageFixture::new()
        .layer("bbb", b"layer-b")
        .file(
            "manifest.json",
            br#"[{"Layers":["bbb/layer.tar"]},{"Config":"other.json"}]"#,
        )
        .write(&diff)?;

    let output = dir.path().join("merged.tar");
    let summary = merge_images(&base, &diff, &output, &Notifier::new(0))?;

    assert_eq!(summary.manifest_layers, 1);
    Ok(())
}
