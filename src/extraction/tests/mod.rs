use crate::error::{ErrorKind, StageError};
use crate::extraction::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Create a ZIP archive containing the given files (names are written verbatim)
fn create_zip_archive(archive_path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(archive_path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        std::io::Write::write_all(&mut writer, content).unwrap();
    }
    writer.finish().unwrap();
}

/// Every regular file below `root`, relative and sorted
fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[test]
fn test_extracts_nested_files_with_relative_paths() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    let dest = temp_dir.path().join("extracted");
    create_zip_archive(
        &archive,
        &[
            ("Takeout/Trip/IMG_1.jpg", b"one"),
            ("Takeout/Trip/IMG_1.jpg.json", b"{}"),
            ("root.png", b"three!"),
        ],
    );

    let entries = ZipExtractor::extract(&archive, &dest).unwrap();

    let paths: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["Takeout/Trip/IMG_1.jpg", "Takeout/Trip/IMG_1.jpg.json", "root.png"]
    );
    assert_eq!(entries[2].size_bytes, 6);
    assert!(entries.iter().all(|e| !e.reused));
    assert_eq!(
        std::fs::read(dest.join("Takeout/Trip/IMG_1.jpg")).unwrap(),
        b"one"
    );
}

#[test]
fn test_rerun_reuses_complete_files_and_rewrites_truncated_ones() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    let dest = temp_dir.path().join("extracted");
    create_zip_archive(&archive, &[("a.jpg", b"aaaa"), ("b.jpg", b"bbbb")]);

    ZipExtractor::extract(&archive, &dest).unwrap();
    // Simulate a crash that left b.jpg short
    std::fs::write(dest.join("b.jpg"), b"bb").unwrap();

    let entries = ZipExtractor::extract(&archive, &dest).unwrap();
    assert!(entries[0].reused);
    assert!(!entries[1].reused);
    assert_eq!(std::fs::read(dest.join("b.jpg")).unwrap(), b"bbbb");
    assert!(!dest.join("b.jpg.partial").exists());
}

#[test]
fn test_parent_dir_entry_fails_whole_archive_without_writing() {
    let temp_dir = TempDir::new().unwrap();
    let sandbox = temp_dir.path().join("unit");
    std::fs::create_dir(&sandbox).unwrap();
    let archive = sandbox.join("archive");
    let dest = sandbox.join("extracted");

    // The traversal entry comes last: nothing before it may be written either
    create_zip_archive(
        &archive,
        &[
            ("good/IMG_1.jpg", b"fine"),
            ("good/IMG_2.jpg", b"fine"),
            ("../../escaped.jpg", b"evil"),
        ],
    );

    let err = ZipExtractor::extract(&archive, &dest).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.message().contains("../../escaped.jpg"));

    assert_eq!(files_under(temp_dir.path()), vec![PathBuf::from("unit/archive")]);
    assert!(!dest.exists());
}

#[test]
fn test_absolute_entry_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    let dest = temp_dir.path().join("extracted");
    create_zip_archive(&archive, &[("/tmp/evil.jpg", b"evil")]);

    let err = ZipExtractor::extract(&archive, &dest).unwrap_err();
    assert!(matches!(err, StageError::Integrity(_)));
    assert!(!dest.exists());
}

#[test]
fn test_backslash_traversal_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    let dest = temp_dir.path().join("extracted");
    create_zip_archive(&archive, &[("..\\evil.jpg", b"evil")]);

    let err = ZipExtractor::extract(&archive, &dest).unwrap_err();
    assert!(matches!(err, StageError::Integrity(_)));
}

#[test]
fn test_corrupt_archive_is_permanent() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    std::fs::write(&archive, b"this is not a zip file").unwrap();

    let err = ZipExtractor::extract(&archive, &temp_dir.path().join("out")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn test_extract_archive_runs_off_the_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    let dest = temp_dir.path().join("extracted");
    create_zip_archive(&archive, &[("x.jpg", b"x")]);

    let entries = extract_archive(archive, dest.clone()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, dest.join("x.jpg"));
}
