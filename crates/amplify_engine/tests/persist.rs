use std::fs;

use amplify_engine::{clear_output_dir, ensure_output_dir, AtomicFileWriter};
use tempfile::TempDir;

#[test]
fn creates_missing_output_dir() {
    let temp = TempDir::new().unwrap();
    let new_dir = temp.path().join("out");
    assert!(!new_dir.exists());
    ensure_output_dir(&new_dir).unwrap();
    assert!(new_dir.is_dir());
}

#[test]
fn atomic_write_replaces_existing_file() {
    let temp = TempDir::new().unwrap();
    let writer = AtomicFileWriter::new(temp.path().to_path_buf());

    let first = writer.write("output-final.html", "hello").unwrap();
    assert_eq!(first.file_name().unwrap(), "output-final.html");
    assert_eq!(fs::read_to_string(&first).unwrap(), "hello");

    let second = writer.write("output-final.html", "world").unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read_to_string(&second).unwrap(), "world");
}

#[test]
fn binary_artifacts_are_written_verbatim() {
    let temp = TempDir::new().unwrap();
    let writer = AtomicFileWriter::new(temp.path().join("job"));

    let png = [0x89, b'P', b'N', b'G', 0, 1, 2];
    let path = writer.write_bytes("output-final.png", &png).unwrap();
    assert_eq!(fs::read(path).unwrap(), png);
}

#[test]
fn no_partial_file_on_error() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("not_a_dir");
    fs::write(&file_path, "x").unwrap();

    let writer = AtomicFileWriter::new(file_path.clone());
    let result = writer.write("output-final.html", "data");
    assert!(result.is_err());
    assert!(!file_path.with_file_name("output-final.html").exists());
}

#[test]
fn clearing_removes_previous_run() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("42");
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("output-final.html"), "old").unwrap();
    fs::write(dir.join("nested").join("x.txt"), "old").unwrap();

    clear_output_dir(&dir).unwrap();

    assert!(dir.is_dir());
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}
