//! Filesystem helpers shared by every component: atomic JSON writes,
//! directory creation, disk-free probes.
//!
//! Writers that must appear atomic to concurrent readers use a temp file in
//! the destination directory followed by a same-filesystem rename, so a
//! reader either sees the old content, the new content, or nothing.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

/// Serialize `value` as JSON and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent directory: {:?}", path))?;
    ensure_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {:?}", parent))?;
    serde_json::to_writer(&mut tmp, value).context("failed to serialize JSON")?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("invalid JSON in {:?}", path))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Free bytes available to this user on the filesystem holding `path`.
pub fn free_space(path: &Path) -> std::io::Result<u64> {
    fs2::available_space(path)
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// True when the file exists with more than zero bytes.
pub fn non_empty(path: &Path) -> bool {
    file_size(path) > 0
}

pub fn human_size(mut n: u64) -> String {
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if n < 1024 {
            return format!("{}{}", n, unit);
        }
        n /= 1024;
    }
    format!("{}PB", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Rec {
        pid: i32,
        name: String,
    }

    #[test]
    fn test_atomic_write_and_read_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rec.json");
        let rec = Rec {
            pid: 42,
            name: "alice".into(),
        };
        atomic_write_json(&path, &rec).unwrap();
        let back: Rec = read_json(&path).unwrap();
        assert_eq!(back, rec);

        // Overwrite replaces the old content entirely.
        let rec2 = Rec {
            pid: 7,
            name: "bob".into(),
        };
        atomic_write_json(&path, &rec2).unwrap();
        let back: Rec = read_json(&path).unwrap();
        assert_eq!(back, rec2);

        // No temp residue left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        assert!(!remove_if_exists(&path).unwrap());
        std::fs::write(&path, b"hi").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_free_space_nonzero() {
        let dir = TempDir::new().unwrap();
        assert!(free_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(2048), "2KB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3GB");
    }
}
