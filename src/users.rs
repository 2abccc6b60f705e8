//! Poller user-list management and username validation.
//!
//! The users file is one name per line; blank lines and `#` comments are
//! preserved by edits and ignored by readers.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Twitch usernames: letters, digits, underscores, 3 to 25 characters.
pub fn is_valid_username(name: &str) -> bool {
    (3..=25).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Usernames from the file, comments and blanks skipped. A missing file
/// reads as empty so the poller keeps cycling while the operator sets up.
pub fn load_users(path: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

pub fn list_users(path: &Path) -> Result<Vec<String>> {
    let mut users = load_users(path);
    users.sort_by_key(|u| normalize(u));
    Ok(users)
}

/// Append users not already present (case-insensitively). Returns
/// (added, skipped, invalid).
pub fn add_users(
    path: &Path,
    names: &[String],
) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {:?}", parent))?;
    }
    let existing: HashSet<String> = load_users(path).iter().map(|u| normalize(u)).collect();

    let mut added = Vec::new();
    let mut added_norm = HashSet::new();
    let mut skipped = Vec::new();
    let mut invalid = Vec::new();

    for name in names {
        let norm = normalize(name);
        if !is_valid_username(name) {
            invalid.push(name.clone());
        } else if existing.contains(&norm) || added_norm.contains(&norm) {
            skipped.push(name.clone());
        } else {
            added_norm.insert(norm);
            added.push(name.clone());
        }
    }

    if !added.is_empty() {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {:?}", path))?;
        for name in &added {
            writeln!(file, "{}", name)?;
        }
    }
    Ok((added, skipped, invalid))
}

/// Remove the named users, preserving comments and blank lines. Returns
/// the users actually removed.
pub fn remove_users(path: &Path, names: &[String]) -> Result<Vec<String>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let targets: HashSet<String> = names.iter().map(|n| normalize(n)).collect();

    let mut removed = Vec::new();
    let mut kept = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') && targets.contains(&normalize(trimmed))
        {
            removed.push(trimmed.to_string());
        } else {
            kept.push(line.to_string());
        }
    }

    if !removed.is_empty() {
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(path, out).with_context(|| format!("failed to write {:?}", path))?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_valid_username() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("DJ_Alpha_99"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("bad-name"));
        assert!(!is_valid_username("spaces here"));
        assert!(!is_valid_username(&"x".repeat(26)));
    }

    #[test]
    fn test_load_users_skips_comments_and_blanks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.txt");
        std::fs::write(&path, "# watchlist\nalice\n\n  bob  \n#carol\n").unwrap();
        assert_eq!(load_users(&path), vec!["alice", "bob"]);
        assert_eq!(load_users(&dir.path().join("missing.txt")), Vec::<String>::new());
    }

    #[test]
    fn test_add_users_dedup_and_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.txt");
        std::fs::write(&path, "alice\n").unwrap();

        let (added, skipped, invalid) = add_users(
            &path,
            &[
                "ALICE".to_string(),
                "bob".to_string(),
                "bob".to_string(),
                "no!".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(added, vec!["bob"]);
        assert_eq!(skipped, vec!["ALICE", "bob"]);
        assert_eq!(invalid, vec!["no!"]);
        assert_eq!(load_users(&path), vec!["alice", "bob"]);
    }

    #[test]
    fn test_remove_users_preserves_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.txt");
        std::fs::write(&path, "# keep me\nalice\nbob\n").unwrap();

        let removed = remove_users(&path, &["ALICE".to_string()]).unwrap();
        assert_eq!(removed, vec!["alice"]);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("# keep me"));
        assert!(contents.contains("bob"));
        assert!(!contents.contains("alice"));

        let removed = remove_users(&path, &["nobody".to_string()]).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_list_users_sorted_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.txt");
        std::fs::write(&path, "Zeta\nalpha\nBeta\n").unwrap();
        assert_eq!(list_users(&path).unwrap(), vec!["alpha", "Beta", "Zeta"]);
    }
}
