//! Snapshot discovery
//!
//! Snapshots are directories named `plt` followed by digits. They are picked
//! from a data directory either all at once or through shell-style patterns,
//! and optionally thinned to every `nskip + 1`-th entry.

use amrsurf_core::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

fn snapshot_regex() -> Result<Regex> {
    Regex::new(r"^plt\d+$").map_err(|e| Error::Config(e.to_string()))
}

/// Translate a shell glob (`*`, `?`) into an anchored regex
pub fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| Error::Config(format!("Invalid pattern '{}': {}", pattern, e)))
}

/// Snapshot directory name
pub fn snapshot_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn thin(paths: Vec<PathBuf>, nskip: usize) -> Vec<PathBuf> {
    paths.into_iter().step_by(nskip + 1).collect()
}

/// Snapshots under `datapath`, sorted by name.
///
/// With `patterns`, each pattern's matches are sorted and thinned on their
/// own and the results concatenated in pattern order.
pub fn find_snapshots(
    datapath: &Path,
    patterns: Option<&[String]>,
    nskip: usize,
) -> Result<Vec<PathBuf>> {
    let is_snapshot = snapshot_regex()?;
    let mut all: Vec<PathBuf> = fs::read_dir(datapath)
        .map_err(|e| {
            Error::Config(format!(
                "Cannot read data directory {}: {}",
                datapath.display(),
                e
            ))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_snapshot.is_match(&snapshot_name(path)))
        .collect();
    all.sort();

    let selected = match patterns {
        None => thin(all, nskip),
        Some(patterns) => {
            let mut selected = Vec::new();
            for pattern in patterns {
                let matcher = glob_regex(pattern)?;
                let matches: Vec<PathBuf> = all
                    .iter()
                    .filter(|path| matcher.is_match(&snapshot_name(path)))
                    .cloned()
                    .collect();
                if matches.is_empty() {
                    log::warn!("Pattern '{}' matched no snapshots", pattern);
                }
                selected.extend(thin(matches, nskip));
            }
            selected
        }
    };

    log::info!(
        "Selected {} snapshots from {}",
        selected.len(),
        datapath.display()
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| snapshot_name(p)).collect()
    }

    #[test]
    fn test_only_snapshot_names_sorted() {
        let dir = data_dir(&["plt00200", "plt00100", "plt00100.old", "chk00100", "plt00300"]);
        let found = find_snapshots(dir.path(), None, 0).unwrap();
        assert_eq!(names(&found), vec!["plt00100", "plt00200", "plt00300"]);
    }

    #[test]
    fn test_nskip_thins_every_other() {
        let dir = data_dir(&["plt00000", "plt00010", "plt00020", "plt00030", "plt00040"]);
        let found = find_snapshots(dir.path(), None, 1).unwrap();
        assert_eq!(names(&found), vec!["plt00000", "plt00020", "plt00040"]);
    }

    #[test]
    fn test_patterns_thin_separately() {
        let dir = data_dir(&["plt00100", "plt00110", "plt00120", "plt00200", "plt00210"]);
        let patterns = vec!["plt001*".to_string(), "plt002?0".to_string()];
        let found = find_snapshots(dir.path(), Some(&patterns), 1).unwrap();
        assert_eq!(names(&found), vec!["plt00100", "plt00120", "plt00200"]);
    }

    #[test]
    fn test_glob_escapes_literals() {
        let re = glob_regex("plt.1*").unwrap();
        assert!(re.is_match("plt.100"));
        assert!(!re.is_match("plt0100"));
    }

    #[test]
    fn test_missing_directory() {
        let result = find_snapshots(Path::new("/definitely/not/here"), None, 0);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
