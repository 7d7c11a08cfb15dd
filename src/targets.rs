use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ScanError;

/// Parse target list content into an ordered, deduplicated list of endpoint names.
///
/// Supported formats per line:
/// - a hostname or literal address: `nl1.example.com`, `203.0.113.7`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
///
/// Names keep their case; the first occurrence of a duplicate wins.
pub fn parse_targets_str(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for raw_line in s.lines() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    out
}

/// Load the target list from a file. Errors if it cannot be read or holds no names.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file: {}", path.display()))?;
    let targets = parse_targets_str(&content);
    if targets.is_empty() {
        return Err(ScanError::NoTargets(path.display().to_string()).into());
    }
    info!(count = targets.len(), file = %path.display(), "loaded targets");
    Ok(targets)
}

/// Parse newline- or comma-delimited country names. Blank entries are dropped.
pub fn parse_country_list(s: &str) -> Vec<String> {
    s.split(|c| c == '\n' || c == ',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load the exclusion list. A missing file means nothing is excluded.
pub fn load_exclude_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => {
            let list = parse_country_list(&content);
            if !list.is_empty() {
                info!(countries = ?list, "excluding countries");
            }
            Ok(list)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(
                file = %path.display(),
                "no countries excluded; create this file with one country per line to exclude some"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(e)
            .with_context(|| format!("failed to read exclude file: {}", path.display())),
    }
}

/// Load the inclusion list if one was requested.
///
/// `None` means "include all", which is also what a requested-but-missing or empty file
/// falls back to.
pub fn load_include_list(path: Option<&Path>) -> Result<Option<Vec<String>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let countries = parse_country_list(&content);
            if countries.is_empty() {
                info!(file = %path.display(), "include file is empty, including all countries");
                return Ok(None);
            }
            Ok(Some(countries))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(file = %path.display(), "include file not found, including all countries");
            Ok(None)
        }
        Err(e) => Err(e)
            .with_context(|| format!("failed to read include file: {}", path.display())),
    }
}
