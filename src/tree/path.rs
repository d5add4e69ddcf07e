//! Logical path parsing and name validation for the virtual tree.

use crate::error::{DriveError, DriveResult};

pub const MAX_NAME_LEN: usize = 255;

/// Validate a single path segment used as a file or directory name.
pub fn validate_name(name: &str) -> DriveResult<()> {
    if name.is_empty() {
        return Err(DriveError::NamingRejected("name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DriveError::NamingRejected(format!("name longer than {} bytes", MAX_NAME_LEN)));
    }
    if name == "." || name == ".." {
        return Err(DriveError::NamingRejected(format!("'{}' is reserved", name)));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(DriveError::NamingRejected(format!("'{}' contains a forbidden character", name)));
    }
    if name.trim() != name {
        return Err(DriveError::NamingRejected(format!("'{}' has leading or trailing whitespace", name)));
    }
    Ok(())
}

/// Split a user-facing path into validated segments. `/`, `` and `/a/b/`
/// are accepted; repeated separators are not.
pub fn split_path(path: &str) -> DriveResult<Vec<&str>> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(DriveError::InvalidRequest(format!("path '{}' contains '//'", path)));
        }
        validate_name(segment)?;
    }
    Ok(segments)
}

/// Split into (parent segments, final name). The root has no final name.
pub fn split_parent(path: &str) -> DriveResult<(Vec<&str>, &str)> {
    let mut segments = split_path(path)?;
    match segments.pop() {
        Some(name) => Ok((segments, name)),
        None => Err(DriveError::InvalidRequest("path must name an entry below the root".to_string())),
    }
}

/// `report.pdf` -> `report (n).pdf`, `archive` -> `archive (n)`.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}
