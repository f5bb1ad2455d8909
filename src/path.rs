//! Path normalization and case-insensitive collision detection.
//!
//! Every relative path stored anywhere in this crate (snapshots, file
//! changes, tar entry names) passes through [`normalize`] first, so the
//! rest of the engine can assume forward slashes, no `.`/`..` segments, and
//! no leading or trailing slash.

use crate::error::{Error, Result};

/// Normalizes a caller-supplied relative path.
///
/// Replaces `\` with `/`, collapses repeated slashes, and strips a leading
/// and trailing slash. Rejects `.` and `..` segments and NUL bytes. An
/// empty or whitespace-only input normalizes to the empty string, which
/// denotes the working root and is never stored as an entry.
pub fn normalize(path: &str) -> Result<String> {
    if path.trim().is_empty() {
        return Ok(String::new());
    }
    let replaced = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in replaced.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(Error::InvalidPath {
                path: path.to_string(),
                reason: "path segment must not be '.' or '..'",
            });
        }
        if segment.bytes().any(|b| b == 0) {
            return Err(Error::InvalidPath {
                path: path.to_string(),
                reason: "path must not contain a NUL byte",
            });
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

/// ASCII case-insensitive equality: `A`-`Z` are folded onto `a`-`z`, every
/// other byte compares exactly. This is deliberately not a Unicode
/// case-fold, matching the data model's definition of "collide".
pub fn eq_ignore_ascii_case(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// True iff some element of `set`, after normalization, case-insensitively
/// collides with the normalized `path`.
pub fn collides<I, S>(path: &str, set: I) -> Result<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let normalized = normalize(path)?;
    for candidate in set {
        let candidate = normalize(candidate.as_ref())?;
        if eq_ignore_ascii_case(&normalized, &candidate) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Lowercases only ASCII letters, for use as a case-insensitive map key.
/// Not a general Unicode case fold — see [`eq_ignore_ascii_case`].
pub fn ascii_lower_key(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_lowercase() } else { c })
        .collect()
}
