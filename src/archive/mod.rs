//! Streaming tar archives with Docker/OCI-compatible whiteouts.

pub mod reader;
pub mod writer;

pub use reader::apply_archive;
pub use writer::{create_archive, ArchiveStats};

/// Splits a normalized path into `(parent, leaf)`. `parent` is `""` for a
/// top-level entry.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// The sibling whiteout name for a deleted single entry: `dirname(path) +
/// "/.wh." + basename(path)`.
pub(crate) fn whiteout_name(path: &str) -> String {
    let (parent, leaf) = split_path(path);
    if parent.is_empty() {
        format!(".wh.{leaf}")
    } else {
        format!("{parent}/.wh.{leaf}")
    }
}

/// The opaque whiteout name for an entire deleted directory subtree:
/// `path + "/.wh..wh..opq"`.
pub(crate) fn opaque_whiteout_name(path: &str) -> String {
    format!("{path}/.wh..wh..opq")
}

const OPAQUE_WHITEOUT_LEAF: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

pub(crate) fn is_whiteout_leaf(leaf: &str) -> bool {
    leaf.starts_with(WHITEOUT_PREFIX)
}

pub(crate) fn is_opaque_whiteout_leaf(leaf: &str) -> bool {
    leaf == OPAQUE_WHITEOUT_LEAF
}
