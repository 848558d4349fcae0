//! Parent/leaf path splitting.
//!
//! Paths are always rooted: a path without a leading `/` is taken relative to
//! the root, and trailing slashes are ignored. The root itself is `"/"`.

pub const ROOT: &str = "/";

/// Parent directory of `path`; `"/"` for top-level entries and the root.
pub fn dirname(path: &str) -> &str {
    split_path(path).0
}

/// Leaf name of `path`; empty for the root.
pub fn filename(path: &str) -> &str {
    split_path(path).1
}

/// Split `path` into `(dirname, filename)`.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => {
            let parent = trimmed[..i].trim_end_matches('/');
            (if parent.is_empty() { ROOT } else { parent }, &trimmed[i + 1..])
        }
        None => (ROOT, trimmed),
    }
}

/// Iterate the non-empty components of `path`.
pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}
