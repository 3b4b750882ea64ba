//! Namespace path helpers
//!
//! Paths are slash-delimited and absolute: "/", "/locks", "/app/nodes".

use crate::error::{Error, Result};

/// Root of the namespace
pub const ROOT: &str = "/";

/// Check that `path` is absolute, has no trailing slash and no empty segment
pub fn validate(path: &str) -> Result<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("'{}' is not absolute", path)));
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!("'{}' has a trailing slash", path)));
    }
    if path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(Error::InvalidPath(format!("'{}' has an empty segment", path)));
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of `path` (`None` for the root)
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every proper ancestor of `path` (excluding the root) followed by
/// `path` itself, shallowest first
pub fn lineage(path: &str) -> Vec<&str> {
    if path == ROOT {
        return Vec::new();
    }
    let mut out: Vec<&str> = path
        .match_indices('/')
        .skip(1)
        .map(|(idx, _)| &path[..idx])
        .collect();
    out.push(path);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("/").is_ok());
        assert!(validate("/locks").is_ok());
        assert!(validate("/app/nodes").is_ok());
        assert!(validate("locks").is_err());
        assert!(validate("/locks/").is_err());
        assert!(validate("/app//nodes").is_err());
    }

    #[test]
    fn test_join_parent_name() {
        assert_eq!(join("/", "locks"), "/locks");
        assert_eq!(join("/locks", "a_0000000001"), "/locks/a_0000000001");
        assert_eq!(parent("/locks/a"), Some("/locks"));
        assert_eq!(parent("/locks"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/locks/a_0000000001"), "a_0000000001");
    }

    #[test]
    fn test_lineage() {
        assert_eq!(lineage("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(lineage("/a"), vec!["/a"]);
        assert!(lineage("/").is_empty());
    }
}
