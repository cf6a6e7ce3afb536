//! Path normalization.
//!
//! Every path entering the filesystem layer is first reduced: `.`
//! segments dropped, `..` segments folded into their parent where one
//! exists, repeated and trailing slashes removed. Reduction is
//! idempotent.

use alloc::string::String;
use alloc::vec::Vec;

/// Collapse `.`, `..` and duplicate slashes.
pub fn reduce_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().map(|last| *last != "..").unwrap_or(false) {
                    parts.pop();
                } else if !absolute {
                    // A relative path keeps leading `..` segments.
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let mut reduced = String::new();
    if absolute {
        reduced.push('/');
    }
    reduced.push_str(&parts.join("/"));
    if reduced.is_empty() {
        reduced.push('.');
    }
    reduced
}

/// Resolve `path` against `cwd` into an absolute reduced path.
pub fn absolute_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        reduce_path(path)
    } else {
        let mut joined = String::from(cwd);
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
        reduce_path(&joined)
    }
}

/// Split into (parent, final segment). The root has no parent.
pub fn split_parent(path: &str) -> Option<(String, &str)> {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some((String::from("/"), &path[1..])),
        Some(pos) => Some((String::from(&path[..pos]), &path[pos + 1..])),
        None => Some((String::from("."), path)),
    }
}

pub fn base_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_cases() {
        assert_eq!(reduce_path("/"), "/");
        assert_eq!(reduce_path("//"), "/");
        assert_eq!(reduce_path("/a/b/c"), "/a/b/c");
        assert_eq!(reduce_path("/a//b///c/"), "/a/b/c");
        assert_eq!(reduce_path("/a/./b/."), "/a/b");
        assert_eq!(reduce_path("/a/b/.."), "/a");
        assert_eq!(reduce_path("/../a"), "/a");
        assert_eq!(reduce_path("a/../../b"), "../b");
        assert_eq!(reduce_path("./"), ".");
    }

    #[test]
    fn reduction_is_idempotent() {
        for path in [
            "/", "/a/b/../c//d/.", "a/../..", "../x/./y//", "/tmp/test.txt", "////..//a/..",
        ] {
            let once = reduce_path(path);
            assert_eq!(reduce_path(&once), once, "path {}", path);
        }
    }

    #[test]
    fn join_with_cwd() {
        assert_eq!(absolute_path("/home", "file"), "/home/file");
        assert_eq!(absolute_path("/home/", "../etc/passwd"), "/etc/passwd");
        assert_eq!(absolute_path("/home", "/abs"), "/abs");
    }

    #[test]
    fn parent_and_base() {
        assert_eq!(split_parent("/a/b/c"), Some((String::from("/a/b"), "c")));
        assert_eq!(split_parent("/a"), Some((String::from("/"), "a")));
        assert_eq!(split_parent("/"), None);
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("name"), "name");
    }
}
