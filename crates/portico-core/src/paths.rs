//! Logical path helpers shared by the mount router, the VFS and WebDAV.
//!
//! Logical paths are absolute (`/docs/report.pdf`), use `/` separators and
//! never end with a trailing slash except for the root itself. Storage keys
//! are backend-relative and carry no leading slash. Comparison is byte-wise
//! after syntactic normalization; no Unicode normalization or case folding
//! is applied.

/// Normalize a client-supplied logical path.
///
/// Collapses duplicate separators, rejects `.`/`..` segments and strips any
/// trailing slash (except on `/`). An empty input resolves to `/`.
pub fn normalize(raw: &str) -> Result<String, anyhow::Error> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "/" {
        return Ok("/".to_string());
    }

    let mut out = String::with_capacity(raw.len() + 1);
    for part in raw.split('/').map(str::trim).filter(|v| !v.is_empty()) {
        if part == "." || part == ".." {
            anyhow::bail!("invalid path segment: {part}");
        }
        out.push('/');
        out.push_str(part);
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// `true` when `path` equals `prefix` or lives under it.
///
/// `prefix` must be normalized; `/` contains everything.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|r| r.starts_with('/'))
}

/// Parent of a normalized path (`/` is its own parent).
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Last segment of a normalized path; `/` for the root.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Join a normalized directory path and an entry name.
pub fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

/// Strip `mount_path` off a logical path, yielding the mount-relative part
/// with no leading slash. Returns `None` when the path is outside the mount.
pub fn strip_mount_prefix<'a>(path: &'a str, mount_path: &str) -> Option<&'a str> {
    if mount_path == "/" {
        return Some(path.trim_start_matches('/'));
    }
    if path == mount_path {
        return Some("");
    }
    path.strip_prefix(mount_path)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Join a backend default folder and a mount-relative path into a storage
/// key (no leading slash).
pub fn storage_key(default_folder: &str, relative: &str) -> String {
    let folder = default_folder.trim_matches('/');
    let relative = relative.trim_matches('/');
    match (folder.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_string(),
        (false, true) => folder.to_string(),
        (false, false) => format!("{folder}/{relative}"),
    }
}

/// `true` when `key` equals `prefix` or lives under it (storage-key form).
pub fn key_within(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    key == prefix || key.strip_prefix(prefix).is_some_and(|r| r.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::{
        file_name, is_within, join, key_within, normalize, parent, storage_key,
        strip_mount_prefix,
    };

    #[test]
    fn normalize_collapses_and_strips() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("//a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize(" /a / b ").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_rejects_dot_segments() {
        assert!(normalize("/a/../b").is_err());
        assert!(normalize("/./a").is_err());
    }

    #[test]
    fn is_within_requires_segment_boundary() {
        assert!(is_within("/public/docs", "/public"));
        assert!(is_within("/public", "/public"));
        assert!(!is_within("/publicX", "/public"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/"), "/");
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn strip_mount_prefix_boundaries() {
        assert_eq!(strip_mount_prefix("/m/a/b", "/m"), Some("a/b"));
        assert_eq!(strip_mount_prefix("/m", "/m"), Some(""));
        assert_eq!(strip_mount_prefix("/mx/a", "/m"), None);
        assert_eq!(strip_mount_prefix("/a/b", "/"), Some("a/b"));
    }

    #[test]
    fn storage_key_composition() {
        assert_eq!(storage_key("", ""), "");
        assert_eq!(storage_key("/base/", "a/b"), "base/a/b");
        assert_eq!(storage_key("", "a"), "a");
        assert_eq!(storage_key("base", ""), "base");
    }

    #[test]
    fn key_within_boundaries() {
        assert!(key_within("a/b", "a"));
        assert!(key_within("a", "a"));
        assert!(!key_within("ab", "a"));
        assert!(key_within("anything", ""));
    }
}
