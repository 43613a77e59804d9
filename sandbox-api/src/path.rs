//! URL path encoding for sandbox paths.
//!
//! An absolute sandbox path is marked by percent-encoding only its leading
//! slash (`/filesystem%2Fusr/local`); relative paths are appended after the
//! prefix's own slash (`/filesystem/rel/path`). The rest of the path is left
//! as is so it stays readable in request logs.

pub const FILESYSTEM_PREFIX: &str = "/filesystem";
pub const WATCH_PREFIX: &str = "/watch/filesystem";
pub const TREE_PREFIX: &str = "/filesystem/tree";

fn encode_with_prefix(prefix: &str, path: &str) -> String {
    match path.strip_prefix('/') {
        _ if path.is_empty() => format!("{prefix}/"),
        Some(rest) => format!("{prefix}%2F{rest}"),
        None => format!("{prefix}/{path}"),
    }
}

pub fn encode_filesystem_path(path: &str) -> String {
    encode_with_prefix(FILESYSTEM_PREFIX, path)
}

pub fn encode_watch_path(path: &str) -> String {
    encode_with_prefix(WATCH_PREFIX, path)
}

pub fn encode_tree_path(path: &str) -> String {
    encode_with_prefix(TREE_PREFIX, path)
}

/// Which filesystem endpoint a request path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsRoute {
    File,
    Tree,
    Watch,
}

/// Decode a raw (still percent-encoded) request path into its route and
/// sandbox path. Returns `None` when the path is not a filesystem route.
pub fn decode_request_path(raw: &str) -> Option<(FsRoute, String)> {
    // Longest prefix first: `/filesystem/tree` shadows `/filesystem`.
    for (route, prefix) in [
        (FsRoute::Tree, TREE_PREFIX),
        (FsRoute::Watch, WATCH_PREFIX),
        (FsRoute::File, FILESYSTEM_PREFIX),
    ] {
        let Some(rest) = raw.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            return Some((route, String::new()));
        }
        if let Some(relative) = rest.strip_prefix('/') {
            return Some((route, percent_decode(relative)));
        }
        if let Some(absolute) = rest.strip_prefix("%2F").or_else(|| rest.strip_prefix("%2f")) {
            return Some((route, format!("/{}", percent_decode(absolute))));
        }
    }
    None
}

fn percent_decode(s: &str) -> String {
    match urlencoding::decode(s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_boundaries() {
        assert_eq!(encode_filesystem_path(""), "/filesystem/");
        assert_eq!(encode_filesystem_path("/a/b"), "/filesystem%2Fa/b");
        assert_eq!(encode_filesystem_path("a/b"), "/filesystem/a/b");
        assert_eq!(encode_watch_path("/tmp"), "/watch/filesystem%2Ftmp");
        assert_eq!(encode_watch_path(""), "/watch/filesystem/");
        assert_eq!(encode_tree_path("src"), "/filesystem/tree/src");
        assert_eq!(encode_tree_path("/usr/local/bin"), "/filesystem/tree%2Fusr/local/bin");
    }

    #[test]
    fn test_decode_recovers_encoded_paths() {
        for path in ["", "/", "/a/b", "a/b", "/usr/local/bin", "rel", "/tmp/with space.txt"] {
            assert_eq!(
                decode_request_path(&encode_filesystem_path(path)),
                Some((FsRoute::File, path.to_string())),
                "{path}"
            );
            assert_eq!(
                decode_request_path(&encode_tree_path(path)),
                Some((FsRoute::Tree, path.to_string()))
            );
            assert_eq!(
                decode_request_path(&encode_watch_path(path)),
                Some((FsRoute::Watch, path.to_string()))
            );
        }
    }

    #[test]
    fn test_absolute_and_relative_stay_distinct() {
        let abs = decode_request_path(&encode_filesystem_path("/a")).unwrap();
        let rel = decode_request_path(&encode_filesystem_path("a")).unwrap();
        assert_ne!(abs, rel);
    }

    #[test]
    fn test_decode_fully_encoded_path() {
        assert_eq!(
            decode_request_path("/filesystem%2Ftmp%2Fu.bin"),
            Some((FsRoute::File, "/tmp/u.bin".to_string()))
        );
        assert_eq!(
            decode_request_path("/filesystem/dir%20name/f"),
            Some((FsRoute::File, "dir name/f".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_other_routes() {
        assert_eq!(decode_request_path("/health"), None);
        assert_eq!(decode_request_path("/filesystemx"), None);
        assert_eq!(
            decode_request_path("/filesystem/treehouse"),
            Some((FsRoute::File, "treehouse".to_string()))
        );
    }
}
