//! Path normalization, chunk ID derivation, and root containment.

use std::path::{Component, Path, PathBuf};

/// Strip a single leading UTF-8 BOM (U+FEFF), if present. Interior BOMs are left alone.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Normalize a path to forward-slash form for display and identifier derivation.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Replace path separators and dots with underscores — the transform used by both
/// `chunk_id` and the filter builder's `path`/`file_pattern` sanitizers.
fn underscored(text: &str) -> String {
    text.chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
        .collect()
}

/// Derive the stable chunk id for `(path, start_line)`, optionally with a split-part suffix.
///
/// `chunk_id("src/utils/index.ts", 42, None) == chunk_id("src\\utils\\index.ts", 42, None)
///     == "src_utils_index_ts_L42"`
pub fn chunk_id(path: &str, start_line: usize, part: Option<usize>) -> String {
    let normalized = normalize_path(Path::new(path));
    let base = underscored(&normalized);
    match part {
        Some(p) => format!("{base}_L{start_line}_p{p}"),
        None => format!("{base}_L{start_line}"),
    }
}

/// Canonicalize-then-compare containment: `test` must equal `root`, or begin with `root`
/// followed by a path separator, after both are lexically resolved (`.`/`..` removed).
///
/// Falls back to lexical resolution (no filesystem access) when either path does not exist —
/// this makes the predicate usable for validating paths that are about to be created, not
/// just ones that already exist on disk.
pub fn is_within_root(test: impl AsRef<Path>, root: impl AsRef<Path>) -> bool {
    let test = lexically_resolve(test.as_ref());
    let root = lexically_resolve(root.as_ref());

    let (test, root) = if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
        (
            test.to_string_lossy().to_lowercase(),
            root.to_string_lossy().to_lowercase(),
        )
    } else {
        (
            test.to_string_lossy().to_string(),
            root.to_string_lossy().to_string(),
        )
    };

    if test == root {
        return true;
    }
    let root_with_sep = if root.ends_with('/') {
        root
    } else {
        format!("{root}/")
    };
    test.starts_with(&root_with_sep)
}

/// Resolve `.`/`..` components without touching the filesystem (unlike `fs::canonicalize`,
/// this works for paths that don't exist yet).
fn lexically_resolve(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_cross_platform_deterministic() {
        assert_eq!(
            chunk_id("src/utils/index.ts", 42, None),
            "src_utils_index_ts_L42"
        );
        assert_eq!(
            chunk_id("src\\utils\\index.ts", 42, None),
            chunk_id("src/utils/index.ts", 42, None)
        );
    }

    #[test]
    fn chunk_id_carries_part_suffix() {
        assert_eq!(chunk_id("a/b.rs", 10, Some(2)), "a_b_rs_L10_p2");
    }

    #[test]
    fn bom_stripped_only_at_start() {
        let with_bom = "\u{feff}fn main() {}";
        assert_eq!(strip_bom(with_bom), "fn main() {}");
        let interior = "fn main() {\u{feff}}";
        assert_eq!(strip_bom(interior), interior);
    }

    #[test]
    fn path_traversal_is_rejected() {
        assert!(!is_within_root(
            "../../../etc/passwd",
            "/home/user/project"
        ));
    }

    #[test]
    fn subdirectory_is_contained() {
        assert!(is_within_root(
            "/home/user/project/src",
            "/home/user/project"
        ));
    }

    #[test]
    fn sibling_directory_is_not_contained() {
        assert!(!is_within_root(
            "/home/user/project2",
            "/home/user/project"
        ));
    }

    #[test]
    fn root_itself_is_contained() {
        assert!(is_within_root("/home/user/project", "/home/user/project"));
    }
}
