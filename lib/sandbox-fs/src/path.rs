//! Lexical path helpers.
//!
//! Nothing in here touches a filesystem: `..` is resolved against the
//! preceding component, never against what is stored on disk.

use std::path::{Component, Path, PathBuf};

/// Returns the shortest path equivalent to `path` by lexical processing.
///
/// Separators are collapsed, `.` components dropped, and each `..` removes
/// the preceding normal component. A `..` at the start of a rooted path is
/// dropped; at the start of a relative path it is kept. An empty result is
/// `.`.
pub fn clean(path: &Path) -> PathBuf {
    let mut rooted = false;
    let mut parts: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => rooted = true,
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(Component::ParentDir),
            },
            Component::Normal(_) => parts.push(component),
        }
    }

    let mut cleaned = if rooted {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    cleaned.extend(parts);
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// Joins `path` onto `base` and cleans the result.
///
/// Unlike [`Path::join`], an absolute `path` does not replace `base`: it is
/// appended to it, so `join("/foo", "/bar")` is `/foo/bar`.
pub fn join(base: &Path, path: &Path) -> PathBuf {
    if base.as_os_str().is_empty() {
        return clean(path);
    }
    if path.as_os_str().is_empty() {
        return clean(base);
    }

    let mut joined = base.as_os_str().to_owned();
    joined.push("/");
    joined.push(path.as_os_str());
    clean(Path::new(&joined))
}

/// Whether the cleaned `path` climbs above its starting point.
pub fn is_crossing_boundary(path: &Path) -> bool {
    matches!(clean(path).components().next(), Some(Component::ParentDir))
}

/// Cleans `path` as if it started at `/`.
pub fn to_absolute(path: &Path) -> PathBuf {
    join(Path::new("/"), path)
}

/// The location of `path` relative to `base`, both cleaned lexically.
///
/// Returns `None` if `path` is not `base` or one of its descendants. A path
/// equal to `base` yields `.`.
pub fn relativize(base: &Path, path: &Path) -> Option<PathBuf> {
    let base = clean(base);
    let path = clean(path);
    let rel = path.strip_prefix(&base).ok()?;
    if rel.as_os_str().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(rel.to_path_buf())
    }
}

/// The last element of the cleaned `path`; `/` for the root and `.` for an
/// empty path.
pub fn base_name(path: &Path) -> PathBuf {
    let cleaned = clean(path);
    match cleaned.components().next_back() {
        Some(Component::Normal(name)) => PathBuf::from(name),
        Some(Component::RootDir) | Some(Component::Prefix(_)) => PathBuf::from("/"),
        Some(Component::ParentDir) => PathBuf::from(".."),
        _ => PathBuf::from("."),
    }
}

/// Everything but the last element of the cleaned `path`.
///
/// `parent("a")` is `.`, `parent("/a")` is `/`.
pub fn parent(path: &Path) -> PathBuf {
    let cleaned = clean(path);
    match cleaned.components().next_back() {
        Some(Component::Normal(_)) => match cleaned.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
        Some(Component::ParentDir) => join(&cleaned, Path::new("..")),
        _ => cleaned,
    }
}

/// Whether `path` designates `.` once cleaned.
pub fn is_current_dir(path: &Path) -> bool {
    clean(path) == Path::new(".")
}
