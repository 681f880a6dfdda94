//! Path confinement and environment restriction for launched processes.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Directory names that mark a PATH entry as test tooling.
const TEST_COMPONENTS: &[&str] = &["test", "tests", "testing"];

/// Resolves `path` and checks it lies inside one of `roots`.
///
/// The path does not need to exist yet: a missing leaf is resolved through
/// its parent, so log files and generated configs can be checked before
/// they are created. Roots that cannot be resolved are ignored.
pub fn ensure_within(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, PathError> {
    let resolved = resolve(path)?;
    let inside = roots
        .iter()
        .filter_map(|root| std::fs::canonicalize(root).ok())
        .any(|root| resolved.starts_with(&root));
    if inside {
        Ok(resolved)
    } else {
        Err(PathError::Traversal { path: resolved })
    }
}

fn resolve(path: &Path) -> Result<PathBuf, PathError> {
    let unresolvable = |e: std::io::Error| PathError::Unresolvable {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Err(unresolvable(e));
            };
            if matches!(Path::new(name).components().next(), Some(Component::ParentDir)) {
                return Err(unresolvable(e));
            }
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            std::fs::canonicalize(parent)
                .map(|p| p.join(name))
                .map_err(unresolvable)
        }
        Err(e) => Err(unresolvable(e)),
    }
}

/// True when `path` is a regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Drops PATH entries that contain a test-oriented directory component.
pub fn filter_path(path_var: &OsStr) -> OsString {
    let kept = std::env::split_paths(path_var).filter(|entry| {
        !entry.components().any(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .is_some_and(|n| TEST_COMPONENTS.contains(&n.to_ascii_lowercase().as_str())),
            _ => false,
        })
    });
    std::env::join_paths(kept).unwrap_or_default()
}
