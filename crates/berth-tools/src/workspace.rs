//! Path confinement for tools operating inside a session workspace.

use std::path::{Component, Path, PathBuf};

use berth_types::{BerthError, Result};

/// Join `relative` onto `root`, refusing absolute paths and any `..` that
/// would climb out of the workspace.
pub fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(BerthError::validation(
            relative,
            "path must be relative to the session workspace",
        ));
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(BerthError::validation(
                        relative,
                        "path escapes the session workspace",
                    ));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BerthError::validation(
                    relative,
                    "path must be relative to the session workspace",
                ));
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_simple_relative_path() {
        let root = Path::new("/ws/s1");
        let p = resolve_in_workspace(root, "manifests/deployment.yaml").unwrap();
        assert_eq!(p, PathBuf::from("/ws/s1/manifests/deployment.yaml"));
    }

    #[test]
    fn allows_parent_within_workspace() {
        let root = Path::new("/ws/s1");
        let p = resolve_in_workspace(root, "a/../b.txt").unwrap();
        assert_eq!(p, PathBuf::from("/ws/s1/b.txt"));
    }

    #[test]
    fn rejects_escape() {
        let root = Path::new("/ws/s1");
        assert!(resolve_in_workspace(root, "../s2/secret").is_err());
        assert!(resolve_in_workspace(root, "a/../../x").is_err());
    }

    #[test]
    fn rejects_absolute() {
        let root = Path::new("/ws/s1");
        let err = resolve_in_workspace(root, "/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), berth_types::ErrorKind::ValidationFailed);
    }
}
