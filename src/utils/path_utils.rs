use crate::error::{DStoreError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

/// Makes `path_str` absolute against `files_root` and folds `.`/`..`
/// components. Existing paths are canonicalized.
pub fn normalize_path(path_str: &str, files_root: &Path) -> Result<PathBuf> {
    if path_str.trim().is_empty() {
        return Err(DStoreError::InvalidArgument("empty path".to_string()));
    }
    let expanded_path = expand_tilde_path_buf(path_str)?;

    let absolute_path = if expanded_path.is_absolute() {
        expanded_path
    } else {
        files_root.join(expanded_path)
    };

    let mut components = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
                // `/..` stays `/`
            }
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    let folded: PathBuf = components.iter().collect();

    match dunce::canonicalize(&folded) {
        Ok(canonical_path) => Ok(canonical_path),
        Err(_) => Ok(folded),
    }
}

/// Resolves a path that must already exist.
pub fn existing_path(path_str: &str, files_root: &Path) -> Result<PathBuf> {
    let path = normalize_path(path_str, files_root)?;
    debug!(path = %path.display(), "Resolved existing path");
    if !path.exists() {
        return Err(DStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Path does not exist: {}", path.display()),
        )));
    }
    Ok(path)
}

/// Resolves a path whose parent directory must exist.
pub fn creatable_path(path_str: &str, files_root: &Path) -> Result<PathBuf> {
    let path = normalize_path(path_str, files_root)?;
    match path.parent() {
        Some(parent) if !parent.is_dir() => Err(DStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Parent directory does not exist: {}", parent.display()),
        ))),
        _ => Ok(path),
    }
}

/// Joins a DStore folder/name pair the way file elements store them.
pub fn join_remote(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return folder.to_string();
    }
    let sep = if folder.ends_with('/') || folder.ends_with('\\') { "" } else { "/" };
    format!("{}{}{}", folder, sep, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        assert_eq!(expand_tilde_path_buf("/srv/data").unwrap(), PathBuf::from("/srv/data"));
        assert_eq!(expand_tilde_path_buf("a/~b").unwrap(), PathBuf::from("a/~b"));
        if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
            assert_eq!(
                expand_tilde_path_buf("~/notes.txt").unwrap(),
                PathBuf::from(home).join("notes.txt")
            );
        }
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(root.join("a")).unwrap();
        let resolved = normalize_path("a/../a/./b.txt", &root).unwrap();
        assert_eq!(resolved, root.join("a").join("b.txt"));
    }

    #[test]
    fn missing_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = existing_path("nope", dir.path()).unwrap_err();
        assert_eq!(err.download_class(), "FileNotFoundException");
        assert!(creatable_path("missing/child", dir.path()).is_err());
        assert!(creatable_path("child", dir.path()).is_ok());
    }

    #[test]
    fn remote_join() {
        assert_eq!(join_remote("/tmp", "x"), "/tmp/x");
        assert_eq!(join_remote("/", "x"), "/x");
        assert_eq!(join_remote("", "x"), "x");
    }
}
