use crate::errors::RunnerError;
use anyhow::{Context, Result, anyhow};
use std::path::{Component, Path, PathBuf};

/// Well-known subdirectory nested under an operator-supplied root override.
/// The runner never treats the override itself as the managed directory.
pub const MANAGED_SUBDIR: &str = "leitwerk";

/// Resolve and create the managed root. With an override the managed
/// directory is `<override>/leitwerk`; without one it lives under the
/// platform-local data directory.
pub fn resolve_managed_root(root_override: Option<&Path>) -> Result<PathBuf> {
    let root = match root_override {
        Some(dir) => dir.join(MANAGED_SUBDIR),
        None => dirs::data_local_dir()
            .ok_or_else(|| anyhow!("Could not determine local data directory"))?
            .join(MANAGED_SUBDIR)
            .join("workspaces"),
    };
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create managed root {}", root.display()))?;
    root.canonicalize()
        .with_context(|| format!("Failed to canonicalize managed root {}", root.display()))
}

/// A single path component as used for workspace ids and repo names.
/// Anything that could escape the managed root is rejected outright.
pub fn validate_path_component(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(anyhow!(RunnerError::UnsafePath {
            path: name.to_string(),
        }));
    }
    Ok(())
}

/// Verifies that `candidate` resolves inside `managed_root`, following the
/// deepest existing ancestor through symlinks. Every mutation under the
/// managed root goes through this guard.
pub fn ensure_within_root(managed_root: &Path, candidate: &Path) -> Result<PathBuf> {
    let resolved = canonicalize_with_missing_tail(candidate)?;
    if !resolved.starts_with(managed_root) {
        return Err(anyhow!(RunnerError::UnsafePath {
            path: candidate.display().to_string(),
        }));
    }
    Ok(resolved)
}

/// Canonicalizes the longest existing prefix of `path` and re-appends the
/// missing tail, rejecting any `..` in the tail.
fn canonicalize_with_missing_tail(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        let Some(name) = existing.file_name() else {
            return Err(anyhow!(RunnerError::UnsafePath {
                path: path.display().to_string(),
            }));
        };
        tail.push(name.to_os_string());
        existing = existing
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!(RunnerError::UnsafePath {
                path: path.display().to_string(),
            }))?;
    }

    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(anyhow!(RunnerError::UnsafePath {
            path: path.display().to_string(),
        }));
    }

    let mut resolved = existing
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize {}", existing.display()))?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_runner_error;
    use tempfile::TempDir;

    #[test]
    fn override_gets_the_nested_subdirectory() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_managed_root(Some(tmp.path())).unwrap();
        assert!(root.ends_with(MANAGED_SUBDIR));
        assert_ne!(root, tmp.path().canonicalize().unwrap());
        assert!(root.is_dir());
    }

    #[test]
    fn component_validation_rejects_escapes() {
        assert!(validate_path_component("app").is_ok());
        assert!(validate_path_component("my-repo_2").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0l"] {
            assert!(validate_path_component(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn paths_inside_the_root_pass() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_managed_root(Some(tmp.path())).unwrap();
        let inside = root.join("w-1").join("app");
        let resolved = ensure_within_root(&root, &inside).unwrap();
        assert!(resolved.starts_with(&root));
    }

    #[test]
    fn traversal_and_outside_paths_fail() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_managed_root(Some(tmp.path())).unwrap();

        let escape = root.join("w-1").join("..").join("..").join("elsewhere");
        let error = ensure_within_root(&root, &escape).unwrap_err();
        assert!(matches!(
            as_runner_error(&error),
            Some(RunnerError::UnsafePath { .. })
        ));

        let outside = tmp.path().join("sibling");
        assert!(ensure_within_root(&root, &outside).is_err());
    }

    #[test]
    fn symlink_escape_is_caught() {
        let tmp = TempDir::new().unwrap();
        let root = resolve_managed_root(Some(tmp.path())).unwrap();
        let target = TempDir::new().unwrap();

        let link = root.join("w-link");
        std::os::unix::fs::symlink(target.path(), &link).unwrap();
        assert!(ensure_within_root(&root, &link.join("repo")).is_err());
    }
}
