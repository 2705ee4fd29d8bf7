// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way. This includes the location of the
//! hearth configuration directory, expansion of user supplied paths from
//! scripts, and the path containment relation used during cleanup.

use std::{
    env, fs,
    path::{Component, Path, PathBuf},
};

/// Environment variable that overrides the default configuration directory.
pub const HEARTH_HOME_ENV: &str = "HEARTH_HOME";

/// Upper bound on symlink hops followed by [`resolve`].
const MAX_LINK_DEPTH: usize = 40;

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoWayHome`] if home directory path cannot be
///   determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(PathError::NoWayHome(NoWayHome))
}

/// Determine default absolute path to hearth configuration directory.
///
/// Uses `$HEARTH_HOME` when it is set and non-empty, otherwise
/// `$HOME/.hearth`. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoWayHome`] if home directory path cannot be
///   determined.
pub fn default_hearth_dir() -> Result<PathBuf> {
    match env::var_os(HEARTH_HOME_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(home_dir()?.join(".hearth")),
    }
}

/// Expand a user supplied path relative to a home directory.
///
/// A leading `~` expands to `home`, and `$VAR` references expand through the
/// process environment. Relative results are joined onto `home`.
///
/// # Errors
///
/// - Return [`PathError::ShellExpansion`] if an environment variable is
///   missing.
/// - Return [`PathError::CurrentDirRelative`] if path starts with "./",
///   because scripts never run relative to the current directory.
pub fn expand_home_path(raw: &str, home: &Path) -> Result<PathBuf> {
    let expanded = expand(raw, home)?;
    Ok(home.join(expanded))
}

/// Expand a user supplied path relative to a repository root.
///
/// Same rules as [`expand_home_path`], except relative results are joined
/// onto `repo_root`.
///
/// # Errors
///
/// - Return [`PathError::ShellExpansion`] if an environment variable is
///   missing.
/// - Return [`PathError::CurrentDirRelative`] if path starts with "./".
pub fn expand_repo_path(raw: &str, repo_root: &Path, home: &Path) -> Result<PathBuf> {
    let expanded = expand(raw, home)?;
    Ok(repo_root.join(expanded))
}

fn expand(raw: &str, home: &Path) -> Result<PathBuf> {
    if raw.starts_with("./") || raw == "." {
        return Err(PathError::CurrentDirRelative(raw.into()));
    }

    let expanded = shellexpand::full_with_context(
        raw,
        || home.to_str(),
        |var| env::var(var).map(Some),
    )?;

    Ok(PathBuf::from(expanded.into_owned()))
}

/// Check if anything lives at path, including dangling symlinks.
pub fn exists(path: &Path) -> bool {
    path.exists() || path.is_symlink()
}

/// Resolve all symlinks in path without requiring it to exist.
///
/// Behaves like a lenient `realpath`: each component is resolved in turn,
/// components that do not exist are kept as-is, and symlink chains longer
/// than an internal bound are left unresolved.
pub fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap_or_default().join(path)
    };

    resolve_with_depth(&absolute, 0)
}

fn resolve_with_depth(path: &Path, depth: usize) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if depth >= MAX_LINK_DEPTH {
                    continue;
                }

                if let Ok(target) = fs::read_link(&resolved) {
                    resolved.pop();
                    let joined = resolved.join(target);
                    resolved = resolve_with_depth(&joined, depth + 1);
                }
            }
        }
    }

    resolved
}

/// Check if `parent` must exist for `child` to refer to a valid entry.
///
/// True when `parent` is `child` itself, or any literal ancestor of `child`.
/// Also true when `parent` is a symlink whose resolved target is reached while
/// walking the components of `child`, since removing the link would sever the
/// path to `child`.
///
/// Both paths are expected to be absolute. A `parent` without a final
/// component (e.g., "/") is never considered necessary.
pub fn is_necessary_path(parent: &Path, child: &Path) -> bool {
    let (Some(head), Some(tail)) = (parent.parent(), parent.file_name()) else {
        return false;
    };
    let head = resolve(head);
    let full_parent = resolve(parent);

    let parts = child
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect::<Vec<_>>();

    let mut prefix = PathBuf::from("/");
    let mut remaining = parts.as_slice();
    loop {
        // INVARIANT: Stumbling upon the parent while rebuilding child's path
        // means child depends on it.
        if prefix == full_parent && !remaining.is_empty() {
            return true;
        }

        if prefix == head && remaining.first().is_some_and(|next| *next == tail) {
            return true;
        }

        let Some((next, rest)) = remaining.split_first() else {
            break;
        };
        prefix = resolve(&prefix.join(next));
        remaining = rest;
    }

    false
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Path handling error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Home directory cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    /// Failed to perform shell expansion on path.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Path is relative to the current working directory.
    #[error("path {0:?} cannot be relative to the current directory")]
    CurrentDirRelative(String),
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;
