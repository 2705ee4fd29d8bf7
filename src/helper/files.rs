// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Whole filesystem entry helpers.
//!
//! Directories, symlinks, and whole files need no cleaner of their own. The
//! engine removes them through path ownership alone once nothing declares
//! them anymore.

use crate::helper::{Helper, HelperError, Outcome, PathKind, Result, Runtime};

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Ensure a directory exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeDir {
    path: PathBuf,
}

impl MakeDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Helper for MakeDir {
    fn description(&self) -> String {
        format!("Create directory {}", self.path.display())
    }

    fn is_done(&self) -> Result<bool> {
        Ok(self.path.is_dir())
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        if crate::path::exists(&self.path) && !self.path.is_dir() {
            return Ok(Outcome::Failed(format!(
                "{} already exists and is not a directory",
                self.path.display()
            )));
        }

        fs::create_dir(&self.path).map_err(HelperError::io(&self.path))?;
        Ok(Outcome::Applied(vec![self.path.clone()]))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::from([(self.path.clone(), PathKind::FolderOnly)])
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.path
    }
}

/// Ensure a symlink exists and points at target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeSymlink {
    target: PathBuf,
    link: PathBuf,
}

impl MakeSymlink {
    pub fn new(target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            link: link.into(),
        }
    }
}

impl Helper for MakeSymlink {
    fn description(&self) -> String {
        format!(
            "Create symlink {} -> {}",
            self.link.display(),
            self.target.display()
        )
    }

    fn is_done(&self) -> Result<bool> {
        Ok(self.link.is_symlink()
            && fs::read_link(&self.link).map_err(HelperError::io(&self.link))? == self.target)
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        if self.link.is_symlink() {
            let current = fs::read_link(&self.link).map_err(HelperError::io(&self.link))?;
            return Ok(Outcome::Failed(format!(
                "symlink {} points at {}, not {}",
                self.link.display(),
                current.display(),
                self.target.display()
            )));
        }

        if self.link.exists() {
            return Ok(Outcome::Failed(format!(
                "{} already exists",
                self.link.display()
            )));
        }

        std::os::unix::fs::symlink(&self.target, &self.link)
            .map_err(HelperError::io(&self.link))?;
        Ok(Outcome::Applied(vec![self.link.clone()]))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::from([(self.link.clone(), PathKind::Symlink)])
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.link
    }
}

/// Ensure a file has exactly the given contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFile {
    path: PathBuf,
    contents: String,
}

impl WriteFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

impl Helper for WriteFile {
    fn description(&self) -> String {
        format!("Write file {}", self.path.display())
    }

    fn is_done(&self) -> Result<bool> {
        if self.path.is_symlink() {
            return Ok(false);
        }

        match fs::read_to_string(&self.path) {
            Ok(current) => Ok(current == self.contents),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(HelperError::Io {
                source,
                path: self.path.clone(),
            }),
        }
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        if self.path.is_symlink() {
            return Ok(Outcome::Failed(format!(
                "refusing to write through symlink {}",
                self.path.display()
            )));
        }

        fs::write(&self.path, &self.contents).map_err(HelperError::io(&self.path))?;
        Ok(Outcome::Applied(vec![self.path.clone()]))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::from([(self.path.clone(), PathKind::FileWhole)])
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::facts::FactStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn make_symlink_refuses_to_clobber() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut rt = Runtime::new(FactStore::open(tmp.path().join("facts")));
        let target = tmp.path().join("target");
        let link = tmp.path().join("link");
        fs::create_dir(&target)?;

        let helper = MakeSymlink::new(&target, &link);
        assert!(!helper.is_done()?);
        assert_eq!(helper.make_changes(&mut rt)?, Outcome::Applied(vec![link.clone()]));
        assert!(helper.is_done()?);

        let other = MakeSymlink::new(tmp.path().join("elsewhere"), &link);
        assert!(!other.is_done()?);
        assert!(matches!(other.make_changes(&mut rt)?, Outcome::Failed(_)));
        assert_eq!(fs::read_link(&link)?, target);

        Ok(())
    }

    #[test]
    fn make_dir_fails_over_existing_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut rt = Runtime::new(FactStore::open(tmp.path().join("facts")));
        let path = tmp.path().join("taken");
        fs::write(&path, "")?;

        let helper = MakeDir::new(&path);
        assert!(!helper.is_done()?);
        assert!(matches!(helper.make_changes(&mut rt)?, Outcome::Failed(_)));

        Ok(())
    }
}
