// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration directory management.
//!
//! Hearth keeps all of its persistent state in one place called the
//! __configuration directory__. The default location is `$HOME/.hearth`, but
//! it can be moved through the `HEARTH_HOME` environment variable.
//!
//! # Configuration Directory Layout
//!
//! - `engine.json`: ledger of cleaners and owned paths.
//! - `repos.json`: registered source repositories.
//! - `facts/<repoid>.json`: auxiliary facts recorded per repository.
//! - `update-*`: status marker files, see [`crate::status`].
//!
//! Every JSON document is replaced atomically by writing to a temporary file
//! in the same directory, and renaming it over the original.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Paths of everything stored in the configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Open configuration directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if directory cannot be created.
    #[instrument(skip(root), level = "debug")]
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        mkdirp::mkdirp(&root).map_err(|source| StoreError::Io {
            source,
            path: root.clone(),
        })?;
        debug!("configuration directory at {}", root.display());

        Ok(Self { root })
    }

    /// Absolute path to the configuration directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger(&self) -> PathBuf {
        self.root.join("engine.json")
    }

    pub fn repo_list(&self) -> PathBuf {
        self.root.join("repos.json")
    }

    pub fn facts_dir(&self) -> PathBuf {
        self.root.join("facts")
    }

    pub fn run_marker(&self) -> PathBuf {
        self.root.join("update-running")
    }

    pub fn time_marker(&self) -> PathBuf {
        self.root.join("update-time")
    }

    pub fn fail_marker(&self) -> PathBuf {
        self.root.join("update-failed")
    }

    pub fn pause_marker(&self) -> PathBuf {
        self.root.join("update-paused")
    }

    pub fn section_marker(&self) -> PathBuf {
        self.root.join("update-section")
    }
}

/// A registered source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Opaque repository identity, i.e., root commit id.
    #[serde(rename = "repoid")]
    pub repo_id: String,

    /// Absolute path to local clone.
    #[serde(rename = "localpath")]
    pub local_path: PathBuf,

    /// Canonical remote URL this clone was made from, if any.
    #[serde(default, rename = "canonical", skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

impl RepoEntry {
    /// Short form of repository identity for display.
    pub fn short_id(&self) -> &str {
        self.repo_id.get(..8).unwrap_or(&self.repo_id)
    }
}

/// Listing of registered source repositories.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoList {
    path: PathBuf,
    entries: Vec<RepoEntry>,
}

impl RepoList {
    /// Load repository list from layout.
    ///
    /// A missing file is treated as an empty list.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if file cannot be read.
    /// - Return [`StoreError::Json`] if file contents are invalid.
    pub fn load(layout: &Layout) -> Result<Self> {
        let path = layout.repo_list();
        let entries = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, entries })
    }

    /// Write repository list back out atomically.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if file cannot be written.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)
    }

    /// Insert new entry, replacing any entry with the same identity.
    pub fn add(&mut self, entry: RepoEntry) {
        match self.entries.iter_mut().find(|e| e.repo_id == entry.repo_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove entry by identity, returning it if it was present.
    pub fn remove(&mut self, repo_id: &str) -> Option<RepoEntry> {
        let index = self.entries.iter().position(|e| e.repo_id == repo_id)?;
        Some(self.entries.remove(index))
    }

    /// Find entry by full identity, unique short identity prefix, local path,
    /// or canonical URL.
    pub fn find(&self, identifier: &str) -> Option<&RepoEntry> {
        if let Some(entry) = self.entries.iter().find(|e| e.repo_id == identifier) {
            return Some(entry);
        }

        let by_prefix = self
            .entries
            .iter()
            .filter(|e| identifier.len() >= 4 && e.repo_id.starts_with(identifier))
            .collect::<Vec<_>>();
        if let [entry] = by_prefix.as_slice() {
            return Some(entry);
        }

        let wanted = crate::path::resolve(Path::new(identifier));
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| crate::path::resolve(&e.local_path) == wanted)
        {
            return Some(entry);
        }

        self.find_by_canonical(identifier)
    }

    pub fn find_by_canonical(&self, url: &str) -> Option<&RepoEntry> {
        self.entries
            .iter()
            .find(|e| e.canonical.as_deref() == Some(url))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepoEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read JSON document at path.
///
/// Returns `None` if the file does not exist or is empty.
///
/// # Errors
///
/// - Return [`StoreError::Io`] if file cannot be read.
/// - Return [`StoreError::Json`] if contents are not valid for `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                source,
                path: path.into(),
            })
        }
    };

    if data.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&data)
        .map(Some)
        .map_err(|source| StoreError::Json {
            source,
            path: path.into(),
        })
}

/// Write JSON document at path atomically.
///
/// Contents are written to a temporary file in the same directory as the
/// target, flushed, and then renamed over the target. Readers therefore never
/// observe a partially written document.
///
/// # Errors
///
/// - Return [`StoreError::Io`] if temporary file cannot be created.
/// - Return [`StoreError::Json`] if value cannot be serialized.
/// - Return [`StoreError::Persist`] if rename fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    mkdirp::mkdirp(parent).map_err(|source| StoreError::Io {
        source,
        path: parent.into(),
    })?;

    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| StoreError::Io {
        source,
        path: parent.into(),
    })?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| StoreError::Json {
            source,
            path: path.into(),
        })?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|source| StoreError::Io {
                source,
                path: path.into(),
            })?;
    }
    tmp.persist(path)?;

    Ok(())
}

/// Configuration directory error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("failed to access {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// JSON document is malformed.
    #[error("invalid json in {path:?}")]
    Json {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Atomic rename of temporary file failed.
    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, path: &str) -> RepoEntry {
        RepoEntry {
            repo_id: id.into(),
            local_path: path.into(),
            canonical: None,
        }
    }

    #[test]
    fn repo_list_round_trips_through_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = Layout::open(tmp.path().join("cfg"))?;

        let mut list = RepoList::load(&layout)?;
        assert!(list.is_empty());
        list.add(entry("0123456789abcdef", "/src/dots"));
        list.add(RepoEntry {
            canonical: Some("https://github.com/blah/dots.git".into()),
            ..entry("fedcba9876543210", "/src/work")
        });
        list.save()?;

        let list = RepoList::load(&layout)?;
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.find("01234567").map(|e| e.local_path.clone()),
            Some(PathBuf::from("/src/dots"))
        );
        assert_eq!(
            list.find("https://github.com/blah/dots.git")
                .map(|e| e.short_id()),
            Some("fedcba98")
        );
        assert_eq!(list.find("/src/work").map(|e| e.short_id()), Some("fedcba98"));
        assert!(list.find("nope").is_none());

        Ok(())
    }

    #[test]
    fn repo_list_add_replaces_same_identity() {
        let mut list = RepoList::default();
        list.add(entry("aaaa1111", "/old"));
        list.add(entry("aaaa1111", "/new"));

        assert_eq!(list.len(), 1);
        assert_eq!(list.remove("aaaa1111"), Some(entry("aaaa1111", "/new")));
        assert!(list.remove("aaaa1111").is_none());
    }

    #[test]
    fn read_json_treats_missing_and_empty_as_none() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("doc.json");

        assert_eq!(read_json::<Vec<String>>(&path)?, None);
        fs::write(&path, "")?;
        assert_eq!(read_json::<Vec<String>>(&path)?, None);
        write_json_atomic(&path, &vec!["a".to_string()])?;
        assert_eq!(read_json::<Vec<String>>(&path)?, Some(vec!["a".to_string()]));

        fs::write(&path, "{ nope")?;
        assert!(matches!(
            read_json::<Vec<String>>(&path),
            Err(StoreError::Json { .. })
        ));

        Ok(())
    }
}
