// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Units of desired state and their reversal.
//!
//! A __helper__ describes one piece of desired state, e.g., "this directory
//! exists" or "this line is in that file". Helpers know how to check if they
//! are already satisfied, how to apply themselves, which filesystem paths they
//! take ownership of, and which logical resources they claim.
//!
//! A __cleaner__ is the serializable reversal descriptor a helper hands back
//! to the engine. Cleaners are persisted in the ledger as a type tag plus a
//! JSON parameter payload, and are reconstructed on later runs through a
//! closed [`CleanerRegistry`]. Two cleaners are the same if their tag and
//! parameters are equal.
//!
//! # See Also
//!
//! - [`crate::engine::Engine`]

pub mod files;
pub mod lines;
pub mod package;
pub mod pip;
pub mod source;

use crate::engine::{
    facts::{FactStore, Facts},
    ledger::CleanerRecord,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};

/// How much of a path the engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    /// Whole file is owned, deleted entirely on cleanup.
    FileWhole,

    /// Only some content is owned, file deleted only if it ends up empty.
    FilePart,

    /// Directory itself is owned, must be empty to remove.
    FolderOnly,

    /// Directory and everything inside of it is owned.
    FolderAll,

    /// Symlink is owned, regardless of whether its target exists.
    Symlink,
}

impl PathKind {
    /// Check if entry on disk at path still has this kind.
    ///
    /// Symlinks are never treated as the file or directory they point at.
    pub fn matches_on_disk(self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        let file_type = meta.file_type();

        match self {
            Self::FileWhole | Self::FilePart => file_type.is_file(),
            Self::FolderOnly | Self::FolderAll => file_type.is_dir(),
            Self::Symlink => file_type.is_symlink(),
        }
    }
}

impl Display for PathKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::FileWhole => "file_whole",
            Self::FilePart => "file_part",
            Self::FolderOnly => "folder_only",
            Self::FolderAll => "folder_all",
            Self::Symlink => "symlink",
        };
        fmt.write_str(name)
    }
}

/// Result of asking a helper or cleaner to make its changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Changes were made, listing the paths that were touched.
    Applied(Vec<PathBuf>),

    /// Closer inspection showed nothing needed to change.
    NotNeeded,

    /// Expected failure that should be reported to the user.
    Failed(String),

    /// Cleaner found that it cannot proceed safely.
    Obstructed(String),
}

/// Context handed to helpers and cleaners while they make changes.
#[derive(Debug)]
pub struct Runtime {
    facts: FactStore,
    interactive: bool,
    allow_pull: bool,
}

impl Runtime {
    /// Construct new runtime around fact store.
    ///
    /// Defaults to non-interactive with network pulls allowed.
    pub fn new(facts: FactStore) -> Self {
        Self {
            facts,
            interactive: false,
            allow_pull: true,
        }
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_allow_pull(mut self, allow_pull: bool) -> Self {
        self.allow_pull = allow_pull;
        self
    }

    /// Access facts of repository.
    pub fn facts<'a>(&'a mut self, repo_id: &'a str) -> Facts<'a> {
        self.facts.scope(repo_id)
    }

    /// Whether the user can be prompted, e.g., for `sudo`.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Whether network access for pulling updates is allowed.
    pub fn allow_pull(&self) -> bool {
        self.allow_pull
    }
}

/// One unit of desired state.
pub trait Helper: Debug {
    /// Human readable description.
    fn description(&self) -> String;

    /// Check if desired state is already in place.
    ///
    /// Must not have any side effects.
    fn is_done(&self) -> Result<bool>;

    /// Put desired state in place.
    ///
    /// Expected failures are reported through [`Outcome::Failed`]. Errors
    /// abort the whole run.
    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome>;

    /// Logical resources that no stale cleaner may touch.
    fn claims(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Paths this helper takes ownership of.
    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::new()
    }

    /// Check if changes to path may undo this helper's work.
    fn affects_path(&self, _path: &Path) -> bool {
        false
    }

    /// Reversal descriptor for this helper, if any.
    fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
        None
    }
}

/// Serializable reversal of a helper's changes.
pub trait Cleaner: Debug {
    /// Stable type tag used for persistence.
    fn tag(&self) -> &'static str;

    /// Parameters sufficient to reconstruct this cleaner.
    fn params(&self) -> Value;

    /// Human readable description.
    fn description(&self) -> String;

    /// Check if effect to reverse is still actually present.
    fn is_needed(&self, runtime: &mut Runtime) -> Result<bool>;

    /// Logical resources that must be unclaimed before this cleaner may run.
    fn needs_claims(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Check if this cleaner depends on path continuing to exist.
    fn wants_path(&self, _path: &Path) -> bool {
        false
    }

    /// Reverse the changes.
    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome>;

    /// Persisted form of this cleaner.
    fn record(&self) -> CleanerRecord {
        CleanerRecord {
            tag: self.tag().to_string(),
            params: self.params(),
        }
    }

    /// Structural equality over tag and parameters.
    fn same_as(&self, other: &dyn Cleaner) -> bool {
        self.tag() == other.tag() && self.params() == other.params()
    }
}

/// Cleaner type that can be reconstructed from its persisted record.
pub trait Persisted: Cleaner + DeserializeOwned + 'static {
    /// Stable type tag used for persistence.
    const TAG: &'static str;
}

type Loader = fn(Value) -> Result<Box<dyn Cleaner>>;

/// Closed mapping of cleaner type tags to their loaders.
#[derive(Debug, Clone)]
pub struct CleanerRegistry {
    loaders: HashMap<&'static str, Loader>,
}

impl CleanerRegistry {
    /// Construct registry with no cleaners known.
    pub fn empty() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Register cleaner type under its own tag.
    pub fn register<C: Persisted>(&mut self) {
        self.loaders.insert(C::TAG, load::<C>);
    }

    /// Reconstruct cleaner from persisted record.
    ///
    /// Returns `None` if the tag is unknown.
    pub fn load(&self, record: &CleanerRecord) -> Option<Result<Box<dyn Cleaner>>> {
        self.loaders
            .get(record.tag.as_str())
            .map(|loader| loader(record.params.clone()))
    }
}

impl Default for CleanerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<lines::CleanLineInFile>();
        registry.register::<lines::CleanBlockInFile>();
        registry.register::<package::PackageCleaner>();
        registry.register::<pip::PipCleaner>();
        registry
    }
}

fn load<C: Persisted>(params: Value) -> Result<Box<dyn Cleaner>> {
    Ok(Box::new(serde_json::from_value::<C>(params)?))
}

/// Check if path is the file itself, or something the file needs.
pub(crate) fn file_needs(file: &Path, path: &Path) -> bool {
    path == file || crate::path::is_necessary_path(path, file)
}

/// Helper and cleaner error types.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    /// Filesystem operation failed.
    #[error("failed to access {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Line content cannot be managed.
    #[error("cannot manage line {line:?}: {reason}")]
    InvalidLine { line: String, reason: &'static str },

    /// Required executable is not installed.
    #[error("{0} executable not found")]
    MissingExecutable(String),

    /// System call failed.
    #[error(transparent)]
    System(#[from] crate::system::SystemError),

    /// Fact storage failed.
    #[error(transparent)]
    Facts(#[from] crate::store::StoreError),

    /// Cleaner parameters are malformed.
    #[error(transparent)]
    Params(#[from] serde_json::Error),
}

impl HelperError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = HelperError> = std::result::Result<T, E>;
