// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Update orchestration.
//!
//! An __update__ pulls every selected source repository, runs the scripts
//! they carry through one engine, and cleans up whatever those scripts no
//! longer declare. Cleanup is destructive, so it only happens after a clean
//! run over every registered repository without section filters.

use crate::{
    engine::{facts::FactStore, Conflicts, Engine, EngineError},
    helper::{CleanerRegistry, Runtime},
    repo::{GitRepo, RepoError},
    script::{RunContext, ScriptError, ScriptSource},
    status::{self, FailureKind, RunGuard, StatusError},
    store::{Layout, RepoEntry, RepoList, StoreError},
};

use indicatif::ProgressBar;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Settings of one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Pull repositories before running their scripts.
    pub pull: bool,

    /// Only run these sections.
    pub only: Vec<String>,

    /// Run every section except these.
    pub skip: Vec<String>,

    /// What cleanup does when something still wants a stale path.
    pub conflicts: Conflicts,

    /// Whether the user can be prompted.
    pub interactive: bool,

    /// Home directory scripts expand paths against.
    pub home: PathBuf,
}

impl UpdateOptions {
    /// Construct default options for home directory.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            pull: true,
            only: Vec::new(),
            skip: Vec::new(),
            conflicts: Conflicts::default(),
            interactive: false,
            home: home.into(),
        }
    }

    fn progress_bar(&self) -> ProgressBar {
        if self.interactive {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        }
    }
}

/// Outcome of an update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Warnings raised along the way.
    pub warnings: Vec<String>,

    /// Number of helpers that had to make changes.
    pub changes: usize,

    /// Whether cleanup ran.
    pub cleaned_up: bool,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Update selected repositories.
///
/// The update covers every registered repository if `repos` names all of
/// them. Status markers are updated no matter how the update ends.
///
/// # Errors
///
/// - Return [`UpdateError::Status`] if another update is running.
/// - Return [`UpdateError::ConflictingFilters`] if both `only` and `skip`
///   are set.
/// - Return [`UpdateError::Script`] if a script is malformed.
/// - Return [`UpdateError::Engine`] if helpers, cleanup, or the ledger fail.
#[instrument(skip(layout, repos, options, source), level = "debug")]
pub fn run_update(
    layout: &Layout,
    repos: &[RepoEntry],
    options: &UpdateOptions,
    source: &dyn ScriptSource,
) -> Result<UpdateReport> {
    if !options.only.is_empty() && !options.skip.is_empty() {
        return Err(UpdateError::ConflictingFilters);
    }

    let guard = RunGuard::acquire(layout)?;
    let mut failure = None;
    match update_all(layout, repos, options, source, &guard, &mut failure) {
        Ok(report) => {
            if report.is_success() {
                status::record_success(layout)?;
            } else {
                status::record_failure(layout, failure.unwrap_or_default())?;
            }
            Ok(report)
        }
        Err(error) => {
            if let Err(status_error) = status::record_failure(layout, FailureKind::Failed) {
                warn!("{status_error}");
            }
            Err(error)
        }
    }
}

fn update_all(
    layout: &Layout,
    repos: &[RepoEntry],
    options: &UpdateOptions,
    source: &dyn ScriptSource,
    guard: &RunGuard,
    failure: &mut Option<FailureKind>,
) -> Result<UpdateReport> {
    let registered = RepoList::load(layout)?;
    let covers_all = registered
        .iter()
        .all(|entry| repos.iter().any(|repo| repo.repo_id == entry.repo_id));

    let runtime = Runtime::new(FactStore::open(layout.facts_dir()))
        .with_interactive(options.interactive)
        .with_allow_pull(options.pull);
    let mut engine = Engine::open(layout.ledger(), &CleanerRegistry::default(), runtime)?
        .with_sections(options.only.iter().cloned(), options.skip.iter().cloned())
        .with_section_marker(guard.section_marker());

    for repo in repos {
        info!(
            "update from {} [{}]",
            repo.local_path.display(),
            repo.short_id()
        );

        if options.pull {
            if let Some(kind) = pull_repo(&mut engine, repo, options) {
                failure.get_or_insert(kind);
            }
        }

        let mut ctx = RunContext::new(&mut engine, repo.clone(), &options.home);
        source.register(repo, &mut ctx)?;
    }

    engine.execute()?;

    let cleaned_up = covers_all && !engine.is_filtered() && engine.warnings().is_empty();
    if cleaned_up {
        engine.cleanup(options.conflicts)?;
    } else {
        info!("skip cleanup");
    }

    Ok(UpdateReport {
        warnings: engine.warnings().to_vec(),
        changes: engine.changes_made(),
        cleaned_up,
    })
}

fn pull_repo(engine: &mut Engine, repo: &RepoEntry, options: &UpdateOptions) -> Option<FailureKind> {
    let path = repo.local_path.to_string_lossy();
    let git = match GitRepo::from_path_or_url(&path) {
        Ok(git) => git,
        Err(error) => {
            engine.warn(format!("cannot pull {path}: {error}"));
            return None;
        }
    };

    match git.is_dirty() {
        Ok(false) => {}
        Ok(true) => {
            engine.warn(format!("{path} has uncommitted changes, not pulling"));
            return Some(FailureKind::Dirty);
        }
        Err(error) => {
            engine.warn(format!("cannot pull {path}: {error}"));
            return None;
        }
    }

    match git.pull(options.progress_bar()) {
        Ok(()) => None,
        Err(RepoError::Connection(error)) => {
            engine.warn(format!("cannot reach remote of {path}: {error}"));
            Some(FailureKind::NoConnection)
        }
        Err(error) => {
            engine.warn(format!("cannot pull {path}: {error}"));
            None
        }
    }
}

/// Repository registered through [`add_repository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    /// Registered repository.
    pub entry: RepoEntry,

    /// Whether the repository was already registered before.
    pub existed: bool,
}

/// Register local repository, or clone remote repository and register it.
///
/// Remote repositories are cloned into `dest`, or into a directory of home
/// named after the repository. An existing clone of the same repository at
/// the destination is reused.
///
/// # Errors
///
/// - Return [`UpdateError::Repo`] if path is not a repository, has no
///   commits, or cannot be cloned.
/// - Return [`UpdateError::DestinationForLocal`] if `dest` is given for a
///   local repository.
/// - Return [`UpdateError::DestinationTaken`] if something else already
///   lives at the destination.
/// - Return [`UpdateError::Store`] if repository list cannot be written.
#[instrument(skip(layout, dest, options), level = "debug")]
pub fn add_repository(
    layout: &Layout,
    raw: &str,
    dest: Option<&Path>,
    options: &UpdateOptions,
) -> Result<Added> {
    let git = GitRepo::from_path_or_url(raw)?;
    let mut list = RepoList::load(layout)?;

    if !git.is_remote() {
        if dest.is_some() {
            return Err(UpdateError::DestinationForLocal);
        }

        let entry = RepoEntry {
            repo_id: git.repo_id()?,
            local_path: git.local_path()?,
            canonical: None,
        };
        let existed = list.find(&entry.repo_id).is_some();
        list.add(entry.clone());
        list.save()?;
        return Ok(Added { entry, existed });
    }

    if let Some(entry) = git.canonical_url().and_then(|url| list.find_by_canonical(url)) {
        info!("{raw} was already added as [{}]", entry.short_id());
        return Ok(Added {
            entry: entry.clone(),
            existed: true,
        });
    }

    let dest = match dest {
        Some(dest) => dest.to_path_buf(),
        None => options.home.join(
            git.suggested_name()
                .ok_or_else(|| UpdateError::NoDestination(raw.into()))?,
        ),
    };
    let parent = dest
        .parent()
        .ok_or_else(|| UpdateError::NoDestination(raw.into()))?;
    mkdirp::mkdirp(parent).map_err(|source| UpdateError::Io {
        source,
        path: parent.into(),
    })?;

    // INVARIANT: Clone next to the destination first, so nothing is left
    // at the destination if the clone turns out to be unusable.
    let scratch = tempfile::tempdir_in(parent).map_err(|source| UpdateError::Io {
        source,
        path: parent.into(),
    })?;
    let cloned = git.clone_to_path(scratch.path().join("clone"), options.progress_bar())?;
    let repo_id = cloned.repo_id()?;
    let canonical = git.canonical_url().map(str::to_string);

    if let Some(existing) = list.find(&repo_id).cloned() {
        info!("{raw} was already added as [{}]", existing.short_id());
        let entry = RepoEntry {
            canonical: canonical.or(existing.canonical),
            ..existing
        };
        list.add(entry.clone());
        list.save()?;
        return Ok(Added {
            entry,
            existed: true,
        });
    }

    if crate::path::exists(&dest) {
        let found = GitRepo::from_path_or_url(&dest.to_string_lossy())
            .and_then(|repo| repo.repo_id())
            .ok();
        if found.as_deref() != Some(repo_id.as_str()) {
            return Err(UpdateError::DestinationTaken(dest));
        }
        info!("reuse existing clone at {}", dest.display());
    } else {
        fs::rename(scratch.path().join("clone"), &dest).map_err(|source| UpdateError::Io {
            source,
            path: dest.clone(),
        })?;
    }

    let entry = RepoEntry {
        repo_id,
        local_path: crate::path::resolve(&dest),
        canonical,
    };
    list.add(entry.clone());
    list.save()?;

    Ok(Added {
        entry,
        existed: false,
    })
}

/// Result of [`forget_repositories`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Forgotten {
    /// Repositories removed from the list.
    pub removed: Vec<RepoEntry>,

    /// Identifiers that matched no repository.
    pub unknown: Vec<String>,
}

/// Remove repositories from the list by identifier.
///
/// Nothing a forgotten repository installed is touched until the next full
/// update cleans it up.
///
/// # Errors
///
/// - Return [`UpdateError::Store`] if repository list cannot be accessed.
pub fn forget_repositories(layout: &Layout, identifiers: &[String]) -> Result<Forgotten> {
    let mut list = RepoList::load(layout)?;
    let mut forgotten = Forgotten::default();
    for identifier in identifiers {
        let Some(repo_id) = list.find(identifier).map(|entry| entry.repo_id.clone()) else {
            warn!("no repository matches {identifier:?}");
            forgotten.unknown.push(identifier.clone());
            continue;
        };

        if let Some(entry) = list.remove(&repo_id) {
            info!(
                "forget repository [{}] at {}",
                entry.short_id(),
                entry.local_path.display()
            );
            forgotten.removed.push(entry);
        }
    }
    list.save()?;

    Ok(forgotten)
}

/// Select registered repositories by identifier, or all of them if none are
/// given.
///
/// # Errors
///
/// - Return [`UpdateError::UnknownRepo`] for first identifier that matches
///   no repository.
/// - Return [`UpdateError::Store`] if repository list cannot be read.
pub fn select_repositories(layout: &Layout, identifiers: &[String]) -> Result<Vec<RepoEntry>> {
    let list = RepoList::load(layout)?;
    if identifiers.is_empty() {
        return Ok(list.iter().cloned().collect());
    }

    let mut selected: Vec<RepoEntry> = Vec::new();
    for identifier in identifiers {
        let entry = list
            .find(identifier)
            .ok_or_else(|| UpdateError::UnknownRepo(identifier.clone()))?;
        if !selected.iter().any(|e| e.repo_id == entry.repo_id) {
            selected.push(entry.clone());
        }
    }

    Ok(selected)
}

/// Update error types.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Both section filters were given.
    #[error("sections cannot be both selected and skipped")]
    ConflictingFilters,

    /// Identifier matches no registered repository.
    #[error("unrecognised repository {0:?}, add it first")]
    UnknownRepo(String),

    /// Destination was given for a repository that is already on disk.
    #[error("destination can only be given for remote repositories")]
    DestinationForLocal,

    /// No destination could be derived for remote repository.
    #[error("cannot derive destination for {0:?}")]
    NoDestination(String),

    /// Destination holds something other than a clone of the repository.
    #[error("cannot clone into {0:?}, path already exists")]
    DestinationTaken(PathBuf),

    /// Filesystem operation failed.
    #[error("failed to access {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = UpdateError> = std::result::Result<T, E>;
