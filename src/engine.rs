// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent state reconciliation engine.
//!
//! The engine runs helpers, and remembers what they did so it can be undone
//! once a script stops declaring them. Each run splits its bookkeeping into
//! __old__ state, loaded from the ledger at the start of the run, and __new__
//! state, accumulated from the helpers run so far. Whatever is still old once
//! every helper ran is stale, and is what [`Engine::cleanup`] reconciles.
//!
//! # Run Phases
//!
//! 1. Load the ledger through [`Engine::open`].
//! 2. Register helpers, honoring section filters.
//! 3. Validate that section filters name sections that exist.
//! 4. Run each helper in registration order.
//! 5. Optionally clean up stale cleaners and owned paths.
//!
//! The ledger is rewritten atomically after every step that changes it. Paths
//! a helper is about to create are recorded before the helper runs, so a crash
//! in the middle of a helper still leaves an accurate record behind.
//!
//! # See Also
//!
//! - [`crate::helper`]
//! - [`ledger`]

pub mod cleanup;
pub mod facts;
pub mod ledger;
pub mod section;

use crate::{
    engine::{
        ledger::{CleanerRecord, Ledger},
        section::Sections,
    },
    helper::{Cleaner, CleanerRegistry, Helper, HelperError, Outcome, PathKind, Runtime},
    store::StoreError,
};

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument, warn};

/// What to do when cleanup runs into something that still wants a path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conflicts {
    /// Abort cleanup with an error.
    Raise,

    /// Warn, and forget about the path or cleaner.
    Warn,

    /// Same as [`Conflicts::Warn`], since no interactive resolution exists.
    Ask,

    /// Keep it around, and try again on the next cleanup.
    #[default]
    Postpone,
}

impl FromStr for Conflicts {
    type Err = EngineError;

    fn from_str(data: &str) -> Result<Self> {
        match data {
            "raise" => Ok(Self::Raise),
            "warn" => Ok(Self::Warn),
            "ask" => Ok(Self::Ask),
            "postpone" => Ok(Self::Postpone),
            other => Err(EngineError::UnknownPolicy(other.into())),
        }
    }
}

impl Display for Conflicts {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Raise => "raise",
            Self::Warn => "warn",
            Self::Ask => "ask",
            Self::Postpone => "postpone",
        };
        fmt.write_str(name)
    }
}

/// Whatever still depends on a path cleanup wanted to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wanter {
    /// Current cleaner, by description.
    Cleaner(String),

    /// Path owned by a current helper.
    Path(PathBuf),
}

impl Display for Wanter {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Cleaner(description) => write!(fmt, "cleaner {description:?}"),
            Self::Path(path) => write!(fmt, "path {path:?}"),
        }
    }
}

#[derive(Debug)]
struct Queued {
    section: Option<String>,
    helper: Box<dyn Helper>,
}

/// Reconciliation engine for one run.
#[derive(Debug)]
pub struct Engine {
    ledger_path: PathBuf,
    runtime: Runtime,
    old_cleaners: Vec<Box<dyn Cleaner>>,
    new_cleaners: Vec<Box<dyn Cleaner>>,
    unknown_cleaners: Vec<CleanerRecord>,
    old_paths: BTreeMap<PathBuf, PathKind>,
    new_paths: BTreeMap<PathBuf, PathKind>,
    postponed: BTreeSet<PathBuf>,
    created: BTreeSet<PathBuf>,
    claims: BTreeSet<String>,
    queue: Vec<Queued>,
    helpers: Vec<Box<dyn Helper>>,
    sections: Sections,
    section_marker: Option<PathBuf>,
    warnings: Vec<String>,
    changes: usize,
}

impl Engine {
    /// Open engine over ledger at path.
    ///
    /// Cleaners are reconstructed through registry. Cleaners with unknown
    /// tags or malformed parameters are skipped with a warning, but are kept
    /// in the ledger untouched.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Store`] if ledger cannot be loaded.
    #[instrument(skip(ledger_path, registry, runtime), level = "debug")]
    pub fn open(
        ledger_path: impl Into<PathBuf>,
        registry: &CleanerRegistry,
        runtime: Runtime,
    ) -> Result<Self> {
        let ledger_path = ledger_path.into();
        let ledger = Ledger::load(&ledger_path)?;

        let mut old_cleaners = Vec::new();
        let mut unknown_cleaners = Vec::new();
        for record in ledger.cleaners {
            match registry.load(&record) {
                Some(Ok(cleaner)) => old_cleaners.push(cleaner),
                Some(Err(error)) => {
                    warn!("cannot load cleaner {:?}: {error}", record.tag);
                    unknown_cleaners.push(record);
                }
                None => {
                    warn!("no cleaner for {:?}, keeping it as is", record.tag);
                    unknown_cleaners.push(record);
                }
            }
        }

        Ok(Self {
            ledger_path,
            runtime,
            old_cleaners,
            new_cleaners: Vec::new(),
            unknown_cleaners,
            old_paths: ledger.paths_owned,
            new_paths: BTreeMap::new(),
            postponed: ledger.paths_postponed,
            created: ledger.paths_created,
            claims: BTreeSet::new(),
            queue: Vec::new(),
            helpers: Vec::new(),
            sections: Sections::default(),
            section_marker: None,
            warnings: Vec::new(),
            changes: 0,
        })
    }

    /// Restrict run to sections in `only`, or exclude sections in `skip`.
    pub fn with_sections(
        mut self,
        only: impl IntoIterator<Item = impl Into<String>>,
        skip: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.sections = Sections::new(only, skip);
        self
    }

    /// Write the section currently being run to marker file.
    pub fn with_section_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.section_marker = Some(marker.into());
        self
    }

    /// Enter named section.
    pub fn push_section(&mut self, name: impl Into<String>) -> bool {
        self.sections.push(name)
    }

    /// Leave innermost section.
    pub fn pop_section(&mut self) -> Option<String> {
        self.sections.pop()
    }

    /// Check if any section filter is active.
    pub fn is_filtered(&self) -> bool {
        self.sections.is_filtered()
    }

    /// Queue helper to run, unless its section is filtered out.
    pub fn register(&mut self, helper: impl Helper + 'static) {
        self.register_boxed(Box::new(helper));
    }

    /// Queue boxed helper to run, unless its section is filtered out.
    pub fn register_boxed(&mut self, helper: Box<dyn Helper>) {
        if !self.sections.is_enabled() {
            debug!("skip {}: section disabled", helper.description());
            return;
        }

        self.queue.push(Queued {
            section: self.sections.current(),
            helper,
        });
    }

    /// Run every queued helper in registration order.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::UnknownSection`] before running anything if a
    ///   section filter names a section that was never entered.
    /// - Return [`EngineError`] if a helper fails unexpectedly.
    #[instrument(skip(self), level = "debug")]
    pub fn execute(&mut self) -> Result<()> {
        self.sections.validate()?;

        let mut current = None;
        for Queued { section, helper } in std::mem::take(&mut self.queue) {
            if section != current {
                self.mark_section(section.as_deref())?;
                current = section;
            }
            self.run(helper)?;
        }

        Ok(())
    }

    /// Run one helper right now.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Helper`] if helper fails unexpectedly.
    /// - Return [`EngineError::Store`] if ledger cannot be written.
    pub fn run(&mut self, helper: Box<dyn Helper>) -> Result<()> {
        let mut modified = false;
        let description = helper.description();

        // INVARIANT: Claims are held before the helper itself runs.
        self.claims.extend(helper.claims());

        if let Some(cleaner) = helper.cleaner() {
            self.old_cleaners.retain(|old| !old.same_as(cleaner.as_ref()));
            self.add_cleaner(cleaner);
            modified = true;
        }

        let ownable = helper.paths_ownable();
        for (path, kind) in &ownable {
            self.new_paths.insert(path.clone(), *kind);
            self.old_paths.remove(path);
            self.postponed.remove(path);
            modified = true;
        }

        if helper.is_done()? {
            info!("{description}: already done");
        } else {
            info!("{description}: running");
            for (path, kind) in &ownable {
                let exists = match kind {
                    PathKind::FileWhole | PathKind::FolderAll => self.created.contains(path),
                    PathKind::FilePart | PathKind::FolderOnly => path.exists(),
                    PathKind::Symlink => path.is_symlink(),
                };
                if !exists && self.created.insert(path.clone()) {
                    modified = true;
                }
            }

            if modified {
                self.save()?;
                modified = false;
            }

            self.changes += 1;
            match helper.make_changes(&mut self.runtime)? {
                Outcome::Failed(why) | Outcome::Obstructed(why) => {
                    self.warn(format!("{description}: failed: {why}"));
                }
                Outcome::Applied(_) | Outcome::NotNeeded => {}
            }
        }

        self.helpers.push(helper);
        if modified {
            self.save()?;
        }

        Ok(())
    }

    /// Created paths still owned by the engine.
    pub fn paths_to_clean(&self) -> BTreeMap<PathBuf, PathKind> {
        self.old_paths
            .iter()
            .chain(self.new_paths.iter())
            .filter(|(path, _)| self.created.contains(*path))
            .map(|(path, kind)| (path.clone(), *kind))
            .collect()
    }

    /// Warnings accumulated during the run.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Number of helpers that had to make changes.
    pub fn changes_made(&self) -> usize {
        self.changes
    }

    /// Mutable access to the runtime helpers run with.
    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    /// Record warning, which makes the run unsuccessful.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Write current state to the ledger.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Store`] if ledger cannot be written.
    pub fn save(&self) -> Result<()> {
        let mut cleaners = self
            .old_cleaners
            .iter()
            .chain(self.new_cleaners.iter())
            .map(|cleaner| cleaner.record())
            .collect::<Vec<_>>();
        cleaners.extend(self.unknown_cleaners.iter().cloned());

        let mut paths_owned = self.old_paths.clone();
        paths_owned.extend(self.new_paths.iter().map(|(path, kind)| (path.clone(), *kind)));

        let ledger = Ledger {
            cleaners,
            paths_owned,
            paths_postponed: self.postponed.clone(),
            paths_created: self.created.clone(),
        };
        ledger.save(&self.ledger_path)?;

        Ok(())
    }

    fn add_cleaner(&mut self, cleaner: Box<dyn Cleaner>) {
        if self
            .new_cleaners
            .iter()
            .any(|existing| existing.same_as(cleaner.as_ref()))
        {
            return;
        }
        self.new_cleaners.push(cleaner);
    }

    fn mark_section(&self, section: Option<&str>) -> Result<()> {
        let Some(marker) = &self.section_marker else {
            return Ok(());
        };

        crate::status::write_section(marker, section).map_err(|source| EngineError::Marker {
            source,
            path: marker.clone(),
        })
    }
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Something still wants a path that cleanup must remove.
    #[error("cannot clean up {path:?}, still wanted by {wanted_by}")]
    CleanupConflict { path: PathBuf, wanted_by: Wanter },

    /// Cleaner could not proceed safely.
    #[error("cleanup obstructed for {description:?}: {reason}")]
    CleanupObstruction { description: String, reason: String },

    /// Section filter names a section that was never entered.
    #[error("no section named {0:?}")]
    UnknownSection(String),

    /// Conflict policy name is not recognized.
    #[error("unknown conflict policy {0:?}, expected raise, warn, ask, or postpone")]
    UnknownPolicy(String),

    /// Stale path cleanup stopped making progress.
    #[error("cleanup of {remaining:?} made no progress")]
    NoProgress { remaining: Vec<PathBuf> },

    /// Section marker could not be written.
    #[error("failed to update section marker {path:?}")]
    Marker {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Filesystem removal during cleanup failed.
    #[error("failed to remove {path:?}")]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ledger access failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Helper or cleaner failed unexpectedly.
    #[error(transparent)]
    Helper(#[from] HelperError),
}

impl EngineError {
    pub(crate) fn remove(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Remove {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::facts::FactStore,
        helper::{
            files::{MakeDir, MakeSymlink, WriteFile},
            lines::{BlockInFile, LineInFile, Position},
            source::{Checkout, InstallFromSource},
            Persisted,
        },
    };
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let tmp = tempfile::tempdir()?;
            Ok(Self { tmp })
        }

        fn path(&self, name: &str) -> PathBuf {
            crate::path::resolve(self.tmp.path()).join(name)
        }

        fn engine(&self) -> anyhow::Result<Engine> {
            let runtime = Runtime::new(FactStore::open(self.path("facts")));
            let mut registry = CleanerRegistry::default();
            registry.register::<RemoveMarker>();
            Ok(Engine::open(self.path("engine.json"), &registry, runtime)?)
        }

        fn contents(&self, name: &str) -> anyhow::Result<String> {
            Ok(fs::read_to_string(self.path(name))?)
        }

        fn ledger(&self) -> anyhow::Result<Ledger> {
            Ok(Ledger::load(&self.path("engine.json"))?)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct RemoveMarker {
        marker: PathBuf,
        claim: Option<String>,
        refuse: bool,
    }

    impl Persisted for RemoveMarker {
        const TAG: &'static str = "remove_marker";
    }

    impl Cleaner for RemoveMarker {
        fn tag(&self) -> &'static str {
            Self::TAG
        }

        fn params(&self) -> Value {
            json!(self)
        }

        fn description(&self) -> String {
            format!("remove marker {}", self.marker.display())
        }

        fn is_needed(&self, _: &mut Runtime) -> crate::helper::Result<bool> {
            Ok(self.marker.exists())
        }

        fn needs_claims(&self) -> BTreeSet<String> {
            self.claim.iter().cloned().collect()
        }

        fn make_changes(&self, _: &mut Runtime) -> crate::helper::Result<Outcome> {
            if self.refuse {
                return Ok(Outcome::Obstructed("marker is in use".into()));
            }

            fs::remove_file(&self.marker).map_err(HelperError::io(&self.marker))?;
            Ok(Outcome::Applied(Vec::new()))
        }
    }

    #[derive(Debug)]
    struct WriteMarker {
        undo: RemoveMarker,
        claim: Option<String>,
    }

    impl WriteMarker {
        fn new(marker: PathBuf) -> Self {
            Self {
                undo: RemoveMarker {
                    marker,
                    claim: None,
                    refuse: false,
                },
                claim: None,
            }
        }
    }

    impl Helper for WriteMarker {
        fn description(&self) -> String {
            format!("write marker {}", self.undo.marker.display())
        }

        fn is_done(&self) -> crate::helper::Result<bool> {
            Ok(self.undo.marker.exists())
        }

        fn make_changes(&self, _: &mut Runtime) -> crate::helper::Result<Outcome> {
            let marker = &self.undo.marker;
            fs::write(marker, "").map_err(HelperError::io(marker))?;
            Ok(Outcome::Applied(vec![marker.clone()]))
        }

        fn claims(&self) -> BTreeSet<String> {
            self.claim.iter().cloned().collect()
        }

        fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
            Some(Box::new(self.undo.clone()))
        }
    }

    // Writes its file, then dies before it can report back.
    #[derive(Debug)]
    struct CrashAfterWrite {
        path: PathBuf,
    }

    impl Helper for CrashAfterWrite {
        fn description(&self) -> String {
            format!("write {} then crash", self.path.display())
        }

        fn is_done(&self) -> crate::helper::Result<bool> {
            Ok(self.path.exists())
        }

        fn make_changes(&self, _: &mut Runtime) -> crate::helper::Result<Outcome> {
            fs::write(&self.path, "half").map_err(HelperError::io(&self.path))?;
            Err(HelperError::MissingExecutable("compiler".into()))
        }

        fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
            BTreeMap::from([(self.path.clone(), PathKind::FileWhole)])
        }
    }

    fn line(file: PathBuf, line: &str) -> anyhow::Result<Box<dyn Helper>> {
        Ok(Box::new(LineInFile::new(file, line, Position::Any)?))
    }

    fn block(file: PathBuf, lines: &[&str]) -> Box<dyn Helper> {
        let lines = lines.iter().map(|line| line.to_string()).collect();
        Box::new(BlockInFile::new(file, lines, "PRE", "POST", Position::Any))
    }

    fn mkdir(path: PathBuf) -> Box<dyn Helper> {
        Box::new(MakeDir::new(path))
    }

    #[test]
    fn nested_folders_are_cleaned_up_in_order() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let d2 = fx.path("dir2");
        let d2a = d2.join("sub-a");
        let d2a1 = d2a.join("supersub-1");
        let d2a2 = d2a.join("supersub-2");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.cleanup(Conflicts::Raise)?;

        let mut engine = fx.engine()?;
        for dir in [&d1, &d2, &d2a, &d2a1, &d2a2] {
            engine.run(mkdir(dir.clone()))?;
        }
        engine.cleanup(Conflicts::Raise)?;
        assert!([&d1, &d2, &d2a, &d2a1, &d2a2].iter().all(|dir| dir.is_dir()));

        // INVARIANT: Keeping d2a2 keeps every ancestor of it alive.
        let mut engine = fx.engine()?;
        engine.run(mkdir(d2a2.clone()))?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!([&d2, &d2a, &d2a2].iter().all(|dir| dir.is_dir()));
        assert!(!d1.exists() && !d2a1.exists());

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(![&d1, &d2, &d2a, &d2a1, &d2a2].iter().any(|dir| dir.exists()));
        assert!(fx.tmp.path().is_dir());

        Ok(())
    }

    #[test]
    fn symlink_wanted_by_path_through_it_conflicts() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let l1 = fx.path("link1");
        let l1da = l1.join("dir-a");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.run(Box::new(MakeSymlink::new(&d1, &l1)))?;
        engine.run(mkdir(l1da.clone()))?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(d1.join("dir-a").is_dir());
        assert_eq!(fs::read_link(&l1)?, d1);

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.run(mkdir(l1da.clone()))?;
        match engine.cleanup(Conflicts::Raise) {
            Err(EngineError::CleanupConflict { path, wanted_by }) => {
                assert_eq!(path, l1);
                assert_eq!(wanted_by, Wanter::Path(l1da.clone()));
            }
            other => panic!("expected cleanup conflict, got {other:?}"),
        }

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d1.exists() && !l1.is_symlink());

        Ok(())
    }

    #[test]
    fn symlink_survives_cleanup_of_its_target() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let l1 = fx.path("link1");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.run(Box::new(MakeSymlink::new(&d1, &l1)))?;
        engine.cleanup(Conflicts::Raise)?;

        let mut engine = fx.engine()?;
        engine.run(Box::new(MakeSymlink::new(&d1, &l1)))?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d1.exists());
        assert!(l1.is_symlink());

        Ok(())
    }

    #[test]
    fn line_in_file_is_removed_wherever_it_moved() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("f1.txt");
        fs::write(&f1, "AAA\nBBB\nCCC\n")?;

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "DDD")?)?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "AAA\nBBB\nCCC\nDDD\n");

        fs::write(&f1, "AAA\nDDD\nCCC\nBBB\n")?;
        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "AAA\nCCC\nBBB\n");

        Ok(())
    }

    #[test]
    fn file_that_started_empty_is_left_empty() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("f1.txt");
        fs::write(&f1, "")?;

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "AAA")?)?;
        assert_eq!(fx.contents("f1.txt")?, "AAA\n");

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "");

        Ok(())
    }

    #[test]
    fn files_take_over_folder_ownership() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("f1.txt");
        let d1 = fx.path("f1.txt.dir");
        let d1f1 = d1.join("f-1.txt");

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "AAA")?)?;
        engine.run(mkdir(d1.clone()))?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(d1.is_dir());

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "AAA")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(!d1.exists());
        assert_eq!(fx.contents("f1.txt")?, "AAA\n");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.run(line(d1f1.clone(), "AAA")?)?;
        engine.run(line(d1f1.clone(), "BBB")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(d1.is_dir());
        assert!(!f1.exists());
        assert_eq!(fs::read_to_string(&d1f1)?, "AAA\nBBB\n");

        // INVARIANT: Folder is postponed, not forgotten.
        let mut engine = fx.engine()?;
        engine.run(line(d1f1.clone(), "AAA")?)?;
        engine.run(line(d1f1.clone(), "BBB")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(d1.is_dir());
        let engine = fx.engine()?;
        assert_eq!(engine.paths_to_clean().get(&d1), Some(&PathKind::FolderOnly));

        let mut engine = fx.engine()?;
        engine.run(line(d1f1.clone(), "AAA")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert_eq!(fs::read_to_string(&d1f1)?, "AAA\n");

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d1.exists());

        Ok(())
    }

    #[test]
    fn foreign_paths_are_never_removed() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d2 = fx.path("dir2");
        let d2f1 = d2.join("f-1.txt");
        let f1 = fx.path("f1.txt");
        fs::create_dir(&d2)?;
        fs::write(&f1, "")?;

        let mut engine = fx.engine()?;
        engine.run(line(d2f1.clone(), "AAA")?)?;
        engine.run(line(f1.clone(), "AAA")?)?;

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(d2.is_dir() && !d2f1.exists());
        assert_eq!(fx.contents("f1.txt")?, "");

        Ok(())
    }

    #[test]
    fn shared_parent_folders_go_with_last_file() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d3 = fx.path("dir3");
        let d3d1 = d3.join("sub-1");
        let d3d2 = d3.join("sub-2");
        let d3d1f1 = d3d1.join("somefile.txt");
        let d3d2f1 = d3d2.join("somefile.txt");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d3.clone()))?;
        engine.run(mkdir(d3d1.clone()))?;
        engine.run(mkdir(d3d2.clone()))?;
        engine.cleanup(Conflicts::Raise)?;

        let mut engine = fx.engine()?;
        engine.run(line(d3d1f1.clone(), "AAA")?)?;
        engine.run(line(d3d2f1.clone(), "BBB")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert_eq!(fs::read_to_string(&d3d1f1)?, "AAA\n");
        assert_eq!(fs::read_to_string(&d3d2f1)?, "BBB\n");

        let mut engine = fx.engine()?;
        engine.run(line(d3d2f1.clone(), "BBB")?)?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(!d3d1.exists());
        assert_eq!(fs::read_to_string(&d3d2f1)?, "BBB\n");

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d3.exists());

        Ok(())
    }

    #[test]
    fn block_and_line_reapply_each_other() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("f1.txt");

        for _ in 0..3 {
            let mut engine = fx.engine()?;
            engine.run(line(f1.clone(), "AAA")?)?;
            engine.run(block(f1.clone(), &["AAA"]))?;
            engine.cleanup(Conflicts::Raise)?;
            assert_eq!(fx.contents("f1.txt")?, "AAA\nPRE\nAAA\nPOST\n");
        }

        fs::remove_file(&f1)?;
        for _ in 0..3 {
            let mut engine = fx.engine()?;
            engine.run(block(f1.clone(), &["AAA"]))?;
            engine.run(line(f1.clone(), "AAA")?)?;
            engine.cleanup(Conflicts::Raise)?;
            assert_eq!(fx.contents("f1.txt")?, "PRE\nAAA\nPOST\n");
        }

        let mut engine = fx.engine()?;
        engine.run(block(f1.clone(), &["AAA"]))?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "PRE\nAAA\nPOST\n");

        let mut engine = fx.engine()?;
        engine.run(block(f1.clone(), &["AAA"]))?;
        engine.run(line(f1.clone(), "AAA")?)?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "PRE\nAAA\nPOST\n");

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "AAA")?)?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "AAA\n");

        Ok(())
    }

    #[test]
    fn cleanup_with_nothing_declared_removes_everything() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("stuff.d");
        let d1f1 = d1.join("sub-file.txt");
        let l1 = fx.path("stuff.lnk");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.run(Box::new(MakeSymlink::new(&d1, &l1)))?;
        engine.run(line(d1f1.clone(), "AAA")?)?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fs::read_to_string(&d1f1)?, "AAA\n");

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d1.exists());
        assert!(!l1.is_symlink());

        Ok(())
    }

    #[test]
    fn partial_runs_keep_undeclared_paths() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let d2 = fx.path("dir2");

        let mut engine = fx.engine()?;
        engine.run(mkdir(d1.clone()))?;
        engine.cleanup(Conflicts::Raise)?;

        let mut engine = fx.engine()?;
        engine.run(mkdir(d2.clone()))?;
        assert!(d1.is_dir() && d2.is_dir());

        let mut engine = fx.engine()?;
        engine.run(mkdir(d2.clone()))?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!d1.exists() && d2.is_dir());

        Ok(())
    }

    #[test]
    fn write_file_is_restored_after_line_cleanup() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("f1.txt");
        let f2 = fx.path("f2.txt");

        let mut engine = fx.engine()?;
        engine.run(line(f1.clone(), "AAA")?)?;
        engine.run(line(f1.clone(), "BBB")?)?;
        assert_eq!(fx.contents("f1.txt")?, "AAA\nBBB\n");

        let mut engine = fx.engine()?;
        engine.run(Box::new(WriteFile::new(&f1, "BBB\nCCC\n")))?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f1.txt")?, "BBB\nCCC\n");

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!f1.exists());

        // INVARIANT: Partially owned file with foreign content is kept.
        fs::write(&f2, "Already here!\n")?;
        let mut engine = fx.engine()?;
        engine.run(Box::new(WriteFile::new(&f2, "AAA\nBBB\n")))?;
        engine.cleanup(Conflicts::Raise)?;
        let mut engine = fx.engine()?;
        engine.run(line(f2.clone(), "CCC")?)?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f2.txt")?, "AAA\nBBB\nCCC\n");
        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fx.contents("f2.txt")?, "AAA\nBBB\n");

        Ok(())
    }

    #[test]
    fn second_identical_run_changes_nothing() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let f1 = d1.join("rc");

        for expect in [2, 0] {
            let mut engine = fx.engine()?;
            engine.run(mkdir(d1.clone()))?;
            engine.run(line(f1.clone(), "AAA")?)?;
            engine.cleanup(Conflicts::Raise)?;
            assert_eq!(engine.changes_made(), expect);
            assert!(engine.warnings().is_empty());
        }

        Ok(())
    }

    #[test]
    fn unknown_cleaners_are_carried_forward() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fs::write(
            fx.path("engine.json"),
            r#"{"cleaners": [{"type": "from_the_future", "params": {"x": 1}}]}"#,
        )?;

        let mut engine = fx.engine()?;
        engine.run(mkdir(fx.path("dir1")))?;
        engine.cleanup(Conflicts::Raise)?;

        let ledger = Ledger::load(&fx.path("engine.json"))?;
        assert_eq!(ledger.cleaners.len(), 1);
        assert_eq!(ledger.cleaners[0].tag, "from_the_future");

        Ok(())
    }

    #[test]
    fn sections_gate_registration_and_validate() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let d1 = fx.path("dir1");
        let d2 = fx.path("dir2");

        let mut engine = fx.engine()?.with_sections(["editor"], Vec::<String>::new());
        engine.register(MakeDir::new(&d1));
        engine.push_section("editor");
        engine.register(MakeDir::new(&d2));
        engine.pop_section();
        engine.execute()?;
        assert!(!d1.exists() && d2.is_dir());

        let mut engine = fx.engine()?.with_sections(["nope"], Vec::<String>::new());
        engine.register(MakeDir::new(&d1));
        assert!(matches!(
            engine.execute(),
            Err(EngineError::UnknownSection(_))
        ));
        assert!(!d1.exists());

        Ok(())
    }

    #[test]
    fn claimed_cleaner_waits_for_claim_release() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let m1 = fx.path("m1");
        let m2 = fx.path("m2");

        let mut first = WriteMarker::new(m1.clone());
        first.undo.claim = Some("tool".into());
        let mut engine = fx.engine()?;
        engine.run(Box::new(first))?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(m1.exists());

        let mut holder = WriteMarker::new(m2.clone());
        holder.claim = Some("tool".into());
        let mut engine = fx.engine()?;
        engine.run(Box::new(holder))?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(m1.exists() && m2.exists());
        assert!(engine.warnings().is_empty());
        assert_eq!(fx.ledger()?.cleaners.len(), 2);

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!m1.exists() && !m2.exists());
        assert!(fx.ledger()?.cleaners.is_empty());

        Ok(())
    }

    #[test]
    fn obstructed_cleaner_follows_conflict_policy() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let m1 = fx.path("m1");

        let mut helper = WriteMarker::new(m1.clone());
        helper.undo.refuse = true;
        let mut engine = fx.engine()?;
        engine.run(Box::new(helper))?;
        engine.cleanup(Conflicts::Raise)?;

        let mut engine = fx.engine()?;
        match engine.cleanup(Conflicts::Raise) {
            Err(EngineError::CleanupObstruction { reason, .. }) => {
                assert_eq!(reason, "marker is in use");
            }
            other => panic!("expected cleanup obstruction, got {other:?}"),
        }
        assert_eq!(fx.ledger()?.cleaners.len(), 1);

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Postpone)?;
        assert!(engine.warnings().is_empty());
        assert_eq!(fx.ledger()?.cleaners.len(), 1);

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Warn)?;
        assert_eq!(engine.warnings().len(), 1);
        assert!(engine.warnings()[0].ends_with("aborted: marker is in use"));
        assert!(fx.ledger()?.cleaners.is_empty());
        assert!(m1.exists());

        Ok(())
    }

    #[test]
    fn warn_and_ask_forget_wanted_paths() -> anyhow::Result<()> {
        for policy in [Conflicts::Warn, Conflicts::Ask] {
            let fx = Fixture::new()?;
            let d1 = fx.path("dir1");
            let d1a = d1.join("sub-a");

            let mut engine = fx.engine()?;
            engine.run(mkdir(d1.clone()))?;
            engine.run(mkdir(d1a.clone()))?;
            engine.cleanup(Conflicts::Raise)?;

            let mut engine = fx.engine()?;
            engine.run(mkdir(d1a.clone()))?;
            engine.cleanup(policy)?;
            assert!(d1a.is_dir());
            assert_eq!(engine.warnings().len(), 1);
            assert!(engine.warnings()[0].contains("still wanted by"));

            // INVARIANT: Path is forgotten, not postponed.
            let mut engine = fx.engine()?;
            assert_eq!(engine.paths_to_clean().get(&d1), None);
            engine.cleanup(Conflicts::Raise)?;
            assert!(d1.is_dir() && !d1a.exists());
        }

        Ok(())
    }

    #[test]
    fn created_paths_are_recorded_before_helper_runs() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let f1 = fx.path("half-written");

        let mut engine = fx.engine()?;
        let result = engine.run(Box::new(CrashAfterWrite { path: f1.clone() }));
        assert!(matches!(result, Err(EngineError::Helper(_))));

        let ledger = fx.ledger()?;
        assert!(ledger.paths_created.contains(&f1));
        assert_eq!(ledger.paths_owned.get(&f1), Some(&PathKind::FileWhole));

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert!(!f1.exists());

        Ok(())
    }

    #[test]
    fn existing_clone_folder_survives_cleanup() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let clone_to = fx.path("src-tool");
        fs::create_dir(&clone_to)?;
        fs::write(clone_to.join("precious.txt"), "keep me")?;

        let mut engine = fx.engine()?;
        engine.run(Box::new(InstallFromSource::new(
            "repo",
            "https://example.invalid/tool.git",
            &clone_to,
            Checkout::Branch("main".into()),
        )))?;
        assert_eq!(engine.warnings().len(), 1);

        let mut engine = fx.engine()?;
        engine.cleanup(Conflicts::Raise)?;
        assert_eq!(fs::read_to_string(clone_to.join("precious.txt"))?, "keep me");

        Ok(())
    }

    #[test]
    fn conflict_policy_parses_from_name() -> anyhow::Result<()> {
        assert_eq!("raise".parse::<Conflicts>()?, Conflicts::Raise);
        assert_eq!("postpone".parse::<Conflicts>()?, Conflicts::Postpone);
        assert_eq!(Conflicts::Ask.to_string(), "ask");
        assert!("later".parse::<Conflicts>().is_err());
        Ok(())
    }
}
