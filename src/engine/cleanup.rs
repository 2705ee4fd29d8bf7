// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation of stale state.
//!
//! Cleanup runs in two passes. The first pass runs stale cleaners, then gives
//! every current helper whose work may have been undone along the way a
//! chance to redo it. The second pass removes stale owned paths, deepest
//! dependents first, and never removes a path the engine did not create.

use crate::{
    engine::{Conflicts, Engine, EngineError, Result, Wanter},
    helper::{Cleaner, Outcome, PathKind},
    path::{exists, is_necessary_path},
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

impl Engine {
    /// Reverse everything the current run no longer declares.
    ///
    /// Only call this after a run that covered every registered repository
    /// without section filters, because anything not declared by this run is
    /// treated as stale.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::CleanupObstruction`] or
    ///   [`EngineError::CleanupConflict`] under [`Conflicts::Raise`].
    /// - Return [`EngineError::NoProgress`] if stale paths cannot be
    ///   resolved.
    /// - Return [`EngineError`] if a cleaner fails unexpectedly, or removal
    ///   or ledger write fails.
    #[instrument(skip(self), level = "debug")]
    pub fn cleanup(&mut self, conflicts: Conflicts) -> Result<()> {
        info!(
            "clean up {} items",
            self.old_cleaners.len() + self.created.len()
        );

        let mut affected = Vec::new();
        while !self.old_cleaners.is_empty() {
            let cleaner = self.old_cleaners.remove(0);
            self.try_clean(cleaner, conflicts, &mut affected)?;
            self.save()?;
        }

        self.redo_affected(&affected)?;

        while !self.old_paths.is_empty() {
            let before = self.old_paths.len();
            let stale = self
                .old_paths
                .iter()
                .map(|(path, kind)| (path.clone(), *kind))
                .collect::<Vec<_>>();
            for (path, kind) in stale {
                self.try_clean_path(&path, kind, conflicts)?;
            }

            if self.old_paths.len() >= before {
                return Err(EngineError::NoProgress {
                    remaining: self.old_paths.keys().cloned().collect(),
                });
            }
        }

        Ok(())
    }

    fn try_clean(
        &mut self,
        cleaner: Box<dyn Cleaner>,
        conflicts: Conflicts,
        affected: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let description = cleaner.description();
        if !cleaner.is_needed(&mut self.runtime)? {
            debug!("{description}: not needed");
            return Ok(());
        }

        if let Some(claim) = cleaner
            .needs_claims()
            .into_iter()
            .find(|claim| self.claims.contains(claim))
        {
            info!("{description}: postponed, {claim:?} is still claimed");
            self.add_cleaner(cleaner);
            return Ok(());
        }

        info!("{description}: cleaning");
        match cleaner.make_changes(&mut self.runtime)? {
            Outcome::Applied(paths) => affected.extend(paths),
            Outcome::NotNeeded => debug!("{description}: nothing to undo"),
            Outcome::Failed(why) => self.warn(format!("{description}: failed: {why}")),
            Outcome::Obstructed(reason) => match conflicts {
                Conflicts::Raise => {
                    return Err(EngineError::CleanupObstruction {
                        description,
                        reason,
                    })
                }
                Conflicts::Postpone => {
                    info!("{description}: postponed, {reason}");
                    self.add_cleaner(cleaner);
                }
                Conflicts::Warn | Conflicts::Ask => {
                    self.warn(format!("{description}: aborted: {reason}"));
                }
            },
        }

        Ok(())
    }

    fn redo_affected(&mut self, affected: &[PathBuf]) -> Result<()> {
        let mut failures = Vec::new();
        for path in affected {
            for helper in &self.helpers {
                if !helper.affects_path(path) || helper.is_done()? {
                    continue;
                }

                info!("redo: {}", helper.description());
                if let Outcome::Failed(why) = helper.make_changes(&mut self.runtime)? {
                    failures.push(format!("{}: failed: {why}", helper.description()));
                }
            }
        }

        for failure in failures {
            self.warn(failure);
        }

        Ok(())
    }

    fn try_clean_path(&mut self, path: &Path, kind: PathKind, conflicts: Conflicts) -> Result<()> {
        if !self.created.contains(path) {
            debug!("forget {kind} {}: not created by us", path.display());
            return self.discard(path);
        }

        if !exists(path) {
            debug!("forget {kind} {}: already gone", path.display());
            return self.discard(path);
        }

        if !kind.matches_on_disk(path) {
            info!("ignore {}: no longer a {kind}", path.display());
            return self.discard(path);
        }

        // INVARIANT: Paths that need this one must go first.
        if self
            .old_paths
            .keys()
            .any(|other| other != path && is_necessary_path(path, other))
        {
            return Ok(());
        }

        if let Some(wanted_by) = self.wanted_by(path) {
            if self.postponed.contains(path) {
                return self.postpone(path, kind);
            }

            return match conflicts {
                Conflicts::Raise => Err(EngineError::CleanupConflict {
                    path: path.to_path_buf(),
                    wanted_by,
                }),
                Conflicts::Postpone => self.postpone(path, kind),
                Conflicts::Warn | Conflicts::Ask => {
                    self.warn(format!(
                        "conflict cleaning up {}: still wanted by {wanted_by}",
                        path.display()
                    ));
                    self.discard(path)
                }
            };
        }

        self.remove(path, kind)?;
        self.discard(path)
    }

    fn wanted_by(&self, path: &Path) -> Option<Wanter> {
        if let Some(cleaner) = self.new_cleaners.iter().find(|c| c.wants_path(path)) {
            return Some(Wanter::Cleaner(cleaner.description()));
        }

        self.new_paths
            .keys()
            .find(|other| is_necessary_path(path, other))
            .map(|other| Wanter::Path(other.clone()))
    }

    fn remove(&mut self, path: &Path, kind: PathKind) -> Result<()> {
        match kind {
            PathKind::FolderOnly => {
                info!("remove directory {}", path.display());
                if let Err(error) = fs::remove_dir(path) {
                    if path.read_dir().map(|mut entries| entries.next().is_some()).unwrap_or(false) {
                        self.warn(format!("directory not empty: {}", path.display()));
                    } else {
                        return Err(EngineError::remove(path)(error));
                    }
                }
            }
            PathKind::FolderAll => {
                info!("remove directory tree {}", path.display());
                fs::remove_dir_all(path).map_err(EngineError::remove(path))?;
            }
            PathKind::FileWhole | PathKind::Symlink => {
                info!("remove {}", path.display());
                fs::remove_file(path).map_err(EngineError::remove(path))?;
            }
            PathKind::FilePart => {
                let size = fs::metadata(path).map_err(EngineError::remove(path))?.len();
                if size == 0 {
                    info!("remove empty {}", path.display());
                    fs::remove_file(path).map_err(EngineError::remove(path))?;
                } else {
                    warn!("refusing to remove non-empty {}", path.display());
                }
            }
        }

        Ok(())
    }

    fn postpone(&mut self, path: &Path, kind: PathKind) -> Result<()> {
        info!("postpone cleanup of {}", path.display());
        self.postponed.insert(path.to_path_buf());
        self.new_paths.insert(path.to_path_buf(), kind);
        self.old_paths.remove(path);
        self.save()
    }

    fn discard(&mut self, path: &Path) -> Result<()> {
        debug!("forget about {}", path.display());
        self.old_paths.remove(path);
        self.postponed.remove(path);
        self.created.remove(path);
        self.save()
    }
}
