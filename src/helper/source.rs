// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Install software by cloning and compiling its source repository.
//!
//! The source repository is cloned once, then kept at the requested branch or
//! tag. Optional compile commands run inside of the clone. For tags, the
//! commands used are recorded as a fact so the same tag is not recompiled on
//! every run. Symlinks can expose files of the clone elsewhere, e.g., a built
//! binary in `~/bin`.

use crate::{
    helper::{Helper, HelperError, Outcome, PathKind, Result, Runtime},
    path::{is_necessary_path, resolve},
    system::execute,
};

use serde_json::json;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// What to keep checked out in the clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    /// Track branch, pulling on every run where pulls are allowed.
    Branch(String),

    /// Pin to tag.
    Tag(String),
}

/// Clone and build a source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFromSource {
    repo_id: String,
    source: String,
    clone_to: PathBuf,
    checkout: Checkout,
    compile: Option<Vec<Vec<String>>>,
    symlinks: Vec<(PathBuf, PathBuf)>,
}

impl InstallFromSource {
    pub fn new(
        repo_id: impl Into<String>,
        source: impl Into<String>,
        clone_to: impl Into<PathBuf>,
        checkout: Checkout,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            source: source.into(),
            clone_to: clone_to.into(),
            checkout,
            compile: None,
            symlinks: Vec::new(),
        }
    }

    /// Run commands inside of the clone after checkout.
    pub fn with_compile(mut self, commands: Vec<Vec<String>>) -> Self {
        self.compile = Some(commands);
        self
    }

    /// Symlink `link` to `target`, where `target` is relative to the clone.
    pub fn with_symlink(mut self, target: impl AsRef<Path>, link: impl Into<PathBuf>) -> Self {
        self.symlinks.push((self.clone_to.join(target), link.into()));
        self
    }

    fn compile_fact(&self, tag: &str) -> String {
        format!(
            "InstallFromSource:compilation:{}:{tag}",
            self.clone_to.display()
        )
    }

    fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        execute("git", args, Some(&self.clone_to), &[])
            .map(|output| output.stdout)
            .map_err(|error| error.to_string())
    }

    fn sync_checkout(
        &self,
        runtime: &Runtime,
        pull_needed: bool,
    ) -> std::result::Result<(), String> {
        match &self.checkout {
            Checkout::Branch(branch) => {
                self.git(&["checkout", branch.as_str()])?;
                if pull_needed && runtime.allow_pull() {
                    info!("update {} from {}", self.clone_to.display(), self.source);
                    self.git(&["pull"])?;
                }
            }
            Checkout::Tag(tag) => {
                if pull_needed && runtime.allow_pull() {
                    info!("update {} from {}", self.clone_to.display(), self.source);
                    self.git(&["fetch", "--tags"])?;
                }
                self.git(&["checkout", tag.as_str()])?;
            }
        }

        Ok(())
    }

    fn run_compile(&self, runtime: &mut Runtime) -> Result<std::result::Result<(), String>> {
        let Some(commands) = &self.compile else {
            return Ok(Ok(()));
        };

        let fact = match &self.checkout {
            Checkout::Tag(tag) => Some(self.compile_fact(tag)),
            Checkout::Branch(_) => None,
        };

        if let Some(fact) = &fact {
            let mut facts = runtime.facts(&self.repo_id);
            if facts.get(fact)? == Some(json!(commands)) {
                info!("{} was compiled last time", self.clone_to.display());
                return Ok(Ok(()));
            }
            facts.clear(fact)?;
        }

        for command in commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            if let Err(error) = execute(program, args, Some(&self.clone_to), &[]) {
                return Ok(Err(error.to_string()));
            }
        }

        if let Some(fact) = &fact {
            runtime.facts(&self.repo_id).set(fact, json!(commands))?;
        }

        Ok(Ok(()))
    }
}

impl Helper for InstallFromSource {
    fn description(&self) -> String {
        format!("Install {} into {}", self.source, self.clone_to.display())
    }

    fn is_done(&self) -> Result<bool> {
        if !self.clone_to.exists() {
            return Ok(false);
        }

        // INVARIANT: Branches always need another look for upstream changes.
        let Checkout::Tag(tag) = &self.checkout else {
            return Ok(false);
        };

        let Ok(current) = self.git(&["tag", "--points-at", "HEAD"]) else {
            return Ok(false);
        };
        if !current.lines().any(|line| line == tag) {
            return Ok(false);
        }

        for (target, link) in &self.symlinks {
            if !link.is_symlink() {
                return Ok(false);
            }
            if &fs::read_link(link).map_err(HelperError::io(link))? != target {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome> {
        let mut applied = Vec::new();
        let pull_needed = if !self.clone_to.exists() {
            info!("clone {}", self.source);
            let clone_to = self.clone_to.display().to_string();
            let args = ["clone", self.source.as_str(), clone_to.as_str()];
            if let Err(error) = execute("git", args, None, &[]) {
                return Ok(Outcome::Failed(error.to_string()));
            }
            applied.push(self.clone_to.clone());
            false
        } else {
            if !self.clone_to.join(".git").exists() {
                return Ok(Outcome::Failed(format!(
                    "{} is not a git repository",
                    self.clone_to.display()
                )));
            }
            true
        };

        if let Err(why) = self.sync_checkout(runtime, pull_needed) {
            return Ok(Outcome::Failed(why));
        }

        if let Err(why) = self.run_compile(runtime)? {
            return Ok(Outcome::Failed(why));
        }

        for (target, link) in &self.symlinks {
            if link.is_symlink() {
                if resolve(link) != resolve(target) {
                    return Ok(Outcome::Failed(format!(
                        "symlink {} is not pointing at {}",
                        link.display(),
                        target.display()
                    )));
                }
                continue;
            }

            if link.exists() {
                return Ok(Outcome::Failed(format!("{} already exists", link.display())));
            }

            std::os::unix::fs::symlink(target, link).map_err(HelperError::io(link))?;
            applied.push(link.clone());
        }

        Ok(Outcome::Applied(applied))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        let mut owned = BTreeMap::from([(self.clone_to.clone(), PathKind::FolderOnly)]);
        for (_, link) in &self.symlinks {
            owned.insert(link.clone(), PathKind::Symlink);
        }
        owned
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.clone_to || is_necessary_path(&self.clone_to, path)
    }
}
