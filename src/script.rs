// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Declarative script execution.
//!
//! A __script source__ turns whatever a repository declares into helpers
//! registered with the engine. The engine never knows how a script is loaded,
//! it only ever sees the helpers handed to it through a [`RunContext`].
//!
//! [`TomlScript`] is the default script source, reading `hearth.toml` at the
//! top-level of each repository.

use crate::{
    config::{ConfigError, ScriptDefinition, Step, SCRIPT_FILE},
    engine::Engine,
    helper::{
        files::{MakeDir, MakeSymlink, WriteFile},
        lines::{BlockInFile, LineInFile},
        package::InstallPackage,
        pip::PipInstall,
        source::{Checkout, InstallFromSource},
        Helper, HelperError,
    },
    path::{expand_home_path, expand_repo_path},
    store::RepoEntry,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Source of helpers for a repository.
pub trait ScriptSource {
    /// Register every helper the repository declares.
    ///
    /// # Errors
    ///
    /// - Return [`ScriptError`] if the script itself is malformed.
    fn register(&self, repo: &RepoEntry, ctx: &mut RunContext<'_>) -> Result<()>;
}

/// Handle scripts use to register helpers with the engine.
#[derive(Debug)]
pub struct RunContext<'a> {
    engine: &'a mut Engine,
    repo: RepoEntry,
    home: PathBuf,
}

impl<'a> RunContext<'a> {
    /// Construct new run context for repository.
    pub fn new(engine: &'a mut Engine, repo: RepoEntry, home: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            repo,
            home: home.into(),
        }
    }

    pub fn repo(&self) -> &RepoEntry {
        &self.repo
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Queue helper with the engine.
    pub fn register(&mut self, helper: impl Helper + 'static) {
        self.engine.register(helper);
    }

    /// Queue helper, turning failure to construct it into a warning.
    pub fn register_or_warn<H>(&mut self, helper: std::result::Result<H, HelperError>)
    where
        H: Helper + 'static,
    {
        match helper {
            Ok(helper) => self.register(helper),
            Err(error) => self.warn(format!("{}: {error}", self.repo.short_id())),
        }
    }

    /// Enter named section.
    pub fn push_section(&mut self, name: impl Into<String>) -> bool {
        self.engine.push_section(name)
    }

    /// Leave innermost section.
    pub fn pop_section(&mut self) {
        self.engine.pop_section();
    }

    /// Record warning against the run.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.engine.warn(message);
    }

    /// Expand path relative to home, warning if that fails.
    pub fn home_path(&mut self, raw: &str) -> Option<PathBuf> {
        match expand_home_path(raw, &self.home) {
            Ok(path) => Some(path),
            Err(error) => {
                self.warn(format!("cannot expand {raw:?}: {error}"));
                None
            }
        }
    }

    /// Expand path relative to repository, warning if that fails.
    pub fn repo_path(&mut self, raw: &str) -> Option<PathBuf> {
        match expand_repo_path(raw, &self.repo.local_path, &self.home) {
            Ok(path) => Some(path),
            Err(error) => {
                self.warn(format!("cannot expand {raw:?}: {error}"));
                None
            }
        }
    }
}

/// Script source reading TOML script files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TomlScript {
    file_name: String,
}

impl Default for TomlScript {
    fn default() -> Self {
        Self {
            file_name: SCRIPT_FILE.into(),
        }
    }
}

impl TomlScript {
    /// Read script from another file name at top-level of repository.
    pub fn with_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    fn load(path: &Path) -> Result<ScriptDefinition> {
        let data = fs::read_to_string(path).map_err(|source| ScriptError::Read {
            source,
            path: path.into(),
        })?;
        data.parse().map_err(|source| ScriptError::Parse {
            source,
            path: path.into(),
        })
    }

    fn walk(&self, steps: &[Step], ctx: &mut RunContext<'_>, includes: &mut Vec<PathBuf>) -> Result<()> {
        for step in steps {
            self.step(step, ctx, includes)?;
        }

        Ok(())
    }

    fn step(&self, step: &Step, ctx: &mut RunContext<'_>, includes: &mut Vec<PathBuf>) -> Result<()> {
        let repo_id = ctx.repo().repo_id.clone();
        match step {
            Step::Mkdir { path } => {
                if let Some(path) = ctx.home_path(path) {
                    ctx.register(MakeDir::new(path));
                }
            }
            Step::Symlink { target, link } => {
                if let (Some(target), Some(link)) = (ctx.repo_path(target), ctx.home_path(link)) {
                    ctx.register(MakeSymlink::new(target, link));
                }
            }
            Step::LineInFile {
                file,
                line,
                position,
            } => {
                if let Some(file) = ctx.home_path(file) {
                    ctx.register_or_warn(LineInFile::new(file, line.as_str(), *position));
                }
            }
            Step::BlockInFile {
                file,
                lines,
                prefix,
                suffix,
                position,
            } => {
                if let Some(file) = ctx.home_path(file) {
                    ctx.register(BlockInFile::new(
                        file,
                        lines.clone(),
                        prefix.as_str(),
                        suffix.as_str(),
                        *position,
                    ));
                }
            }
            Step::WriteFile { path, contents } => {
                if let Some(path) = ctx.home_path(path) {
                    ctx.register(WriteFile::new(path, contents.as_str()));
                }
            }
            Step::InstallPackage {
                name,
                methods,
                command,
            } => {
                ctx.register(InstallPackage::new(
                    repo_id,
                    name.as_str(),
                    methods.clone(),
                    command.clone(),
                ));
            }
            Step::PipInstall { package, pip, user } => {
                ctx.register_or_warn(PipInstall::new(repo_id, package.as_str(), pip.as_str(), *user));
            }
            Step::InstallFromSource {
                source,
                clone_to,
                branch,
                tag,
                compile,
                symlinks,
            } => {
                let checkout = match (branch, tag) {
                    (Some(branch), None) => Checkout::Branch(branch.clone()),
                    (None, Some(tag)) => Checkout::Tag(tag.clone()),
                    _ => {
                        ctx.warn(format!(
                            "install of {source} needs exactly one of branch or tag"
                        ));
                        return Ok(());
                    }
                };

                let Some(clone_to) = ctx.home_path(clone_to) else {
                    return Ok(());
                };

                let mut helper = InstallFromSource::new(repo_id, source.as_str(), clone_to, checkout);
                if let Some(compile) = compile {
                    helper = helper.with_compile(compile.clone());
                }
                for (target, link) in symlinks {
                    let Some(link) = ctx.home_path(link) else {
                        return Ok(());
                    };
                    helper = helper.with_symlink(target, link);
                }
                ctx.register(helper);
            }
            Step::Include { file } => {
                let Some(path) = ctx.repo_path(file) else {
                    return Ok(());
                };

                if !path.exists() {
                    ctx.warn(format!("{file} not found at {}", path.display()));
                    return Ok(());
                }

                if includes.contains(&path) {
                    ctx.warn(format!("{file} includes itself"));
                    return Ok(());
                }

                debug!("include {}", path.display());
                let definition = Self::load(&path)?;
                includes.push(path);
                self.walk(&definition.steps, ctx, includes)?;
                includes.pop();
            }
            Step::Section { name, steps } => {
                // INVARIANT: Walk disabled sections too, so nested section
                // names are still seen by filter validation.
                ctx.push_section(name.as_str());
                let result = self.walk(steps, ctx, includes);
                ctx.pop_section();
                result?;
            }
        }

        Ok(())
    }
}

impl ScriptSource for TomlScript {
    #[instrument(skip(self, repo, ctx), level = "debug")]
    fn register(&self, repo: &RepoEntry, ctx: &mut RunContext<'_>) -> Result<()> {
        let path = repo.local_path.join(&self.file_name);
        if !path.exists() {
            ctx.warn(format!(
                "{} has no {} script",
                repo.local_path.display(),
                self.file_name
            ));
            return Ok(());
        }

        let definition = Self::load(&path)?;
        let mut includes = vec![path];
        self.walk(&definition.steps, ctx, &mut includes)
    }
}

/// Script error types.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Script file could not be read.
    #[error("failed to read script {path:?}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Script file is malformed.
    #[error("invalid script {path:?}")]
    Parse {
        #[source]
        source: ConfigError,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;
