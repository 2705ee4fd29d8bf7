// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source repository handling.
//!
//! Every source repository is a plain Git repository with a working tree. A
//! source repository is either __local__, i.e., a path to a clone on disk, or
//! __remote__, i.e., a URL that `git clone` understands. Only local
//! repositories can be pulled or identified, remote ones must be cloned
//! first.
//!
//! # Repository Identity
//!
//! The identity of a repository is the id of its root commit. The identity
//! survives moving the clone, re-cloning it, or switching remotes, so the
//! facts and cleaners recorded for a repository stay attached to it.
//!
//! # Canonical URLs
//!
//! GitHub repositories have a __canonical__ URL of the form
//! `https://github.com/<user>/<name>.git`. Adding the same GitHub repository
//! through another URL form still resolves to one registration.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, ErrorClass, FetchOptions, RemoteCallbacks, Repository, Sort, StatusOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument};

/// Handle to a local or remote Git repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepo {
    location: String,
    is_remote: bool,
    canonical: Option<String>,
    suggested_name: Option<String>,
}

impl GitRepo {
    /// Construct repository handle from local path or remote URL.
    ///
    /// Local paths must point at the top-level of a non-bare repository.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NotARepo`] if path is not a Git repository.
    pub fn from_path_or_url(raw: &str) -> Result<Self> {
        if is_url(raw) {
            let canonical = github_parts(raw)
                .map(|(user, name)| format!("https://github.com/{user}/{name}.git"));
            let suggested_name = match github_parts(raw) {
                Some((_, name)) => Some(name.to_string()),
                None => raw
                    .trim_end_matches('/')
                    .rsplit(|c| c == '/' || c == ':')
                    .next()
                    .map(|base| base.strip_suffix(".git").unwrap_or(base))
                    .filter(|base| !base.is_empty())
                    .map(str::to_string),
            };

            return Ok(Self {
                location: raw.into(),
                is_remote: true,
                canonical,
                suggested_name,
            });
        }

        let path = crate::path::resolve(Path::new(raw));
        match Repository::open(&path) {
            Ok(repo) if !repo.is_bare() && repo.workdir().is_some() => Ok(Self {
                location: path.to_string_lossy().into_owned(),
                is_remote: false,
                canonical: None,
                suggested_name: None,
            }),
            _ => Err(RepoError::NotARepo(raw.into())),
        }
    }

    /// Path or URL this handle points at.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Local path of repository.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NotLocal`] if repository is remote.
    pub fn local_path(&self) -> Result<PathBuf> {
        if self.is_remote {
            return Err(RepoError::NotLocal(self.location.clone()));
        }

        Ok(PathBuf::from(&self.location))
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Check if location is exactly the canonical URL of the repository.
    pub fn is_canonical(&self) -> bool {
        self.canonical.as_deref() == Some(self.location.as_str())
    }

    /// Canonical URL of repository, if it has one.
    pub fn canonical_url(&self) -> Option<&str> {
        self.canonical.as_deref()
    }

    /// Directory name a fresh clone of remote repository should get.
    pub fn suggested_name(&self) -> Option<&str> {
        self.suggested_name.as_deref()
    }

    /// Determine identity of repository through its root commit.
    ///
    /// Commits reachable from HEAD are walked first. If HEAD is unborn, every
    /// reference is walked instead.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::NoCommits`] if repository has no commits.
    /// - Return [`RepoError::MultipleRoots`] if history has more than one
    ///   root commit.
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self), level = "debug")]
    pub fn repo_id(&self) -> Result<String> {
        let path = self.local_path()?;
        let repo = Repository::open(&path)?;

        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;
        if walk.push_head().is_err() {
            walk.push_glob("*")?;
        }

        let mut roots = Vec::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            if commit.parent_count() == 0 && !roots.contains(&commit.id()) {
                roots.push(commit.id());
            }
        }

        match roots.as_slice() {
            [] => Err(RepoError::NoCommits(path)),
            [root] => {
                debug!("repository {} is {root}", path.display());
                Ok(root.to_string())
            }
            _ => Err(RepoError::MultipleRoots(path)),
        }
    }

    /// Check if working tree has uncommitted changes.
    ///
    /// Untracked files do not count.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    pub fn is_dirty(&self) -> Result<bool> {
        let repo = Repository::open(self.local_path()?)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        Ok(!statuses.is_empty())
    }

    /// Fetch current branch from "origin", and fast-forward to it.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Connection`] if remote cannot be reached.
    /// - Return [`RepoError::DetachedHead`] if no branch is checked out.
    /// - Return [`RepoError::Diverged`] if branch cannot be fast-forwarded.
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn pull(&self, bar: ProgressBar) -> Result<()> {
        let path = self.local_path()?;
        let repo = Repository::open(&path)?;
        let head = repo.head()?;
        let branch = match head.shorthand() {
            Some(branch) if head.is_branch() => branch.to_string(),
            _ => return Err(RepoError::DetachedHead(path)),
        };

        info!("pull {branch} into {}", path.display());
        let mut remote = repo.find_remote("origin")?;
        with_fetch_options(bar, self.location(), |mut fo| {
            remote.fetch(&[branch.as_str()], Some(&mut fo), None)
        })?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&incoming])?;
        if analysis.is_up_to_date() {
            debug!("{branch} is up to date");
            return Ok(());
        }

        if !analysis.is_fast_forward() {
            return Err(RepoError::Diverged { branch, path });
        }

        let refname = format!("refs/heads/{branch}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(incoming.id(), "hearth: fast-forward")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;

        Ok(())
    }

    /// Clone repository into destination path.
    ///
    /// The progress of the clone is displayed through a progress bar. If any
    /// credentials are required for the clone to continue, then the user
    /// will be prompted for them. The progress bar will be blocked for user
    /// input.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Connection`] if remote cannot be reached.
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self, dest, bar), level = "debug")]
    pub fn clone_to_path(&self, dest: impl AsRef<Path>, bar: ProgressBar) -> Result<GitRepo> {
        let dest = dest.as_ref();
        info!("clone {} into {}", self.location, dest.display());
        with_fetch_options(bar, self.location(), |fo| {
            RepoBuilder::new()
                .fetch_options(fo)
                .clone(&self.location, dest)
                .map(|_| ())
        })?;

        Ok(Self {
            location: crate::path::resolve(dest).to_string_lossy().into_owned(),
            is_remote: false,
            canonical: None,
            suggested_name: None,
        })
    }
}

fn is_url(raw: &str) -> bool {
    raw.contains("://") || raw.starts_with("git@")
}

fn github_parts(url: &str) -> Option<(&str, &str)> {
    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("git@github.com:"))
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))?;
    let mut parts = rest.split('/');
    let user = parts.next().filter(|user| !user.is_empty())?;
    let name = parts.next().filter(|name| !name.is_empty())?;

    Some((user, name.strip_suffix(".git").unwrap_or(name)))
}

fn with_fetch_options(
    bar: ProgressBar,
    message: &str,
    action: impl FnOnce(FetchOptions<'_>) -> std::result::Result<(), git2::Error>,
) -> Result<()> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(message.to_string());
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar);
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.transfer_progress(|progress| {
        let stats = progress.to_owned();
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(stats.total_objects() as u64);
            prompter.bar.set_position(stats.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    let result = action(fo);
    prompter.bar.finish_and_clear();

    result.map_err(|error| match error.class() {
        ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http => RepoError::Connection(error),
        _ => RepoError::Git2(error),
    })
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Source repository error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Path is not the top-level of a Git repository with a working tree.
    #[error("{0:?} is not a git repository")]
    NotARepo(String),

    /// Repository has no commits to derive identity from.
    #[error("repository {0:?} has no commits")]
    NoCommits(PathBuf),

    /// Repository history has more than one root commit.
    #[error("repository {0:?} has multiple initial commits")]
    MultipleRoots(PathBuf),

    /// Operation needs a local clone.
    #[error("{0:?} is not a local repository")]
    NotLocal(String),

    /// No branch is checked out.
    #[error("repository {0:?} has no branch checked out")]
    DetachedHead(PathBuf),

    /// Local branch and remote branch have diverged.
    #[error("cannot fast-forward {branch} in {path:?}")]
    Diverged { branch: String, path: PathBuf },

    /// Remote could not be reached.
    #[error("cannot connect to remote repository")]
    Connection(#[source] git2::Error),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs;

    fn init(path: &Path) -> anyhow::Result<Repository> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Ok(Repository::init_opts(path, &opts)?)
    }

    fn commit(repo: &Repository, name: &str, contents: &str) -> anyhow::Result<git2::Oid> {
        let workdir = repo.workdir().ok_or_else(|| anyhow::anyhow!("bare"))?;
        fs::write(workdir.join(name), contents)?;
        let mut index = repo.index()?;
        index.add_path(Path::new(name))?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let signature = Signature::now("John Doe", "john@doe.com")?;
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit()?],
            Err(_) => Vec::new(),
        };
        let parents = parents.iter().collect::<Vec<_>>();

        Ok(repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("chore: add {name}"),
            &tree,
            &parents,
        )?)
    }

    #[test_case("https://github.com/awkless/dots.git", true, Some("dots"); "canonical github")]
    #[test_case("https://github.com/awkless/dots", false, Some("dots"); "github without suffix")]
    #[test_case("git@github.com:awkless/dots.git", false, Some("dots"); "github over ssh")]
    #[test_case("https://example.com/git/dots.git/", false, Some("dots"); "elsewhere")]
    #[test]
    fn remote_urls_are_classified(url: &str, canonical: bool, name: Option<&str>) -> anyhow::Result<()> {
        let repo = GitRepo::from_path_or_url(url)?;
        assert!(repo.is_remote());
        pretty_assertions::assert_eq!(repo.is_canonical(), canonical);
        pretty_assertions::assert_eq!(repo.suggested_name(), name);
        if url.contains("github.com") {
            pretty_assertions::assert_eq!(
                repo.canonical_url(),
                Some("https://github.com/awkless/dots.git")
            );
        }

        Ok(())
    }

    #[test]
    fn local_path_must_be_repository() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let result = GitRepo::from_path_or_url(&tmp.path().to_string_lossy());
        assert!(matches!(result, Err(RepoError::NotARepo(_))));

        init(tmp.path())?;
        let repo = GitRepo::from_path_or_url(&tmp.path().to_string_lossy())?;
        assert!(!repo.is_remote());
        assert_eq!(repo.local_path()?, crate::path::resolve(tmp.path()));

        Ok(())
    }

    #[test]
    fn repo_id_is_root_commit() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let git = init(tmp.path())?;
        let repo = GitRepo::from_path_or_url(&tmp.path().to_string_lossy())?;
        assert!(matches!(repo.repo_id(), Err(RepoError::NoCommits(_))));

        let root = commit(&git, "a.txt", "a")?;
        commit(&git, "b.txt", "b")?;
        assert_eq!(repo.repo_id()?, root.to_string());

        Ok(())
    }

    #[test]
    fn untracked_files_are_not_dirty() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let git = init(tmp.path())?;
        commit(&git, "a.txt", "a")?;
        let repo = GitRepo::from_path_or_url(&tmp.path().to_string_lossy())?;

        fs::write(tmp.path().join("untracked.txt"), "new")?;
        assert!(!repo.is_dirty()?);

        fs::write(tmp.path().join("a.txt"), "changed")?;
        assert!(repo.is_dirty()?);

        Ok(())
    }

    #[test]
    fn clone_then_pull_fast_forwards() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let upstream_path = tmp.path().join("upstream");
        let upstream = init(&upstream_path)?;
        let root = commit(&upstream, "a.txt", "a")?;

        let source = GitRepo::from_path_or_url(&upstream_path.to_string_lossy())?;
        let clone = source.clone_to_path(tmp.path().join("clone"), ProgressBar::hidden())?;
        assert_eq!(clone.repo_id()?, root.to_string());

        commit(&upstream, "b.txt", "b")?;
        clone.pull(ProgressBar::hidden())?;
        assert_eq!(fs::read_to_string(tmp.path().join("clone/b.txt"))?, "b");

        Ok(())
    }
}
