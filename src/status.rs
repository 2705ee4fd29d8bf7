// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Update status markers.
//!
//! The state of the current or previous update is kept as plain marker files
//! in the configuration directory, so external tools can ask for it without
//! taking part in the run:
//!
//! - `update-running`: pid of the update in progress.
//! - `update-section`: section the update in progress is running.
//! - `update-time`: time of the last successful update.
//! - `update-failed`: kind of failure of the last update.
//! - `update-paused`: automatic updates are paused.
//!
//! The run marker doubles as the lock that keeps two updates from running at
//! once. It is created exclusively, so a second update aborts right away
//! instead of waiting.

use crate::store::Layout;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, instrument, warn};

/// Why the last update was unsuccessful.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Update failed, or finished with warnings.
    #[default]
    Failed,

    /// Some remote repository could not be reached.
    NoConnection,

    /// Some repository had uncommitted changes, so it was not pulled.
    Dirty,

    /// Update was interrupted.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::NoConnection => "noconn",
            Self::Dirty => "dirty",
            Self::Interrupted => "interrupted",
        }
    }
}

impl FromStr for FailureKind {
    type Err = std::convert::Infallible;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match data.trim() {
            "noconn" => Self::NoConnection,
            "dirty" => Self::Dirty,
            "interrupted" => Self::Interrupted,
            _ => Self::Failed,
        })
    }
}

impl Display for FailureKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// State of the current or previous update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Last update succeeded, and none is running.
    Ok,

    /// No update was ever run.
    Never,

    /// Update is running right now.
    Running { section: Option<String> },

    /// Automatic updates are paused.
    Paused,

    /// Last update was unsuccessful.
    Failed(FailureKind),
}

impl UpdateStatus {
    /// Process exit code that reports this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Never => 2,
            Self::Running { .. } => 3,
            Self::Paused => 4,
            Self::Failed(_) => 5,
        }
    }
}

impl Display for UpdateStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Ok => fmt.write_str("ok"),
            Self::Never => fmt.write_str("never"),
            Self::Running { section: None } => fmt.write_str("running"),
            Self::Running {
                section: Some(section),
            } => write!(fmt, "running section {section}"),
            Self::Paused => fmt.write_str("paused"),
            Self::Failed(kind) => write!(fmt, "{kind}"),
        }
    }
}

/// Exclusive hold on the run marker.
///
/// Dropping the guard removes the run marker and the section marker.
#[derive(Debug)]
pub struct RunGuard {
    run_marker: PathBuf,
    section_marker: PathBuf,
}

impl RunGuard {
    /// Create run marker, failing if another update holds it.
    ///
    /// # Errors
    ///
    /// - Return [`StatusError::AlreadyRunning`] if run marker exists.
    /// - Return [`StatusError::Io`] if run marker cannot be written.
    #[instrument(skip(layout), level = "debug")]
    pub fn acquire(layout: &Layout) -> Result<Self> {
        let run_marker = layout.run_marker();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&run_marker)
        {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                let pid = fs::read_to_string(&run_marker).unwrap_or_default();
                return Err(StatusError::AlreadyRunning {
                    pid: pid.trim().to_string(),
                });
            }
            Err(source) => return Err(StatusError::io(&run_marker)(source)),
        };

        // INVARIANT: Guard exists before the pid is written, so a failed
        // write still cleans up the marker.
        let guard = Self {
            section_marker: layout.section_marker(),
            run_marker,
        };
        write!(file, "{}", std::process::id()).map_err(StatusError::io(&guard.run_marker))?;
        debug!("acquired {}", guard.run_marker.display());

        Ok(guard)
    }

    /// Path of section marker that belongs to this run.
    pub fn section_marker(&self) -> &Path {
        &self.section_marker
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        for marker in [&self.section_marker, &self.run_marker] {
            match fs::remove_file(marker) {
                Err(error) if error.kind() != ErrorKind::NotFound => {
                    warn!("cannot remove {}: {error}", marker.display());
                }
                _ => {}
            }
        }
    }
}

/// Write name of section being run, or remove marker if outside sections.
///
/// # Errors
///
/// - Return [`std::io::Error`] if marker cannot be written or removed.
pub fn write_section(marker: &Path, section: Option<&str>) -> std::io::Result<()> {
    match section {
        Some(section) => fs::write(marker, section),
        None => remove_if_exists(marker),
    }
}

/// Record successful update.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if markers cannot be updated.
pub fn record_success(layout: &Layout) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let time_marker = layout.time_marker();
    fs::write(&time_marker, now.to_string()).map_err(StatusError::io(&time_marker))?;
    clear_failure(layout)
}

/// Record unsuccessful update.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if marker cannot be written.
pub fn record_failure(layout: &Layout, kind: FailureKind) -> Result<()> {
    let fail_marker = layout.fail_marker();
    fs::write(&fail_marker, kind.as_str()).map_err(StatusError::io(&fail_marker))
}

/// Give up on update in progress after it was interrupted.
///
/// Removes the run marker on behalf of a guard that will never be dropped.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if markers cannot be updated.
pub fn record_interrupted(layout: &Layout) -> Result<()> {
    for marker in [layout.section_marker(), layout.run_marker()] {
        remove_if_exists(&marker).map_err(StatusError::io(&marker))?;
    }

    record_failure(layout, FailureKind::Interrupted)
}

/// Pause automatic updates.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if marker cannot be written.
pub fn pause(layout: &Layout) -> Result<()> {
    let pause_marker = layout.pause_marker();
    fs::write(&pause_marker, "").map_err(StatusError::io(&pause_marker))
}

/// Resume automatic updates.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if marker cannot be removed.
pub fn unpause(layout: &Layout) -> Result<()> {
    let pause_marker = layout.pause_marker();
    remove_if_exists(&pause_marker).map_err(StatusError::io(&pause_marker))
}

/// Forget about failure of the last update.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if marker cannot be removed.
pub fn clear_failure(layout: &Layout) -> Result<()> {
    let fail_marker = layout.fail_marker();
    remove_if_exists(&fail_marker).map_err(StatusError::io(&fail_marker))
}

/// Determine state of the current or previous update.
///
/// # Errors
///
/// - Return [`StatusError::Io`] if markers exist but cannot be read.
pub fn get_status(layout: &Layout) -> Result<UpdateStatus> {
    if layout.run_marker().exists() {
        let section_marker = layout.section_marker();
        let section = match fs::read_to_string(&section_marker) {
            Ok(section) => Some(section.trim().to_string()).filter(|s| !s.is_empty()),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(source) => return Err(StatusError::io(&section_marker)(source)),
        };
        return Ok(UpdateStatus::Running { section });
    }

    if layout.pause_marker().exists() {
        return Ok(UpdateStatus::Paused);
    }

    let fail_marker = layout.fail_marker();
    if fail_marker.exists() {
        let content = fs::read_to_string(&fail_marker).map_err(StatusError::io(&fail_marker))?;
        let kind = content.parse::<FailureKind>().unwrap_or_default();
        return Ok(UpdateStatus::Failed(kind));
    }

    if layout.time_marker().exists() {
        return Ok(UpdateStatus::Ok);
    }

    Ok(UpdateStatus::Never)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Status marker error types.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// Another update holds the run marker.
    #[error("another update is already running (pid {pid})")]
    AlreadyRunning { pid: String },

    /// Marker file could not be accessed.
    #[error("failed to access marker {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl StatusError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = StatusError> = std::result::Result<T, E>;
