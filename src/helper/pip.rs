// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Python package installation through pip.

use crate::{
    helper::{Cleaner, Helper, HelperError, Outcome, Persisted, Result, Runtime},
    system::{execute, have_executable},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

fn fact_name(pip: &str, package: &str) -> String {
    format!("pipinstall:{pip}:{package}")
}

fn claim_name(pip: &str, package: &str) -> String {
    format!("{pip}:{package}")
}

/// Check if pip reports package as installed.
// INVARIANT: A failing `pip list` is an unknown answer, never a fatal error.
fn has_package(pip: &str, package: &str) -> Option<bool> {
    let output = match execute(pip, ["list", "--disable-pip-version-check"], None, &[]) {
        Ok(output) => output,
        Err(error) => {
            warn!("cannot list packages of {pip}: {error}");
            return None;
        }
    };

    let prefix = format!("{} ", package.to_lowercase());
    Some(
        output
            .stdout
            .lines()
            .any(|line| line.to_lowercase().starts_with(&prefix)),
    )
}

/// Ensure Python package is installed through given pip executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipInstall {
    repo_id: String,
    package: String,
    pip: String,
    user: bool,
}

impl PipInstall {
    /// Construct new pip install helper.
    ///
    /// # Errors
    ///
    /// - Return [`HelperError::MissingExecutable`] if pip cannot be found.
    pub fn new(
        repo_id: impl Into<String>,
        package: impl Into<String>,
        pip: impl Into<String>,
        user: bool,
    ) -> Result<Self> {
        let pip = pip.into();
        if !have_executable(&pip) {
            return Err(HelperError::MissingExecutable(pip));
        }

        Ok(Self {
            repo_id: repo_id.into(),
            package: package.into(),
            pip,
            user,
        })
    }
}

impl Helper for PipInstall {
    fn description(&self) -> String {
        let user = if self.user { " --user" } else { "" };
        format!("{} install {}{user}", self.pip, self.package)
    }

    fn is_done(&self) -> Result<bool> {
        Ok(has_package(&self.pip, &self.package).unwrap_or(false))
    }

    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome> {
        let mut args = vec![
            "install",
            self.package.as_str(),
            "--disable-pip-version-check",
        ];
        if self.user {
            args.push("--user");
        }

        if let Err(error) = execute(&self.pip, &args, None, &[]) {
            return Ok(Outcome::Failed(error.to_string()));
        }

        runtime
            .facts(&self.repo_id)
            .set(&fact_name(&self.pip, &self.package), Value::Bool(true))?;
        Ok(Outcome::Applied(Vec::new()))
    }

    fn claims(&self) -> BTreeSet<String> {
        BTreeSet::from([claim_name(&self.pip, &self.package)])
    }

    fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
        Some(Box::new(PipCleaner {
            repo_id: self.repo_id.clone(),
            package: self.package.clone(),
            pip: self.pip.clone(),
        }))
    }
}

/// Uninstall Python package hearth installed earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipCleaner {
    repo_id: String,
    package: String,
    pip: String,
}

impl Persisted for PipCleaner {
    const TAG: &'static str = "pip";
}

impl Cleaner for PipCleaner {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn params(&self) -> Value {
        json!(self)
    }

    fn description(&self) -> String {
        format!("{} uninstall {}", self.pip, self.package)
    }

    fn is_needed(&self, runtime: &mut Runtime) -> Result<bool> {
        if !runtime
            .facts(&self.repo_id)
            .is_set(&fact_name(&self.pip, &self.package))?
        {
            return Ok(false);
        }

        if !have_executable(&self.pip) {
            debug!("{} is gone, nothing left to uninstall", self.pip);
            return Ok(false);
        }

        Ok(has_package(&self.pip, &self.package).unwrap_or(true))
    }

    fn needs_claims(&self) -> BTreeSet<String> {
        BTreeSet::from([claim_name(&self.pip, &self.package)])
    }

    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome> {
        let mut args = vec!["uninstall", self.package.as_str()];
        if !runtime.is_interactive() {
            args.push("--yes");
        }

        let result = execute(&self.pip, &args, None, &[]);

        // INVARIANT: Always forget the fact once removal was attempted.
        runtime
            .facts(&self.repo_id)
            .clear(&fact_name(&self.pip, &self.package))?;

        match result {
            Ok(_) => Ok(Outcome::Applied(Vec::new())),
            Err(error) => {
                warn!("failed to uninstall {}: {error}", self.package);
                Ok(Outcome::Failed(error.to_string()))
            }
        }
    }
}
