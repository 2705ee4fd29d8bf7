// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System package installation.
//!
//! Packages are installed through the first available package manager out of
//! brew, yum, apt, and port, in that order. Each package may use a different
//! name per manager, or opt out of a manager entirely. Whenever hearth
//! installs a package it records a fact naming the manager it used, so the
//! matching cleaner only ever uninstalls what hearth itself installed.

use crate::{
    helper::{Cleaner, Helper, Outcome, Persisted, Result, Runtime},
    system::{execute, execute_interactive, have_executable},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Supported package managers in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Brew,
    Yum,
    Apt,
    Port,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Brew, Method::Yum, Method::Apt, Method::Port];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brew => "brew",
            Self::Yum => "yum",
            Self::Apt => "apt",
            Self::Port => "port",
        }
    }

    fn needs_root(self) -> bool {
        matches!(self, Self::Yum | Self::Apt | Self::Port)
    }

    fn install_cmd(self, name: &str) -> Vec<String> {
        let cmd: Vec<&str> = match self {
            Self::Apt => vec!["apt-get", "install", name, "--quiet", "--assume-yes"],
            Self::Yum => vec!["yum", "install", name, "--assumeyes"],
            Self::Brew | Self::Port => vec![self.as_str(), "install", name],
        };
        cmd.into_iter().map(String::from).collect()
    }

    fn uninstall_cmd(self, name: &str) -> Vec<String> {
        let cmd: Vec<&str> = match self {
            Self::Apt => vec!["apt-get", "remove", name, "--quiet", "--assume-yes"],
            Self::Yum => vec!["yum", "erase", name, "--assumeyes"],
            Self::Brew | Self::Port => vec![self.as_str(), "uninstall", name],
        };
        cmd.into_iter().map(String::from).collect()
    }
}

/// Per-manager override of a package's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Alias {
    /// Use this name instead of the package's own name.
    Name(String),

    /// `true` keeps the default name, `false` disables the manager.
    Enabled(bool),
}

fn local_name(name: &str, methods: &BTreeMap<Method, Alias>, method: Method) -> Option<String> {
    match methods.get(&method) {
        None | Some(Alias::Enabled(true)) => Some(name.to_string()),
        Some(Alias::Enabled(false)) => None,
        Some(Alias::Name(alias)) => Some(alias.clone()),
    }
}

fn fact_name(method: Method, local: &str) -> String {
    format!("InstalledPackage:{}:{local}", method.as_str())
}

fn claim_name(name: &str) -> String {
    format!("package:{name}")
}

/// Run package manager command, escalating through `sudo` where required.
fn run_manager(method: Method, cmd: &[String], runtime: &Runtime) -> std::result::Result<(), String> {
    let Some((program, args)) = cmd.split_first() else {
        return Err("empty package manager command".into());
    };

    if method.needs_root() {
        if !runtime.is_interactive() {
            return Err("need to be able to escalate to root".into());
        }
        return execute_interactive("sudo", cmd).map_err(|error| error.to_string());
    }

    execute(program, args, None, &[])
        .map(|_| ())
        .map_err(|error| error.to_string())
}

/// Ensure a system package is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPackage {
    repo_id: String,
    name: String,
    methods: BTreeMap<Method, Alias>,
    command: String,
}

impl InstallPackage {
    pub fn new(
        repo_id: impl Into<String>,
        name: impl Into<String>,
        methods: BTreeMap<Method, Alias>,
        command: Option<String>,
    ) -> Self {
        let name = name.into();
        Self {
            repo_id: repo_id.into(),
            command: command.unwrap_or_else(|| name.clone()),
            name,
            methods,
        }
    }
}

impl Helper for InstallPackage {
    fn description(&self) -> String {
        let how = Method::ALL
            .iter()
            .filter(|method| local_name(&self.name, &self.methods, **method).is_some())
            .map(|method| method.as_str())
            .collect::<Vec<_>>();
        format!("Install package {} using {}", self.name, how.join("/"))
    }

    fn is_done(&self) -> Result<bool> {
        Ok(have_executable(&self.command))
    }

    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome> {
        for method in Method::ALL {
            let Some(local) = local_name(&self.name, &self.methods, method) else {
                continue;
            };

            let cmd = method.install_cmd(&local);
            if !have_executable(&cmd[0]) {
                continue;
            }

            info!("install {local} through {}", method.as_str());
            if let Err(why) = run_manager(method, &cmd, runtime) {
                return Ok(Outcome::Failed(why));
            }

            runtime
                .facts(&self.repo_id)
                .set(&fact_name(method, &local), Value::Bool(true))?;
            return Ok(Outcome::Applied(Vec::new()));
        }

        Ok(Outcome::Failed(format!("no way to install {}", self.name)))
    }

    fn claims(&self) -> BTreeSet<String> {
        BTreeSet::from([claim_name(&self.name)])
    }

    fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
        Some(Box::new(PackageCleaner {
            repo_id: self.repo_id.clone(),
            name: self.name.clone(),
            methods: self.methods.clone(),
        }))
    }
}

/// Uninstall a package hearth installed earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCleaner {
    repo_id: String,
    name: String,
    #[serde(default)]
    methods: BTreeMap<Method, Alias>,
}

impl Persisted for PackageCleaner {
    const TAG: &'static str = "package";
}

impl PackageCleaner {
    fn installed_with(&self, runtime: &mut Runtime) -> Result<Vec<(Method, String)>> {
        let mut found = Vec::new();
        for method in Method::ALL {
            let Some(local) = local_name(&self.name, &self.methods, method) else {
                continue;
            };

            if runtime.facts(&self.repo_id).is_set(&fact_name(method, &local))? {
                found.push((method, local));
            }
        }

        Ok(found)
    }
}

impl Cleaner for PackageCleaner {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn params(&self) -> Value {
        json!(self)
    }

    fn description(&self) -> String {
        format!("Remove package {}", self.name)
    }

    fn is_needed(&self, runtime: &mut Runtime) -> Result<bool> {
        Ok(!self.installed_with(runtime)?.is_empty())
    }

    fn needs_claims(&self) -> BTreeSet<String> {
        BTreeSet::from([claim_name(&self.name)])
    }

    fn make_changes(&self, runtime: &mut Runtime) -> Result<Outcome> {
        let installed = self.installed_with(runtime)?;
        if installed.is_empty() {
            return Ok(Outcome::NotNeeded);
        }

        let mut failures = Vec::new();
        for (method, local) in installed {
            if method.needs_root() && !runtime.is_interactive() {
                failures.push(format!(
                    "need to be able to escalate to root to remove {local}"
                ));
                continue;
            }

            let result = run_manager(method, &method.uninstall_cmd(&local), runtime);

            // INVARIANT: Always forget the fact once removal was attempted.
            runtime.facts(&self.repo_id).clear(&fact_name(method, &local))?;
            if let Err(why) = result {
                warn!("failed to remove {local} through {}: {why}", method.as_str());
                failures.push(why);
            }
        }

        if failures.is_empty() {
            Ok(Outcome::Applied(Vec::new()))
        } else {
            Ok(Outcome::Failed(failures.join("; ")))
        }
    }
}
