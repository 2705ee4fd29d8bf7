// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Script definition layout.
//!
//! Specify the layout of the declarative `hearth.toml` script that every
//! source repository carries at its top-level, to simplify serialization and
//! deserialization. Path expansion and file I/O are left to the caller, see
//! [`crate::script`].
//!
//! # General Layout
//!
//! A script is an ordered list of steps. Each step names its kind, plus the
//! settings that kind of step needs. Section steps carry a nested list of
//! steps of their own.
//!
//! ```toml
//! [[step]]
//! kind = "mkdir"
//! path = "~/.config/nvim"
//!
//! [[step]]
//! kind = "section"
//! name = "shell"
//!
//! [[step.step]]
//! kind = "line_in_file"
//! file = "~/.bashrc"
//! line = "source ~/dotfiles/bashrc"
//! where = "end"
//! ```

use crate::helper::{
    lines::Position,
    package::{Alias, Method},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Name of script file at top-level of every source repository.
pub const SCRIPT_FILE: &str = "hearth.toml";

/// Script definition layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ScriptDefinition {
    /// Steps in the order they should run.
    #[serde(rename = "step", default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl FromStr for ScriptDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ConfigError::Deserialize)
    }
}

impl Display for ScriptDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// One step of a script.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Make directory, relative to home.
    Mkdir { path: String },

    /// Symlink `link`, relative to home, to `target`, relative to repository.
    Symlink { target: String, link: String },

    /// Ensure line is present in file.
    LineInFile {
        file: String,
        line: String,
        #[serde(rename = "where", default)]
        position: Position,
    },

    /// Ensure block of lines fenced by prefix and suffix is present in file.
    BlockInFile {
        file: String,
        lines: Vec<String>,
        prefix: String,
        suffix: String,
        #[serde(rename = "where", default)]
        position: Position,
    },

    /// Write whole file.
    WriteFile { path: String, contents: String },

    /// Install system package.
    InstallPackage {
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        methods: BTreeMap<Method, Alias>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },

    /// Install Python package.
    PipInstall {
        package: String,
        #[serde(default = "default_pip")]
        pip: String,
        #[serde(default = "default_true")]
        user: bool,
    },

    /// Clone and build source repository.
    InstallFromSource {
        source: String,
        clone_to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compile: Option<Vec<Vec<String>>>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        symlinks: BTreeMap<String, String>,
    },

    /// Run steps of another script in the same repository.
    Include { file: String },

    /// Named group of steps that can be filtered on.
    Section {
        name: String,
        #[serde(rename = "step", default)]
        steps: Vec<Step>,
    },
}

fn default_pip() -> String {
    "pip3".into()
}

fn default_true() -> bool {
    true
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}
