// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Declarative dotfile provisioning.
//!
//! Hearth keeps a machine in the state described by scripts that live in one
//! or more __source repositories__. Each script declares helpers, e.g., make
//! this directory or keep this line in that file. Running an update pulls the
//! source repositories, and runs their helpers through the [`Engine`].
//!
//! # Reconciliation
//!
//! The engine remembers which paths helpers created, and how to undo the
//! changes they made to shared files or system packages. Once a script stops
//! declaring a helper, the next full update reverses what that helper did.
//! Nothing the engine did not create itself is ever removed.
//!
//! # See Also
//!
//! - [`engine`]
//! - [`helper`]
//! - [`script`]

pub mod config;
pub mod engine;
pub mod helper;
pub mod path;
pub mod repo;
pub mod script;
pub mod status;
pub mod store;
pub mod system;
pub mod update;

#[doc(inline)]
pub use crate::{
    config::{ScriptDefinition, Step, SCRIPT_FILE},
    engine::{Conflicts, Engine},
    helper::{Cleaner, CleanerRegistry, Helper, Outcome, PathKind, Runtime},
    repo::GitRepo,
    script::{RunContext, ScriptSource, TomlScript},
    status::{FailureKind, UpdateStatus},
    store::{Layout, RepoEntry, RepoList},
    update::{UpdateOptions, UpdateReport},
};
