// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persisted action ledger.
//!
//! The ledger is the engine's memory between runs. It records every cleaner
//! that may have to be run at some point, every path the engine owns and how
//! much of it, which of those paths the engine brought into existence itself,
//! and which path removals were postponed.
//!
//! # Format
//!
//! ```json
//! {
//!   "cleaners": [{"type": "clean_line_in_file", "params": {"file": "...", "line": "..."}}],
//!   "paths_owned": {"/home/blah/.config/nvim": "folder_only"},
//!   "paths_postponed": [],
//!   "paths_created": ["/home/blah/.config/nvim"]
//! }
//! ```

use crate::{
    helper::PathKind,
    store::{read_json, write_json_atomic, StoreError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Persisted form of a cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerRecord {
    /// Stable type tag resolved through [`crate::helper::CleanerRegistry`].
    #[serde(rename = "type")]
    pub tag: String,

    /// Parameters the cleaner is reconstructed from.
    #[serde(default)]
    pub params: Value,
}

/// Snapshot of engine state as stored on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub cleaners: Vec<CleanerRecord>,

    #[serde(default)]
    pub paths_owned: BTreeMap<PathBuf, PathKind>,

    #[serde(default)]
    pub paths_postponed: BTreeSet<PathBuf>,

    #[serde(default)]
    pub paths_created: BTreeSet<PathBuf>,
}

impl Ledger {
    /// Load ledger from path.
    ///
    /// A missing or empty file yields an empty ledger. Postponed and created
    /// paths that are no longer owned are dropped.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if file cannot be read.
    /// - Return [`StoreError::Json`] if file is not a valid ledger.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: &Path) -> Result<Self> {
        let mut ledger: Ledger = read_json(path)?.unwrap_or_default();
        let owned = &ledger.paths_owned;
        ledger.paths_postponed.retain(|path| owned.contains_key(path));
        ledger.paths_created.retain(|path| owned.contains_key(path));
        debug!(
            "loaded {} cleaners and {} owned paths from {}",
            ledger.cleaners.len(),
            ledger.paths_owned.len(),
            path.display()
        );

        Ok(ledger)
    }

    /// Write ledger to path atomically.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if ledger cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;
