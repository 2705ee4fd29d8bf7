// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-repository fact storage.
//!
//! A __fact__ is a small piece of auxiliary memory that a helper or cleaner
//! keeps across runs, e.g., "package X was installed through apt by us".
//! Facts are namespaced by repository identity, and each namespace is backed
//! by its own JSON document that is loaded lazily on first access. Every
//! mutation is written out immediately, so recorded facts survive even if the
//! run aborts later on.

use crate::store::{read_json, write_json_atomic, StoreError};

use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};
use tracing::debug;

type Document = BTreeMap<String, Value>;

/// Lazily loaded fact documents keyed by repository identity.
#[derive(Debug, Clone)]
pub struct FactStore {
    dir: PathBuf,
    loaded: HashMap<String, Document>,
}

impl FactStore {
    /// Open fact store rooted at directory.
    ///
    /// Nothing is read until a namespace is first accessed.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: HashMap::new(),
        }
    }

    /// Scope fact access to one repository.
    pub fn scope<'a>(&'a mut self, repo_id: &'a str) -> Facts<'a> {
        Facts {
            store: self,
            repo_id,
        }
    }

    fn document(&mut self, repo_id: &str) -> Result<&mut Document> {
        if !self.loaded.contains_key(repo_id) {
            let doc = read_json(&self.path_of(repo_id))?.unwrap_or_default();
            self.loaded.insert(repo_id.to_string(), doc);
        }

        // INVARIANT: Namespace was inserted above if it was missing.
        Ok(self.loaded.entry(repo_id.to_string()).or_default())
    }

    fn flush(&mut self, repo_id: &str) -> Result<()> {
        let path = self.path_of(repo_id);
        let doc = self.document(repo_id)?;
        debug!("write facts to {}", path.display());
        write_json_atomic(&path, &*doc)
    }

    fn path_of(&self, repo_id: &str) -> PathBuf {
        self.dir.join(format!("{repo_id}.json"))
    }
}

/// Fact access scoped to a single repository.
#[derive(Debug)]
pub struct Facts<'a> {
    store: &'a mut FactStore,
    repo_id: &'a str,
}

impl Facts<'_> {
    /// Get value of fact if it has been recorded.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if fact document cannot be loaded.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.document(self.repo_id)?.get(key).cloned())
    }

    /// Get value of fact, falling back to default.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if fact document cannot be loaded.
    pub fn get_or(&mut self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Check if fact is recorded as JSON `true`.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if fact document cannot be loaded.
    pub fn is_set(&mut self, key: &str) -> Result<bool> {
        Ok(self.get_or(key, Value::Bool(false))? == Value::Bool(true))
    }

    /// Record fact, writing it out immediately.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if fact document cannot be loaded or written.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.store
            .document(self.repo_id)?
            .insert(key.to_string(), value);
        self.store.flush(self.repo_id)
    }

    /// Forget fact, writing the change out immediately.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if fact document cannot be loaded or written.
    pub fn clear(&mut self, key: &str) -> Result<()> {
        if self.store.document(self.repo_id)?.remove(key).is_some() {
            self.store.flush(self.repo_id)?;
        }

        Ok(())
    }
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;
