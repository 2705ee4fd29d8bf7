// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Named section gating.
//!
//! Scripts can wrap groups of steps in named sections. Sections nest, and the
//! __section path__ of a step is the names of every enclosing section joined
//! by "/". Users can restrict a run to certain sections with `--only`, or
//! exclude sections with `--skip`. A filter entry matches a section path if
//! it equals the path or any of its prefixes, so filtering on "shell" also
//! covers "shell/zsh".

use crate::engine::{EngineError, Result};

use std::collections::BTreeSet;

/// Section stack plus user filters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sections {
    stack: Vec<String>,
    seen: BTreeSet<String>,
    only: BTreeSet<String>,
    skip: BTreeSet<String>,
}

impl Sections {
    /// Construct new section gate with filters.
    pub fn new(
        only: impl IntoIterator<Item = impl Into<String>>,
        skip: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            only: only.into_iter().map(Into::into).collect(),
            skip: skip.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Enter section, returning whether helpers inside of it are enabled.
    pub fn push(&mut self, name: impl Into<String>) -> bool {
        self.stack.push(name.into());
        self.seen.insert(self.stack.join("/"));
        self.is_enabled()
    }

    /// Leave innermost section.
    pub fn pop(&mut self) -> Option<String> {
        self.stack.pop()
    }

    /// Path of current section, if inside any.
    pub fn current(&self) -> Option<String> {
        (!self.stack.is_empty()).then(|| self.stack.join("/"))
    }

    /// Check if helpers registered right now should run.
    pub fn is_enabled(&self) -> bool {
        let prefixes = self.prefixes();
        if self.only.is_empty() {
            return !prefixes.iter().any(|prefix| self.skip.contains(prefix));
        }

        prefixes.iter().any(|prefix| self.only.contains(prefix))
    }

    /// Check if any filter is active.
    pub fn is_filtered(&self) -> bool {
        !self.only.is_empty() || !self.skip.is_empty()
    }

    /// Check that every filter names a section that was actually entered.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::UnknownSection`] for first unknown name.
    pub fn validate(&self) -> Result<()> {
        match self
            .only
            .iter()
            .chain(self.skip.iter())
            .find(|name| !self.seen.contains(*name))
        {
            Some(name) => Err(EngineError::UnknownSection(name.clone())),
            None => Ok(()),
        }
    }

    fn prefixes(&self) -> Vec<String> {
        (1..=self.stack.len())
            .map(|depth| self.stack[..depth].join("/"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_enables_section_and_its_children() {
        let mut sections = Sections::new(["shell"], Vec::<String>::new());
        assert!(!sections.is_enabled());

        assert!(sections.push("shell"));
        assert!(sections.push("zsh"));
        assert_eq!(sections.current(), Some("shell/zsh".into()));
        sections.pop();
        sections.pop();

        assert!(!sections.push("editor"));
        sections.pop();
        assert_eq!(sections.current(), None);
        assert!(sections.validate().is_ok());
    }

    #[test]
    fn skip_disables_only_matching_sections() {
        let mut sections = Sections::new(Vec::<String>::new(), ["shell/zsh"]);
        assert!(sections.is_enabled());
        assert!(sections.push("shell"));
        assert!(!sections.push("zsh"));
        sections.pop();
        assert!(sections.push("bash"));
    }

    #[test]
    fn unknown_filter_names_are_rejected() {
        let mut sections = Sections::new(["shell", "nope"], Vec::<String>::new());
        sections.push("shell");
        sections.pop();

        assert!(matches!(
            sections.validate(),
            Err(EngineError::UnknownSection(name)) if name == "nope"
        ));
    }
}
