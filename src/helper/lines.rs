// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Line and block editing helpers.
//!
//! These helpers own only part of a file: a single line, or a block of lines
//! fenced by a prefix and suffix line. Files keep whatever newline style they
//! already use, determined by the first line break encountered. New files use
//! "\n".

use crate::helper::{
    file_needs, Cleaner, Helper, HelperError, Outcome, PathKind, Persisted, Result, Runtime,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Where managed content should be placed in a file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// First thing in the file.
    Top,

    /// Last thing in the file.
    End,

    /// Anywhere, appending to the end if missing.
    #[default]
    Any,
}

/// Ensure a single line is present in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInFile {
    file: PathBuf,
    line: String,
    position: Position,
}

impl LineInFile {
    /// Construct new line-in-file helper.
    ///
    /// # Errors
    ///
    /// - Return [`HelperError::InvalidLine`] if line is empty, contains a
    ///   line break, or has leading or trailing whitespace.
    pub fn new(file: impl Into<PathBuf>, line: impl Into<String>, position: Position) -> Result<Self> {
        let line = line.into();
        let reason = if line.is_empty() {
            Some("line cannot be empty")
        } else if line.contains(['\n', '\r']) {
            Some("line cannot contain line breaks")
        } else if line.trim() != line {
            Some("line cannot start or end with whitespace")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(HelperError::InvalidLine { line, reason });
        }

        Ok(Self {
            file: file.into(),
            line,
            position,
        })
    }
}

impl Helper for LineInFile {
    fn description(&self) -> String {
        let position = match self.position {
            Position::Top => " (at top)",
            Position::End => " (at end)",
            Position::Any => "",
        };
        format!("Add line to {}: {:?}{position}", self.file.display(), self.line)
    }

    fn is_done(&self) -> Result<bool> {
        let Some(lines) = TextFile::read(&self.file)?.lines else {
            return Ok(false);
        };

        let found = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| **line == self.line)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        // INVARIANT: Line appearing more than once is not done.
        let [index] = found.as_slice() else {
            return Ok(false);
        };

        Ok(match self.position {
            Position::Top => *index == 0,
            Position::End => *index + 1 == lines.len(),
            Position::Any => true,
        })
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        if let Some(failed) = missing_parent(&self.file) {
            return Ok(failed);
        }

        let text = TextFile::read(&self.file)?;
        let mut out = Vec::new();
        let mut seen = false;

        if self.position == Position::Top {
            out.push(self.line.clone());
            seen = true;
        }

        for line in text.lines.iter().flatten() {
            if *line == self.line {
                // INVARIANT: Drop duplicates, and the original if it must move
                // to the end.
                if seen || self.position == Position::End {
                    continue;
                }
                seen = true;
            }
            out.push(line.clone());
        }

        if !seen {
            out.push(self.line.clone());
        }

        text.write(&self.file, &out)?;
        Ok(Outcome::Applied(vec![self.file.clone()]))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::from([(self.file.clone(), PathKind::FilePart)])
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.file
    }

    fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
        Some(Box::new(CleanLineInFile {
            file: self.file.clone(),
            line: self.line.clone(),
        }))
    }
}

/// Remove every occurrence of a line from a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanLineInFile {
    file: PathBuf,
    line: String,
}

impl Persisted for CleanLineInFile {
    const TAG: &'static str = "clean_line_in_file";
}

impl Cleaner for CleanLineInFile {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn params(&self) -> Value {
        json!(self)
    }

    fn description(&self) -> String {
        format!("Remove line from {}: {:?}", self.file.display(), self.line)
    }

    fn is_needed(&self, _: &mut Runtime) -> Result<bool> {
        Ok(TextFile::read(&self.file)?
            .lines
            .is_some_and(|lines| lines.contains(&self.line)))
    }

    fn wants_path(&self, path: &Path) -> bool {
        file_needs(&self.file, path)
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        let text = TextFile::read(&self.file)?;
        let Some(lines) = &text.lines else {
            return Ok(Outcome::NotNeeded);
        };

        let out = lines
            .iter()
            .filter(|line| **line != self.line)
            .cloned()
            .collect::<Vec<_>>();
        if out.len() == lines.len() {
            return Ok(Outcome::NotNeeded);
        }

        text.write(&self.file, &out)?;
        Ok(Outcome::Applied(vec![self.file.clone()]))
    }
}

/// Ensure a fenced block of lines is present in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInFile {
    file: PathBuf,
    lines: Vec<String>,
    prefix: String,
    suffix: String,
    position: Position,
}

impl BlockInFile {
    pub fn new(
        file: impl Into<PathBuf>,
        lines: Vec<String>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        position: Position,
    ) -> Self {
        Self {
            file: file.into(),
            lines,
            prefix: prefix.into(),
            suffix: suffix.into(),
            position,
        }
    }

    fn block(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.prefix.clone())
            .chain(self.lines.iter().cloned())
            .chain(std::iter::once(self.suffix.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Prefix,
    Inner,
    Suffix,
    Other,
}

impl Helper for BlockInFile {
    fn description(&self) -> String {
        let position = match self.position {
            Position::Top => "top of ",
            Position::End => "end of ",
            Position::Any => "",
        };
        format!(
            "Add {} lines to {position}{}: {:?}...{:?}",
            self.lines.len() + 2,
            self.file.display(),
            self.prefix,
            self.suffix
        )
    }

    fn is_done(&self) -> Result<bool> {
        let Some(lines) = TextFile::read(&self.file)?.lines else {
            return Ok(false);
        };

        let mut count = 0;
        let mut expect: Option<VecDeque<&str>> = None;
        let mut last = Scan::Other;
        for (index, line) in lines.iter().enumerate() {
            if index == 0 && self.position == Position::Top && *line != self.prefix {
                return Ok(false);
            }

            if let Some(queue) = expect.as_mut() {
                if queue.pop_front() != Some(line.as_str()) {
                    return Ok(false);
                }

                if queue.is_empty() {
                    last = Scan::Suffix;
                    count += 1;
                    expect = None;
                } else {
                    last = Scan::Inner;
                }
            } else if *line == self.prefix {
                let mut queue = self.lines.iter().map(String::as_str).collect::<VecDeque<_>>();
                queue.push_back(self.suffix.as_str());
                expect = Some(queue);
                last = Scan::Prefix;
            } else {
                last = Scan::Other;
            }
        }

        if self.position == Position::End && last != Scan::Suffix {
            return Ok(false);
        }

        Ok(count == 1)
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        if let Some(failed) = missing_parent(&self.file) {
            return Ok(failed);
        }

        let text = TextFile::read(&self.file)?;
        let mut out = Vec::new();
        let mut found = false;
        let mut find_suffix = false;

        if self.position == Position::Top {
            out.extend(self.block());
            found = true;
        }

        for line in text.lines.iter().flatten() {
            if find_suffix {
                // INVARIANT: Discard old block contents until suffix shows up.
                if *line != self.suffix {
                    continue;
                }

                if self.position == Position::Any && !found {
                    out.extend(self.block());
                    found = true;
                }
                find_suffix = false;
                continue;
            }

            if *line == self.prefix {
                find_suffix = true;
                continue;
            }

            out.push(line.clone());
        }

        if find_suffix {
            return Ok(Outcome::Failed(format!(
                "found prefix {:?} but not suffix {:?} in {}",
                self.prefix,
                self.suffix,
                self.file.display()
            )));
        }

        if !found {
            out.extend(self.block());
        }

        text.write(&self.file, &out)?;
        Ok(Outcome::Applied(vec![self.file.clone()]))
    }

    fn paths_ownable(&self) -> BTreeMap<PathBuf, PathKind> {
        BTreeMap::from([(self.file.clone(), PathKind::FilePart)])
    }

    fn affects_path(&self, path: &Path) -> bool {
        path == self.file
    }

    fn cleaner(&self) -> Option<Box<dyn Cleaner>> {
        Some(Box::new(CleanBlockInFile {
            file: self.file.clone(),
            prefix: self.prefix.clone(),
            suffix: self.suffix.clone(),
        }))
    }
}

/// Remove every fenced block from a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanBlockInFile {
    file: PathBuf,
    prefix: String,
    suffix: String,
}

impl Persisted for CleanBlockInFile {
    const TAG: &'static str = "clean_block_in_file";
}

impl Cleaner for CleanBlockInFile {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn params(&self) -> Value {
        json!(self)
    }

    fn description(&self) -> String {
        format!(
            "Remove lines from {}: {:?}...{:?}",
            self.file.display(),
            self.prefix,
            self.suffix
        )
    }

    fn is_needed(&self, _: &mut Runtime) -> Result<bool> {
        let Some(lines) = TextFile::read(&self.file)?.lines else {
            return Ok(false);
        };

        let mut have_prefix = false;
        for line in &lines {
            if *line == self.prefix {
                have_prefix = true;
            } else if *line == self.suffix && have_prefix {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn wants_path(&self, path: &Path) -> bool {
        file_needs(&self.file, path)
    }

    fn make_changes(&self, _: &mut Runtime) -> Result<Outcome> {
        let text = TextFile::read(&self.file)?;
        let Some(lines) = &text.lines else {
            return Ok(Outcome::NotNeeded);
        };

        let mut out = Vec::new();
        let mut changed = false;
        let mut find_suffix = false;
        for line in lines {
            if find_suffix {
                if *line == self.suffix {
                    find_suffix = false;
                    changed = true;
                }
            } else if *line == self.prefix {
                find_suffix = true;
            } else {
                out.push(line.clone());
            }
        }

        // INVARIANT: Leave file alone if a block is left unterminated.
        if find_suffix || !changed {
            return Ok(Outcome::NotNeeded);
        }

        text.write(&self.file, &out)?;
        Ok(Outcome::Applied(vec![self.file.clone()]))
    }
}

fn missing_parent(file: &Path) -> Option<Outcome> {
    let parent = file.parent()?;
    (!parent.is_dir()).then(|| {
        Outcome::Failed(format!(
            "cannot write {}: directory {} does not exist",
            file.display(),
            parent.display()
        ))
    })
}

/// Lines of a text file along with its newline style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextFile {
    /// Lines without their terminators, `None` if the file does not exist.
    pub(crate) lines: Option<Vec<String>>,
    pub(crate) newline: &'static str,
}

impl TextFile {
    pub(crate) fn read(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                lines: None,
                newline: "\n",
            }),
            Err(source) => Err(HelperError::Io {
                source,
                path: path.into(),
            }),
        }
    }

    pub(crate) fn parse(content: &str) -> Self {
        let mut lines = Vec::new();
        let mut newline = None;
        let mut current = String::new();
        let mut chars = content.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\r' => {
                    let style = if chars.peek() == Some(&'\n') {
                        chars.next();
                        "\r\n"
                    } else {
                        "\r"
                    };
                    newline.get_or_insert(style);
                    lines.push(std::mem::take(&mut current));
                }
                '\n' => {
                    newline.get_or_insert("\n");
                    lines.push(std::mem::take(&mut current));
                }
                ch => current.push(ch),
            }
        }

        if !current.is_empty() {
            lines.push(current);
        }

        Self {
            lines: Some(lines),
            newline: newline.unwrap_or("\n"),
        }
    }

    /// Replace file at path with lines, keeping newline style and permissions.
    pub(crate) fn write(&self, path: &Path, lines: &[String]) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(HelperError::io(parent))?;
        for line in lines {
            tmp.write_all(line.as_bytes())
                .and_then(|_| tmp.write_all(self.newline.as_bytes()))
                .map_err(HelperError::io(path))?;
        }
        tmp.flush().map_err(HelperError::io(path))?;

        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(tmp.path(), meta.permissions()).map_err(HelperError::io(path))?;
        }

        debug!("replace contents of {}", path.display());
        tmp.persist(path).map_err(|error| HelperError::Io {
            source: error.error,
            path: path.into(),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::facts::FactStore;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn runtime(dir: &Path) -> Runtime {
        Runtime::new(FactStore::open(dir.join("facts")))
    }

    fn apply(helper: &dyn Helper, rt: &mut Runtime) -> anyhow::Result<()> {
        if !helper.is_done()? {
            helper.make_changes(rt)?;
        }
        Ok(())
    }

    #[test_case(""; "empty")]
    #[test_case("something\n"; "trailing newline")]
    #[test_case("a\rb"; "carriage return")]
    #[test_case("   \t"; "whitespace only")]
    #[test_case(" padded"; "leading whitespace")]
    #[test]
    fn line_in_file_rejects_bad_content(line: &str) {
        assert!(matches!(
            LineInFile::new("/tmp/f", line, Position::Any),
            Err(HelperError::InvalidLine { .. })
        ));
    }

    #[test_case("AAA\nBBB\n", "CCC", Position::Any, "AAA\nBBB\nCCC\n"; "append at end")]
    #[test_case("AAA\nBBB\nCCC\n", "BBB", Position::Any, "AAA\nBBB\nCCC\n"; "leave existing line")]
    #[test_case("AAA\nBBB\nCCC\n", "BBB", Position::Top, "BBB\nAAA\nCCC\n"; "move to top")]
    #[test_case("BBB\nAAA\nCCC\n", "BBB", Position::End, "AAA\nCCC\nBBB\n"; "move to end")]
    #[test_case("\n\n", "AAA", Position::Any, "\n\nAAA\n"; "keep empty lines at end")]
    #[test_case("\n\n", "AAA", Position::Top, "AAA\n\n\n"; "keep empty lines at top")]
    #[test_case("\n\nAAA\n\n\n", "AAA", Position::Any, "\n\nAAA\n\n\n"; "keep middle")]
    #[test_case("AAA\r\nBBB\r\n", "CCC", Position::Any, "AAA\r\nBBB\r\nCCC\r\n"; "windows newlines")]
    #[test_case("AAA\rBBB\r", "BBB", Position::Top, "BBB\rAAA\r"; "classic mac newlines")]
    #[test_case("", "AAA", Position::Any, "AAA\n"; "empty file")]
    #[test]
    fn line_in_file_edits(start: &str, line: &str, position: Position, expect: &str) -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f1");
        fs::write(&file, start)?;
        let mut rt = runtime(tmp.path());

        apply(&LineInFile::new(&file, line, position)?, &mut rt)?;
        pretty_assertions::assert_eq!(fs::read_to_string(&file)?, expect);

        Ok(())
    }

    #[test]
    fn line_in_file_reports_missing_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let helper = LineInFile::new(tmp.path().join("nope/f1"), "AAA", Position::Any)?;
        let outcome = helper.make_changes(&mut runtime(tmp.path()))?;
        assert!(matches!(outcome, Outcome::Failed(_)));
        Ok(())
    }

    #[test]
    fn clean_line_removes_every_copy_regardless_of_position() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f1");
        fs::write(&file, "AAA\nDDD\nCCC\nBBB\nDDD\n")?;
        let mut rt = runtime(tmp.path());

        let cleaner = CleanLineInFile {
            file: file.clone(),
            line: "DDD".into(),
        };
        assert!(cleaner.is_needed(&mut rt)?);
        assert_eq!(cleaner.make_changes(&mut rt)?, Outcome::Applied(vec![file.clone()]));
        assert_eq!(fs::read_to_string(&file)?, "AAA\nCCC\nBBB\n");
        assert!(!cleaner.is_needed(&mut rt)?);
        assert_eq!(cleaner.make_changes(&mut rt)?, Outcome::NotNeeded);

        Ok(())
    }

    #[test]
    fn block_in_file_replaces_stale_block_in_place() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f1");
        fs::write(&file, "AAA\n# BEGIN\nold\n# END\nZZZ\n")?;
        let mut rt = runtime(tmp.path());

        let helper = BlockInFile::new(
            &file,
            vec!["new1".into(), "new2".into()],
            "# BEGIN",
            "# END",
            Position::Any,
        );
        assert!(!helper.is_done()?);
        apply(&helper, &mut rt)?;
        assert_eq!(
            fs::read_to_string(&file)?,
            "AAA\n# BEGIN\nnew1\nnew2\n# END\nZZZ\n"
        );
        assert!(helper.is_done()?);

        let cleaner = helper.cleaner().ok_or_else(|| anyhow::anyhow!("no cleaner"))?;
        assert!(cleaner.is_needed(&mut rt)?);
        cleaner.make_changes(&mut rt)?;
        assert_eq!(fs::read_to_string(&file)?, "AAA\nZZZ\n");

        Ok(())
    }

    #[test]
    fn block_in_file_honors_position() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f1");
        fs::write(&file, "PRE\nAAA\nPOST\nBBB\n")?;
        let mut rt = runtime(tmp.path());

        let at_end = BlockInFile::new(&file, vec!["AAA".into()], "PRE", "POST", Position::End);
        assert!(!at_end.is_done()?);
        apply(&at_end, &mut rt)?;
        assert_eq!(fs::read_to_string(&file)?, "BBB\nPRE\nAAA\nPOST\n");

        let at_top = BlockInFile::new(&file, vec!["AAA".into()], "PRE", "POST", Position::Top);
        assert!(!at_top.is_done()?);
        apply(&at_top, &mut rt)?;
        assert_eq!(fs::read_to_string(&file)?, "PRE\nAAA\nPOST\nBBB\n");
        assert!(at_top.is_done()?);

        Ok(())
    }

    #[test]
    fn block_in_file_fails_on_unterminated_block() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("f1");
        fs::write(&file, "PRE\nAAA\n")?;

        let helper = BlockInFile::new(&file, vec!["AAA".into()], "PRE", "POST", Position::Any);
        let outcome = helper.make_changes(&mut runtime(tmp.path()))?;
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(fs::read_to_string(&file)?, "PRE\nAAA\n");

        Ok(())
    }
}
