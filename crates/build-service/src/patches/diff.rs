//! Unified diff parsing and application
//!
//! Applies quilt style patches with one leading path component stripped
//! (`patch -p1`). Hunks must match their context exactly; a hunk that does
//! not match at its stated line is searched for at increasing offsets, as
//! `patch(1)` does without fuzz.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Reason a patch could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Malformed or unsupported diff
    Parse(String),
    /// The patch does not apply to the tree
    Mismatch(String),
    /// Every hunk is already present in the tree
    AlreadyApplied,
    Io(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Parse(reason) => write!(f, "malformed patch: {}", reason),
            ApplyError::Mismatch(reason) => f.write_str(reason),
            ApplyError::AlreadyApplied => f.write_str("patch is already applied"),
            ApplyError::Io(reason) => write!(f, "I/O error: {}", reason),
        }
    }
}

impl From<std::io::Error> for ApplyError {
    fn from(err: std::io::Error) -> Self {
        ApplyError::Io(err.to_string())
    }
}

/// Lines of `data` without their `\n`. A `\r` before it is kept.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    if data.is_empty() || data.ends_with(b"\n") {
        lines.pop();
    }
    lines
}

/// Header line as text, without a trailing `\r`
fn header_text(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Context(Vec<u8>),
    Remove(Vec<u8>),
    Add(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    new_start: usize,
    lines: Vec<Line>,
    /// Last line of the old side has no trailing newline
    old_no_eol: bool,
    new_no_eol: bool,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&[u8]> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Context(s) | Line::Remove(s) => Some(s.as_slice()),
                Line::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<&[u8]> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Context(s) | Line::Add(s) => Some(s.as_slice()),
                Line::Remove(_) => None,
            })
            .collect()
    }
}

/// Changes to one file
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileDiff {
    /// `None` when the file is created
    old: Option<PathBuf>,
    /// `None` when the file is deleted
    new: Option<PathBuf>,
    hunks: Vec<Hunk>,
}

/// Parsed unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    files: Vec<FileDiff>,
}

/// Strip the first path component of a diff header path
fn strip_path(raw: &str) -> Result<Option<PathBuf>, ApplyError> {
    let raw = raw.split('\t').next().unwrap_or_default().trim_end();
    if raw == "/dev/null" {
        return Ok(None);
    }
    let stripped = raw
        .split_once('/')
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| ApplyError::Parse(format!("cannot strip path '{}'", raw)))?;
    let path = PathBuf::from(stripped);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ApplyError::Parse(format!("unsafe path '{}'", raw)));
    }
    Ok(Some(path))
}

/// Parse `@@ -a[,b] +c[,d] @@`
fn parse_range(header: &str) -> Result<(usize, usize, usize, usize), ApplyError> {
    let invalid = || ApplyError::Parse(format!("invalid hunk header '{}'", header));
    let body = header
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(invalid)?;
    let (old, new) = body.split_once(' ').ok_or_else(invalid)?;

    let side = |range: &str, sign: char| -> Result<(usize, usize), ApplyError> {
        let range = range.strip_prefix(sign).ok_or_else(invalid)?;
        let (start, len) = match range.split_once(',') {
            Some((start, len)) => (start, len),
            None => (range, "1"),
        };
        Ok((
            start.parse().map_err(|_| invalid())?,
            len.parse().map_err(|_| invalid())?,
        ))
    };

    let (old_start, old_len) = side(old, '-')?;
    let (new_start, new_len) = side(new, '+')?;
    Ok((old_start, old_len, new_start, new_len))
}

impl Diff {
    /// Parse a patch. File contents are compared as bytes, so neither the
    /// patch nor the patched files have to be UTF-8.
    pub fn parse(data: &[u8]) -> Result<Self, ApplyError> {
        let lines = split_lines(data);
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if line.starts_with(b"GIT binary patch") || line.starts_with(b"Binary files ") {
                return Err(ApplyError::Parse("binary patches are not supported".to_string()));
            }
            let Some(old) = line.strip_prefix(b"--- ") else {
                i += 1;
                continue;
            };
            let new = lines
                .get(i + 1)
                .and_then(|l| l.strip_prefix(b"+++ "))
                .ok_or_else(|| {
                    ApplyError::Parse(format!("missing +++ line after '{}'", header_text(line)))
                })?;
            let mut file = FileDiff {
                old: strip_path(&header_text(old))?,
                new: strip_path(&header_text(new))?,
                hunks: Vec::new(),
            };
            if file.old.is_none() && file.new.is_none() {
                return Err(ApplyError::Parse("both sides are /dev/null".to_string()));
            }
            i += 2;

            while i < lines.len() && lines[i].starts_with(b"@@ ") {
                let (old_start, mut old_left, new_start, mut new_left) =
                    parse_range(&header_text(lines[i]))?;
                let mut hunk = Hunk {
                    old_start,
                    new_start,
                    lines: Vec::new(),
                    old_no_eol: false,
                    new_no_eol: false,
                };
                i += 1;

                while old_left > 0 || new_left > 0 {
                    let line = *lines.get(i).ok_or_else(|| {
                        ApplyError::Parse(format!("truncated hunk at line {}", old_start))
                    })?;
                    // some editors strip the single space of empty context lines
                    let (kind, content) = match line.first() {
                        None | Some(b'\r') => (b' ', line),
                        Some(&kind) => (kind, &line[1..]),
                    };
                    match kind {
                        b' ' if old_left > 0 && new_left > 0 => {
                            hunk.lines.push(Line::Context(content.to_vec()));
                            old_left -= 1;
                            new_left -= 1;
                        }
                        b'-' if old_left > 0 => {
                            hunk.lines.push(Line::Remove(content.to_vec()));
                            old_left -= 1;
                        }
                        b'+' if new_left > 0 => {
                            hunk.lines.push(Line::Add(content.to_vec()));
                            new_left -= 1;
                        }
                        b'\\' => {}
                        _ => {
                            return Err(ApplyError::Parse(format!(
                                "unexpected line in hunk: '{}'",
                                header_text(line)
                            )))
                        }
                    }
                    i += 1;
                    if lines.get(i).is_some_and(|l| l.starts_with(b"\\")) {
                        match hunk.lines.last() {
                            Some(Line::Context(_)) => {
                                hunk.old_no_eol = true;
                                hunk.new_no_eol = true;
                            }
                            Some(Line::Remove(_)) => hunk.old_no_eol = true,
                            Some(Line::Add(_)) => hunk.new_no_eol = true,
                            None => {}
                        }
                        i += 1;
                    }
                }
                file.hunks.push(hunk);
            }

            if file.hunks.is_empty() && file.old.is_some() && file.new.is_some() {
                return Err(ApplyError::Parse(format!(
                    "no hunk for {}",
                    file.new.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
                )));
            }
            files.push(file);
        }

        if files.is_empty() {
            return Err(ApplyError::Parse("no file changes found".to_string()));
        }
        Ok(Self { files })
    }

    /// Apply to the tree rooted at `root`
    pub fn apply(&self, root: &Path) -> Result<(), ApplyError> {
        // every file is checked first so that nothing is touched on mismatch
        match self.stage(root, Direction::Forward) {
            Ok(staged) => staged.commit(),
            Err(ApplyError::Mismatch(reason)) => {
                Err(if self.stage(root, Direction::Reverse).is_ok() {
                    ApplyError::AlreadyApplied
                } else {
                    ApplyError::Mismatch(reason)
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Result of every section, each one applied on top of the previous ones
    fn stage<'a>(&self, root: &'a Path, direction: Direction) -> Result<Staged<'a>, ApplyError> {
        let mut staged = Staged::new(root);
        let sections: Vec<&FileDiff> = match direction {
            Direction::Forward => self.files.iter().collect(),
            Direction::Reverse => self.files.iter().rev().collect(),
        };
        for file in sections {
            plan(&mut staged, file, direction)?;
        }
        Ok(staged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// File content split in lines
#[derive(Debug, Clone, PartialEq, Eq)]
struct Content {
    lines: Vec<Vec<u8>>,
    eol: bool,
}

impl Content {
    fn from_bytes(data: &[u8]) -> Self {
        Self {
            lines: split_lines(data).into_iter().map(<[u8]>::to_vec).collect(),
            eol: data.is_empty() || data.ends_with(b"\n"),
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut data = self.lines.join(&b'\n');
        if self.eol && !self.lines.is_empty() {
            data.push(b'\n');
        }
        data
    }
}

/// Pending state of the files touched by a diff. `None` marks a deletion.
struct Staged<'a> {
    root: &'a Path,
    files: BTreeMap<PathBuf, Option<Content>>,
}

impl<'a> Staged<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            files: BTreeMap::new(),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        match self.files.get(path) {
            Some(content) => content.is_some(),
            None => self.root.join(path).exists(),
        }
    }

    fn read(&self, path: &Path) -> Result<Content, ApplyError> {
        if let Some(staged) = self.files.get(path) {
            return staged
                .clone()
                .ok_or_else(|| ApplyError::Mismatch(format!("{} does not exist", path.display())));
        }
        let full = self.root.join(path);
        if !full.is_file() {
            return Err(ApplyError::Mismatch(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(Content::from_bytes(&fs::read(full)?))
    }

    fn commit(self) -> Result<(), ApplyError> {
        for (path, content) in &self.files {
            let target = self.root.join(path);
            if content.is_none() && target.is_file() {
                fs::remove_file(&target)?;
            }
        }
        for (path, content) in self.files {
            if let Some(content) = content {
                let target = self.root.join(&path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, content.render())?;
            }
        }
        Ok(())
    }
}

/// Apply `file` on top of `staged` without touching the tree
fn plan(staged: &mut Staged<'_>, file: &FileDiff, direction: Direction) -> Result<(), ApplyError> {
    let (from, to) = match direction {
        Direction::Forward => (&file.old, &file.new),
        Direction::Reverse => (&file.new, &file.old),
    };

    let mut content = match (from, to) {
        (Some(path), _) => staged.read(path)?,
        (None, Some(path)) => {
            if staged.exists(path) {
                return Err(ApplyError::Mismatch(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            Content::from_bytes(b"")
        }
        (None, None) => return Err(ApplyError::Parse("both sides are /dev/null".to_string())),
    };

    let mut floor = 0usize;
    let mut shift: isize = 0;
    for (n, hunk) in file.hunks.iter().enumerate() {
        let (old, new, old_no_eol, new_no_eol, start) = match direction {
            Direction::Forward => (
                hunk.old_lines(),
                hunk.new_lines(),
                hunk.old_no_eol,
                hunk.new_no_eol,
                hunk.old_start,
            ),
            Direction::Reverse => (
                hunk.new_lines(),
                hunk.old_lines(),
                hunk.new_no_eol,
                hunk.old_no_eol,
                hunk.new_start,
            ),
        };

        // an empty old side is anchored after line `start`
        let stated = if old.is_empty() {
            start
        } else {
            start.saturating_sub(1)
        };
        let expected = (stated as isize + shift).max(0) as usize;
        let pos = locate(&content.lines, &old, expected, floor).ok_or_else(|| {
            ApplyError::Mismatch(format!("hunk #{} does not match at line {}", n + 1, start))
        })?;

        let reaches_end = pos + old.len() == content.lines.len();
        if old_no_eol && (!reaches_end || content.eol) {
            return Err(ApplyError::Mismatch(format!(
                "hunk #{} expects no newline at end of file",
                n + 1
            )));
        }

        content
            .lines
            .splice(pos..pos + old.len(), new.iter().map(|s| s.to_vec()));
        if reaches_end {
            if new_no_eol {
                content.eol = false;
            } else if old_no_eol || content.lines.len() == new.len() {
                content.eol = true;
            }
        }

        floor = pos + new.len();
        shift += new.len() as isize - old.len() as isize + (pos as isize - expected as isize);
    }

    match (from, to) {
        (_, Some(to)) => {
            if let Some(from) = from.as_ref().filter(|from| *from != to) {
                staged.files.insert(from.clone(), None);
            }
            staged.files.insert(to.clone(), Some(content));
        }
        (Some(from), None) => {
            if !content.lines.is_empty() {
                return Err(ApplyError::Mismatch(format!(
                    "{} is not empty after removal",
                    from.display()
                )));
            }
            staged.files.insert(from.clone(), None);
        }
        (None, None) => return Err(ApplyError::Parse("both sides are /dev/null".to_string())),
    }
    Ok(())
}

/// Position of `needle` in `haystack` nearest to `expected`, not before `floor`
fn locate(haystack: &[Vec<u8>], needle: &[&[u8]], expected: usize, floor: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let last = haystack.len() - needle.len();
    let matches = |pos: usize| {
        pos >= floor
            && pos <= last
            && haystack[pos..pos + needle.len()]
                .iter()
                .zip(needle)
                .all(|(a, b)| a.as_slice() == *b)
    };

    let expected = expected.min(last);
    for offset in 0..=haystack.len() {
        if matches(expected + offset) {
            return Some(expected + offset);
        }
        if offset > 0 && offset <= expected && matches(expected - offset) {
            return Some(expected - offset);
        }
        if expected + offset > last && offset > expected {
            break;
        }
    }
    None
}
