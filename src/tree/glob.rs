//! Glob matching evaluated level by level against a walk
//!
//! Leading literal components narrow the start directory before anything is
//! listed. With fewer than two wildcard tokens the remaining components are
//! anchored at the start directory and non-matching directories are pruned.
//! With two or more tokens the pattern matches at any depth, as if it began
//! with `**`. `**` components are dropped before tokens are counted, so
//! `**/*.log` stays anchored.

use std::collections::VecDeque;

use glob::{MatchOptions, Pattern};

use super::walk::{Walk, WalkEntry, WalkOptions};
use crate::error::FsError;
use crate::fs::FileSystem;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Component {
    Literal(String),
    Wildcard(Pattern),
}

impl Component {
    fn matches(&self, name: &str) -> bool {
        match self {
            Component::Literal(literal) => literal == name,
            Component::Wildcard(pattern) => pattern.matches_with(name, MATCH_OPTIONS),
        }
    }
}

/// Count `*` runs, `?` and `[...]` classes in one component
fn count_tokens(component: &str) -> usize {
    let chars: Vec<char> = component.chars().collect();
    let mut tokens = 0;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                tokens += 1;
                while i + 1 < chars.len() && chars[i + 1] == '*' {
                    i += 1;
                }
            }
            '?' => tokens += 1,
            '[' => {
                if let Some(close) = chars[i + 1..].iter().skip(1).position(|c| *c == ']') {
                    tokens += 1;
                    i += close + 2;
                }
            }
            _ => {}
        }
        i += 1;
    }
    tokens
}

/// Within one component a run of `*` means the same as a single `*`
fn collapse_stars(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        if !(c == '*' && out.ends_with('*')) {
            out.push(c);
        }
    }
    out
}

/// A parsed, immutable glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    prefix: Vec<String>,
    components: Vec<Component>,
    tokens: usize,
}

impl GlobPattern {
    pub fn parse(pattern: &str) -> Result<Self, FsError> {
        if pattern.is_empty() {
            return Err(FsError::InvalidArgument("Unacceptable pattern: ''".into()));
        }
        if pattern.starts_with('/') {
            return Err(FsError::InvalidArgument(format!(
                "Non-relative patterns are unsupported: {}",
                pattern
            )));
        }

        let parts: Vec<&str> = pattern
            .split('/')
            .filter(|p| !p.is_empty() && *p != "." && *p != "**")
            .collect();
        if parts.is_empty() {
            return Err(FsError::InvalidArgument(format!(
                "Pattern names no entries: {}",
                pattern
            )));
        }

        let tokens = parts.iter().map(|p| count_tokens(p)).sum();

        let literal_prefix = parts
            .iter()
            .take(parts.len() - 1)
            .take_while(|p| count_tokens(p) == 0)
            .count();
        let prefix = parts[..literal_prefix]
            .iter()
            .map(|p| p.to_string())
            .collect();

        let components = parts[literal_prefix..]
            .iter()
            .map(|p| {
                if count_tokens(p) == 0 {
                    Ok(Component::Literal(p.to_string()))
                } else {
                    Pattern::new(&collapse_stars(p))
                        .map(Component::Wildcard)
                        .map_err(|e| FsError::InvalidArgument(format!("{}: {}", pattern, e)))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: pattern.to_string(),
            prefix,
            components,
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Two or more wildcard tokens make the pattern match at any depth
    pub fn is_recursive(&self) -> bool {
        self.tokens >= 2
    }

    pub fn wildcard_tokens(&self) -> usize {
        self.tokens
    }

    /// Start directory after consuming the literal prefix
    pub fn start_dir(&self, fs: &dyn FileSystem, base: &str) -> String {
        self.prefix
            .iter()
            .fold(base.to_string(), |dir, part| fs.join(&dir, part))
    }

    /// Does a `/` separated path relative to the start directory match?
    pub fn matches_relative(&self, relative: &str) -> bool {
        let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
        let n = self.components.len();
        if self.is_recursive() {
            parts.len() >= n
                && self
                    .components
                    .iter()
                    .zip(&parts[parts.len() - n..])
                    .all(|(c, p)| c.matches(p))
        } else {
            parts.len() == n && self.components.iter().zip(&parts).all(|(c, p)| c.matches(p))
        }
    }
}

/// Lazy sequence of paths matching a [`GlobPattern`]
pub struct Glob<'a> {
    fs: &'a dyn FileSystem,
    pattern: GlobPattern,
    walk: Walk<'a>,
    ready: VecDeque<String>,
    narrowed: bool,
}

impl<'a> Glob<'a> {
    pub fn new(fs: &'a dyn FileSystem, base: &str, pattern: GlobPattern) -> Self {
        let start = pattern.start_dir(fs, base);
        let narrowed = !pattern.prefix.is_empty();
        Self {
            fs,
            walk: Walk::new(fs, &start, WalkOptions::default()),
            pattern,
            ready: VecDeque::new(),
            narrowed,
        }
    }

    fn collect(&mut self, entry: &WalkEntry) {
        let last = self.pattern.components.len() - 1;

        if self.pattern.is_recursive() {
            for name in entry.dirs.iter().chain(&entry.files) {
                if self.pattern.matches_relative(&entry.relative_child(name)) {
                    self.ready.push_back(self.fs.join(&entry.root, name));
                }
            }
            return;
        }

        let component = &self.pattern.components[entry.depth.min(last)];
        if entry.depth == last {
            for name in entry.dirs.iter().chain(&entry.files) {
                if component.matches(name) {
                    self.ready.push_back(self.fs.join(&entry.root, name));
                }
            }
            self.walk.skip_subdirs();
        } else {
            let component = component.clone();
            self.walk.retain_subdirs(|d| component.matches(d));
        }
    }
}

impl Iterator for Glob<'_> {
    type Item = Result<String, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Some(Ok(path));
            }
            match self.walk.next()? {
                Ok(entry) => self.collect(&entry),
                // A narrowed start directory that does not exist simply has no matches
                Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) if self.narrowed => {
                    return None
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Glob `pattern` below `base` on `fs`
pub fn glob<'a>(fs: &'a dyn FileSystem, base: &str, pattern: &str) -> Result<Glob<'a>, FsError> {
    Ok(Glob::new(fs, base, GlobPattern::parse(pattern)?))
}
