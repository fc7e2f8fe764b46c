//! Include/exclude filtering of file names during tree copies

use glob::Pattern;

use crate::error::FsError;

fn compile(patterns: &[&str]) -> Result<Vec<Pattern>, FsError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| FsError::InvalidArgument(format!("bad filter pattern '{}': {}", p, e)))
        })
        .collect()
}

/// Decides which files a tree transfer copies.
///
/// Patterns match the file name only. A file passes when it matches any
/// include pattern (or no include patterns are set) and matches no exclude
/// pattern; exclude wins when both match.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FileFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, FsError> {
        Self::default()
            .include(include.as_slice())?
            .exclude(exclude.as_slice())
    }

    /// Accept everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn include(mut self, patterns: &[&str]) -> Result<Self, FsError> {
        self.include.extend(compile(patterns)?);
        Ok(self)
    }

    pub fn exclude(mut self, patterns: &[&str]) -> Result<Self, FsError> {
        self.exclude.extend(compile(patterns)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(name))
    }
}
