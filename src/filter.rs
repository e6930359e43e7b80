use std::{fs, path::Path};

use anyhow::{Context, Result};
use regex::Regex;

const BUILTIN_IGNORES: &[&str] = &[r".*\.com-apple-bird.*", r".*\.DS_Store"];

/// Per-path include/ignore decisions, compiled once at startup.
///
/// Ignore patterns always win. With an empty include list every
/// non-ignored path is accepted; otherwise a path must match at least
/// one include pattern. All patterns match anchored at the start of the
/// slash-separated relative path.
pub struct PathFilter {
    ignore: Vec<Regex>,
    include: Vec<Regex>,
}

impl PathFilter {
    pub fn new(ignore_patterns: &[String], include_patterns: &[String]) -> Result<Self> {
        let mut ignore = Vec::with_capacity(BUILTIN_IGNORES.len() + ignore_patterns.len());
        for pattern in BUILTIN_IGNORES {
            ignore.push(compile_anchored(pattern)?);
        }
        for pattern in ignore_patterns {
            ignore.push(compile_anchored(pattern)?);
        }

        let include = include_patterns
            .iter()
            .map(|pattern| compile_anchored(pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { ignore, include })
    }

    pub fn accept(&self, rel_path: &str) -> bool {
        if self.ignore.iter().any(|re| re.is_match(rel_path)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(rel_path))
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})"))
        .with_context(|| format!("invalid path pattern {pattern:?}"))
}

/// Reads a pattern list file: one regex per line, `#` starts a comment,
/// blank lines are skipped.
pub fn load_patterns(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read pattern file {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
