use crate::errors::{Error, Result};
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;

/// What to look for in each textual cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub term: String,
    /// When `true`, `term` is a regex.
    #[serde(default, rename = "regex")]
    pub is_pattern: bool,
}

/// What to put in place of each match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceSpec {
    pub term: String,
    /// When `true`, `$1`/`${name}` in `term` expand to capture groups.
    #[serde(default, rename = "regex")]
    pub is_pattern: bool,
}

impl SearchSpec {
    pub fn new(term: impl Into<String>, is_pattern: bool) -> Self {
        Self {
            term: term.into(),
            is_pattern,
        }
    }
}

impl ReplaceSpec {
    pub fn new(term: impl Into<String>, is_pattern: bool) -> Self {
        Self {
            term: term.into(),
            is_pattern,
        }
    }
}

/// A strategy that rewrites one cell value.
///
/// Implementations must return `Cow::Borrowed` when nothing changed; that is
/// how an unchanged row is recognized and its write skipped.
pub trait Substitution: Send + Sync {
    fn apply<'a>(&self, input: &'a str) -> Cow<'a, str>;

    /// A short human-readable description, used in logs.
    fn describe(&self) -> String;
}

/// Plain substring replacement.
pub struct LiteralSubstitution {
    search: String,
    replace: String,
}

impl LiteralSubstitution {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Result<Self> {
        let search = search.into();
        if search.is_empty() {
            return Err(Error::Configuration("search term cannot be empty".to_string()));
        }
        Ok(Self {
            search,
            replace: replace.into(),
        })
    }
}

impl Substitution for LiteralSubstitution {
    fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if input.contains(self.search.as_str()) {
            Cow::Owned(input.replace(self.search.as_str(), &self.replace))
        } else {
            Cow::Borrowed(input)
        }
    }

    fn describe(&self) -> String {
        format!("{:?} -> {:?}", self.search, self.replace)
    }
}

/// Regex replacement over every match in the value.
pub struct PatternSubstitution {
    regex: Regex,
    replacement: String,
    expand: bool,
}

impl PatternSubstitution {
    /// Compiles `pattern`. With `expand` set, capture references in
    /// `replacement` are substituted; otherwise it is inserted verbatim.
    pub fn new(pattern: &str, replacement: impl Into<String>, expand: bool) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Configuration("search pattern cannot be empty".to_string()));
        }
        Ok(Self {
            regex: Regex::new(pattern)?,
            replacement: replacement.into(),
            expand,
        })
    }
}

impl Substitution for PatternSubstitution {
    fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if self.expand {
            self.regex.replace_all(input, self.replacement.as_str())
        } else {
            self.regex.replace_all(input, NoExpand(&self.replacement))
        }
    }

    fn describe(&self) -> String {
        format!("/{}/ -> {:?}", self.regex.as_str(), self.replacement)
    }
}

/// Builds the strategy for a search/replace pair.
///
/// A literal search always gets a literal replacement; the replace pattern
/// flag only matters for regex searches.
pub fn compile(search: &SearchSpec, replace: &ReplaceSpec) -> Result<Arc<dyn Substitution>> {
    if search.is_pattern {
        Ok(Arc::new(PatternSubstitution::new(
            &search.term,
            replace.term.clone(),
            replace.is_pattern,
        )?))
    } else {
        Ok(Arc::new(LiteralSubstitution::new(
            search.term.clone(),
            replace.term.clone(),
        )?))
    }
}
