//! Table selection: include-all, include and exclude rules resolved into one ordered list.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Which tables a run should touch.
///
/// Resolution is `(include_all ? all_tables : []) ++ included`, deduplicated
/// keeping the first occurrence, minus every excluded name. Exclusion always
/// wins, no matter how or when a name was included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSelection {
    include_all: bool,
    included: Vec<String>,
    excluded: BTreeSet<String>,
}

impl TableSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_all(&self) -> bool {
        self.include_all
    }

    pub fn set_include_all(&mut self, flag: bool) {
        self.include_all = flag;
    }

    /// Explicitly included tables, in first-seen order.
    pub fn included(&self) -> &[String] {
        &self.included
    }

    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.excluded
    }

    /// Adds names to the include list, or replaces it when `overwrite` is set.
    pub fn include<I, S>(&mut self, names: I, overwrite: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if overwrite {
            self.included.clear();
        }
        for name in names {
            let name = name.into();
            if !self.included.contains(&name) {
                self.included.push(name);
            }
        }
    }

    /// Adds names to the exclude set, or replaces it when `overwrite` is set.
    pub fn exclude<I, S>(&mut self, names: I, overwrite: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if overwrite {
            self.excluded.clear();
        }
        self.excluded.extend(names.into_iter().map(Into::into));
    }

    /// Clears the include and exclude lists. `include_all` is left as is.
    pub fn reset(&mut self) {
        self.included.clear();
        self.excluded.clear();
    }

    /// `true` when resolution could yield at least one table.
    pub fn has_candidates(&self) -> bool {
        self.include_all || !self.included.is_empty()
    }

    /// Resolves the selection against the backend's table list.
    ///
    /// `all_tables` is only consulted when `include_all` is set.
    pub fn resolve(&self, all_tables: &[String]) -> Vec<String> {
        let base: &[String] = if self.include_all { all_tables } else { &[] };

        let mut seen = HashSet::new();
        base.iter()
            .chain(self.included.iter())
            .filter(|name| !self.excluded.contains(name.as_str()))
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}
