//! Offset/limit pagination over tables and rows.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};

/// Rows requested from the gateway per round-trip unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// An offset with an optional limit. `limit = None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Range {
    pub fn new(offset: u64, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    /// Builds a range from signed input, rejecting negative values.
    pub fn from_signed(what: &str, offset: i64, limit: Option<i64>) -> Result<Self> {
        Ok(Self {
            offset: non_negative(&format!("{what} offset"), offset)?,
            limit: limit
                .map(|l| non_negative(&format!("{what} limit"), l))
                .transpose()?,
        })
    }

    /// The window of `items` this range selects.
    pub fn apply<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = usize::try_from(self.offset)
            .unwrap_or(usize::MAX)
            .min(items.len());
        let end = match self.limit {
            Some(limit) => start
                .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
                .min(items.len()),
            None => items.len(),
        };
        &items[start..end]
    }
}

/// Validates a signed count coming from configuration.
pub fn non_negative(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::Configuration(format!("{what} must not be negative (got {value})")))
}

/// Validates a batch size: a positive integer.
pub fn positive_batch_size(value: i64) -> Result<usize> {
    if value < 1 {
        return Err(Error::Configuration(format!(
            "batch size must be at least 1 (got {value})"
        )));
    }
    usize::try_from(value)
        .map_err(|_| Error::Configuration(format!("batch size {value} is too large")))
}

/// One bounded read request: `limit` rows starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    pub offset: u64,
    pub limit: u64,
}

/// Walks one table's row range in batches.
///
/// Each request asks for `min(batch_size, remaining)` rows. The plan ends when
/// a batch comes back short or the range limit is used up. A fresh plan is
/// made for every table, so the row range never carries over between tables.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    next_offset: u64,
    remaining: Option<u64>,
    batch_size: u64,
    consumed: u64,
    finished: bool,
}

impl BatchPlan {
    pub fn new(range: Range, batch_size: usize) -> Self {
        Self {
            next_offset: range.offset,
            remaining: range.limit,
            batch_size: (batch_size.max(1)) as u64,
            consumed: 0,
            finished: false,
        }
    }

    /// The next request to issue, or `None` once the range is done.
    pub fn next_request(&self) -> Option<BatchRequest> {
        if self.finished {
            return None;
        }
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };
        if limit == 0 {
            return None;
        }
        Some(BatchRequest {
            offset: self.next_offset,
            limit,
        })
    }

    /// Records that `received` rows came back for the current request.
    pub fn advance(&mut self, received: usize) {
        let Some(request) = self.next_request() else {
            return;
        };
        let received = (received as u64).min(request.limit);

        self.consumed += received;
        self.next_offset += received;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= received;
        }
        if received < request.limit {
            self.finished = true;
        }
    }

    /// Rows consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// The offset the next request would start at; the resume point after a failure.
    pub fn position(&self) -> u64 {
        self.next_offset
    }
}
