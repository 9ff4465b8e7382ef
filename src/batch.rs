//! Per-item outcome tracking for batch runs.
//!
//! A failing item is recorded with its key and logged; siblings keep going.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub key: String,
    pub error: String,
}

/// Successful items of a batch plus the keys that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub items: Vec<T>,
    pub failures: Vec<ItemFailure>,
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> Outcome<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn fail(&mut self, key: impl Display, error: impl Display) {
        let failure = ItemFailure {
            key: key.to_string(),
            error: error.to_string(),
        };
        tracing::error!(key = %failure.key, error = %failure.error, "batch item failed");
        self.failures.push(failure);
    }

    /// Keep the value on success, record the failure under `key` otherwise.
    pub fn record(&mut self, key: impl Display, result: Result<T>) {
        match result {
            Ok(item) => self.push(item),
            Err(err) => self.fail(key, err),
        }
    }

    pub fn extend(&mut self, other: Outcome<T>) {
        self.items.extend(other.items);
        self.failures.extend(other.failures);
    }

    #[cfg(test)]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Summary of one scheduled job across every question it touched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub job: &'static str,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Questions processed without a question-level failure.
    pub succeeded: usize,
    /// Questions skipped because another run held the lease.
    pub skipped: usize,
    /// Rows written or flags raised.
    pub produced: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn new(job: &'static str, started_at: DateTime<Utc>) -> Self {
        Self {
            job,
            run_id: Uuid::new_v4(),
            started_at,
            succeeded: 0,
            skipped: 0,
            produced: 0,
            failures: Vec::new(),
        }
    }

    /// Fold one question's outcome into the report.
    pub fn absorb<T>(&mut self, outcome: Outcome<T>) {
        self.succeeded += 1;
        self.produced += outcome.items.len();
        self.failures.extend(outcome.failures);
    }

    pub fn fail(&mut self, key: impl Display, error: impl Display) {
        let failure = ItemFailure {
            key: key.to_string(),
            error: error.to_string(),
        };
        tracing::error!(
            job = self.job,
            run_id = %self.run_id,
            key = %failure.key,
            error = %failure.error,
            "job step failed"
        );
        self.failures.push(failure);
    }

    pub fn error_count(&self) -> usize {
        self.failures.len()
    }
}
