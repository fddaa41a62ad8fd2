//! Shared data pool for suite correlation.
//!
//! A pool is a set of named FIFO queues owned by one suite and shared
//! across its scenarios: a producer scenario pushes values extracted from
//! successful task results, a consumer scenario takes them in order. Taking
//! from an empty queue returns `None`; whether that is an error is the
//! consuming scenario's decision.
//!
//! Queues can also be seeded up front from a CSV column, for data-driven
//! suites that start from a prepared corpus.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while seeding a pool from CSV.
#[derive(Error, Debug)]
pub enum DataPoolError {
    #[error("Failed to read CSV file: {0}")]
    CsvReadError(#[from] csv::Error),

    #[error("Failed to open file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV file has no column named '{0}'")]
    MissingColumn(String),

    #[error("CSV file is empty or has no data rows")]
    EmptyData,
}

/// Named FIFO queues, cheap to clone and safe to share across scenarios.
#[derive(Clone, Default)]
pub struct DataPool {
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl DataPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to the named queue, creating it on first use.
    pub fn put(&self, key: &str, value: impl Into<String>) {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(key.to_string())
            .or_default()
            .push_back(value.into());
    }

    /// Take the oldest value from the named queue; `None` when empty or
    /// absent.
    pub fn take(&self, key: &str) -> Option<String> {
        let mut queues = self.queues.lock().unwrap();
        queues.get_mut(key).and_then(|queue| queue.pop_front())
    }

    /// Number of values currently queued under `key`.
    pub fn size(&self, key: &str) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(key).map(|queue| queue.len()).unwrap_or(0)
    }

    /// All keys with a queue (possibly empty after drains).
    pub fn keys(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap();
        let mut keys: Vec<String> = queues.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Seed the named queue from one column of a headered CSV file.
    /// Returns the number of values loaded.
    pub fn seed_from_csv(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        column: &str,
    ) -> Result<usize, DataPoolError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;

        let headers = reader.headers()?.clone();
        let column_idx = headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| DataPoolError::MissingColumn(column.to_string()))?;

        let mut loaded = 0;
        for record in reader.records() {
            let record = record?;
            if let Some(value) = record.get(column_idx) {
                self.put(key, value);
                loaded += 1;
            }
        }

        if loaded == 0 {
            return Err(DataPoolError::EmptyData);
        }

        info!(
            key = key,
            column = column,
            values = loaded,
            "Seeded data pool from CSV"
        );
        Ok(loaded)
    }

    /// Drop every queue. Called when the owning suite is evicted.
    pub fn clear(&self) {
        let mut queues = self.queues.lock().unwrap();
        debug!(keys = queues.len(), "Clearing data pool");
        queues.clear();
    }
}
