//! Process-local table metadata cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Column lists per table, behind one mutex.
#[derive(Debug, Default)]
pub struct TableCache {
    columns: Mutex<HashMap<String, Arc<[String]>>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<[String]>>> {
        self.columns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, table: &str) -> Option<Arc<[String]>> {
        self.map().get(table).cloned()
    }

    /// Store a column list; an entry inserted concurrently first is kept.
    pub fn insert(&self, table: &str, columns: Vec<String>) -> Arc<[String]> {
        self.map()
            .entry(table.to_string())
            .or_insert_with(|| Arc::from(columns))
            .clone()
    }

    pub fn invalidate(&self, table: &str) -> bool {
        self.map().remove(table).is_some()
    }

    pub fn clear(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
