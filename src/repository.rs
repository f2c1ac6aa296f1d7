//! Buffer id -> table lookup.
//!
//! The context owns the global repository; ingestion may also register
//! tables in a per-execution local one. Blob cells referencing another
//! buffer resolve it here, local first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::RwLock;

use crate::table::ReadableTable;

#[derive(Debug)]
pub struct TableRepository {
    tables: RwLock<HashMap<i32, ReadableTable>>,
    next_id: AtomicI32,
}

impl Default for TableRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TableRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI32::new(0),
        }
    }

    /// Fresh buffer id, never handed out twice by this repository.
    pub fn generate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure `generate_id` never returns `id` or anything below it.
    pub fn reserve_id(&self, id: i32) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }

    /// Register a table under its buffer id. Id -1 is never registered.
    pub fn register(&self, table: ReadableTable) {
        let id = table.buffer_id();
        if id < 0 {
            return;
        }
        self.reserve_id(id);
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(id, table);
        }
    }

    pub fn get(&self, id: i32) -> Option<ReadableTable> {
        self.tables.read().ok()?.get(&id).cloned()
    }

    /// Remove `id` if it is registered to the buffer with `identity`.
    pub fn remove_if(&self, id: i32, identity: u64) -> Option<ReadableTable> {
        let mut tables = self.tables.write().ok()?;
        if tables.get(&id).map(|t| t.identity()) == Some(identity) {
            tables.remove(&id)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning the tables that were registered.
    pub fn drain(&self) -> Vec<ReadableTable> {
        match self.tables.write() {
            Ok(mut tables) => tables.drain().map(|(_, t)| t).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_respect_reservations() {
        let repo = TableRepository::new();
        assert_eq!(repo.generate_id(), 0);
        assert_eq!(repo.generate_id(), 1);
        repo.reserve_id(10);
        assert_eq!(repo.generate_id(), 11);
        repo.reserve_id(3);
        assert_eq!(repo.generate_id(), 12);
        assert!(repo.is_empty());
    }
}
