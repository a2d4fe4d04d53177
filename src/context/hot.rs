//! Bounded hot index of recently-accessed maps.
//!
//! Tracks per-map access counts at `context/hot_index.json`, capped at
//! [`HOT_INDEX_CAPACITY`] entries. Overflow evicts the entry with the lowest
//! access count (ties broken by oldest `last_accessed`), selected through a
//! min-heap rather than re-sorting the whole list on every write.

use crate::core::error::ForgeFlowError;
use crate::core::fsio;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;

/// Maximum number of tracked maps.
pub const HOT_INDEX_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotEntry {
    pub map_id: String,
    pub access_count: u64,
    pub first_accessed: String,
    pub last_accessed: String,
}

/// The on-disk document shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HotIndexDoc {
    pub entries: Vec<HotEntry>,
    #[serde(default)]
    pub updated_at: String,
}

/// Bounded access-count index over one store.
#[derive(Debug, Clone)]
pub struct HotIndex {
    path: PathBuf,
    capacity: usize,
}

impl HotIndex {
    pub fn new(store: &Store) -> Self {
        Self {
            path: store.hot_index_path(),
            capacity: HOT_INDEX_CAPACITY,
        }
    }

    #[cfg(test)]
    fn with_capacity(store: &Store, capacity: usize) -> Self {
        Self {
            path: store.hot_index_path(),
            capacity,
        }
    }

    /// Record one access to `map_id`, evicting on overflow, and persist.
    pub fn touch(&self, map_id: &str) -> Result<HotIndexDoc, ForgeFlowError> {
        let mut doc = self.read()?;
        let now = time::now_rfc3339();

        match doc.entries.iter_mut().find(|e| e.map_id == map_id) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed = now.clone();
            }
            None => {
                doc.entries.push(HotEntry {
                    map_id: map_id.to_string(),
                    access_count: 1,
                    first_accessed: now.clone(),
                    last_accessed: now.clone(),
                });
                while doc.entries.len() > self.capacity {
                    self.evict_coldest(&mut doc);
                }
            }
        }

        doc.updated_at = now;
        fsio::write_json_atomic(&self.path, &doc)?;
        Ok(doc)
    }

    /// Current document; missing file reads as empty.
    pub fn read(&self) -> Result<HotIndexDoc, ForgeFlowError> {
        if !self.path.exists() {
            return Ok(HotIndexDoc::default());
        }
        fsio::read_json(&self.path)
    }

    /// Entries ordered hottest first.
    pub fn hottest(&self) -> Result<Vec<HotEntry>, ForgeFlowError> {
        let mut entries = self.read()?.entries;
        entries.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        Ok(entries)
    }

    fn evict_coldest(&self, doc: &mut HotIndexDoc) {
        // Min-heap keyed by (access_count, last_accessed): the coldest,
        // longest-idle entry surfaces at the top.
        let mut heap: BinaryHeap<Reverse<(u64, String, usize)>> = doc
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| Reverse((e.access_count, e.last_accessed.clone(), i)))
            .collect();
        if let Some(Reverse((_, _, index))) = heap.pop() {
            doc.entries.remove(index);
        }
    }
}
