//! The per-document emission map.
//!
//! Maps every indexed document to the entries it produced, per index, so
//! the updater can remove a document's old entries without re-running the
//! spatial function. Deleted documents no longer have a body to run it on.
//!
//! The map is persisted as a single record in the index file at every
//! checkpoint; the header's id-map root points at the latest snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bounding_box::Mbr;
use crate::errors::SpatialResult;
use crate::vtree::file::IndexFile;
use crate::vtree::node::NodeOffset;

/// One recorded emission of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub index_id: usize,
    pub ordinal: u32,
    pub mbr: Mbr,
}

/// doc id -> everything that document contributed to the group's trees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdMap {
    entries: BTreeMap<String, Vec<EmissionRecord>>,
}

impl IdMap {
    /// Loads the snapshot at `root`, or an empty map for a nil root.
    pub fn load(file: &IndexFile, root: Option<NodeOffset>) -> SpatialResult<IdMap> {
        match root {
            Some(offset) => file.read(offset),
            None => Ok(IdMap::default()),
        }
    }

    /// Appends the current state, returning the new snapshot offset.
    pub fn save(&self, file: &IndexFile) -> SpatialResult<NodeOffset> {
        file.append(self)
    }

    /// Removes and returns a document's recorded emissions.
    pub fn take(&mut self, doc_id: &str) -> Vec<EmissionRecord> {
        self.entries.remove(doc_id).unwrap_or_default()
    }

    pub fn put(&mut self, doc_id: String, records: Vec<EmissionRecord>) {
        self.entries.insert(doc_id, records);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the tree-level entry key for one document emission. Length
/// prefixing keeps distinct (id, ordinal) pairs distinct even when ids end
/// in bytes that look like ordinals.
pub fn entry_key(doc_id: &str, ordinal: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 8);
    key.extend_from_slice(&(doc_id.len() as u32).to_be_bytes());
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&ordinal.to_be_bytes());
    key
}
