//! Tree node types and their serialized form.
//!
//! Every node is a self-contained record in the index file. Leaf nodes carry
//! the indexed entries; inner nodes carry only the file offsets of their
//! children, with the node's own MBR covering everything below it.

use serde::{Deserialize, Serialize};

use crate::bounding_box::Mbr;

/// File offset of a serialized node record.
pub type NodeOffset = u64;

/// One indexed emission: the box, the opaque entry key identifying the
/// document-emission pair, and the emitted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub mbr: Mbr,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafEntry {
    pub fn new(mbr: Mbr, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> LeafEntry {
        LeafEntry {
            mbr,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A tree node. The MBR of a leaf is the merge of its entries; the MBR of an
/// inner node is the merge of its children's MBRs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        mbr: Mbr,
        entries: Vec<LeafEntry>,
    },
    Inner {
        mbr: Mbr,
        children: Vec<NodeOffset>,
    },
}

impl Node {
    pub fn mbr(&self) -> &Mbr {
        match self {
            Node::Leaf { mbr, .. } => mbr,
            Node::Inner { mbr, .. } => mbr,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Inner { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// Builds a leaf with its MBR recomputed from `entries`.
    ///
    /// Panics on an empty entry list; empty leaves never reach the file
    /// (a leaf that loses its last entry is dropped by the delete path).
    pub fn leaf(entries: Vec<LeafEntry>) -> Node {
        debug_assert!(!entries.is_empty());
        let mbr = merged_entry_mbr(&entries);
        Node::Leaf { mbr, entries }
    }
}

/// Merge of all entry MBRs; callers guarantee a non-empty slice.
pub fn merged_entry_mbr(entries: &[LeafEntry]) -> Mbr {
    entries
        .iter()
        .skip(1)
        .fold(entries[0].mbr, |acc, e| acc.merge(&e.mbr))
}
