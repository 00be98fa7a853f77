//! Group management: the per-design-document collection of spatial indices
//! sharing one file, the background updater advancing them, and the
//! coordinator serializing readers against both.

pub mod coordinator;
pub mod definition;
pub mod id_map;
pub mod registry;
pub mod updater;

use std::sync::Arc;

use crate::bounding_box::Mbr;
use crate::config::TreeConfig;
use crate::errors::{SpatialError, SpatialResult};
use crate::vtree::cache::NodeCache;
use crate::vtree::file::{IndexFile, IndexHeader};
use crate::vtree::node::{LeafEntry, NodeOffset};
use crate::vtree::tree::Vtree;

pub use coordinator::GroupCoordinator;
pub use definition::{DesignDoc, GroupDef, IndexDef};
pub use registry::SpatialServer;

/// The in-memory state of a spatial group: one tree root per index plus the
/// sequences describing how much of the database the trees reflect.
#[derive(Debug, Clone)]
pub struct Group {
    pub def: Arc<GroupDef>,
    pub current_seq: u64,
    pub purge_seq: u64,
    pub id_map_root: Option<NodeOffset>,
    pub roots: Vec<Option<NodeOffset>>,
}

impl Group {
    pub fn from_header(def: Arc<GroupDef>, header: &IndexHeader) -> Group {
        let mut roots = header.roots.clone();
        roots.resize(def.indices.len(), None);
        Group {
            def,
            current_seq: header.current_seq,
            purge_seq: header.purge_seq,
            id_map_root: header.id_map_root,
            roots,
        }
    }

    pub fn to_header(&self) -> IndexHeader {
        IndexHeader {
            signature: self.def.signature,
            current_seq: self.current_seq,
            purge_seq: self.purge_seq,
            id_map_root: self.id_map_root,
            roots: self.roots.clone(),
        }
    }
}

/// A consistent view of a group handed to a reader.
///
/// The snapshot owns a clone of the index file handle, taken before the
/// snapshot left the group task, so the descriptor stays alive however the
/// group moves on underneath.
pub struct GroupSnapshot {
    group: Group,
    file: IndexFile,
    cache: NodeCache,
    tree_config: TreeConfig,
}

impl std::fmt::Debug for GroupSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSnapshot")
            .field("signature", &self.group.def.hex_signature())
            .field("current_seq", &self.group.current_seq)
            .field("indices", &self.group.roots.len())
            .finish()
    }
}

impl GroupSnapshot {
    pub(crate) fn new(
        group: Group,
        file: IndexFile,
        cache: NodeCache,
        tree_config: TreeConfig,
    ) -> GroupSnapshot {
        GroupSnapshot {
            group,
            file,
            cache,
            tree_config,
        }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn current_seq(&self) -> u64 {
        self.group.current_seq
    }

    /// Range query against one index by position.
    pub fn query(&self, index_id: usize, query: &Mbr) -> SpatialResult<Vec<LeafEntry>> {
        let root = *self.group.roots.get(index_id).ok_or_else(|| {
            SpatialError::InvalidOperation(format!("no index with id {}", index_id))
        })?;
        Vtree::new(&self.file, &self.cache, self.tree_config).lookup(root, query)
    }

    /// Range query against one index by declared name.
    pub fn query_by_name(&self, name: &str, query: &Mbr) -> SpatialResult<Vec<LeafEntry>> {
        let def = self.group.def.index_by_name(name).ok_or_else(|| {
            SpatialError::InvalidOperation(format!("no index named {:?}", name))
        })?;
        self.query(def.id_num, query)
    }
}
