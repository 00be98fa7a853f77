//! LRU cache for tree nodes, keyed by file offset.
//!
//! Records in the index file are immutable once appended, so cached nodes
//! are always clean and eviction never writes back. A shared cache serves
//! both the updater and concurrent readers; an offset uniquely identifies a
//! node for the lifetime of the file.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vtree::node::{Node, NodeOffset};

struct CacheState {
    nodes: HashMap<NodeOffset, Arc<Node>>,
    lru_order: VecDeque<NodeOffset>,
    capacity: usize,
}

/// Shared read-through node cache.
#[derive(Clone)]
pub struct NodeCache {
    state: Arc<Mutex<CacheState>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> NodeCache {
        NodeCache {
            state: Arc::new(Mutex::new(CacheState {
                nodes: HashMap::new(),
                lru_order: VecDeque::new(),
                capacity,
            })),
        }
    }

    /// Looks up a node, refreshing its LRU position on a hit.
    pub fn get(&self, offset: NodeOffset) -> Option<Arc<Node>> {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get(&offset).cloned() {
            state.lru_order.retain(|&o| o != offset);
            state.lru_order.push_back(offset);
            Some(node)
        } else {
            None
        }
    }

    /// Inserts a freshly read or appended node, evicting the oldest entries
    /// past capacity.
    pub fn insert(&self, offset: NodeOffset, node: Arc<Node>) {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return;
        }
        if state.nodes.contains_key(&offset) {
            state.lru_order.retain(|&o| o != offset);
        }
        state.lru_order.push_back(offset);
        state.nodes.insert(offset, node);

        while state.nodes.len() > state.capacity {
            if let Some(oldest) = state.lru_order.pop_front() {
                state.nodes.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Drops every cached node. Used when the backing file is reset.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.lru_order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
