//! The copy-on-write tree engine.
//!
//! Every mutation appends a fresh chain of nodes from the mutation site up
//! to a new root and returns the new root offset; nothing is rewritten in
//! place. Readers traverse from any root offset they hold and observe a
//! stable snapshot regardless of concurrent mutations.

use std::sync::Arc;

use crate::bounding_box::Mbr;
use crate::config::TreeConfig;
use crate::errors::{SpatialError, SpatialResult};
use crate::vtree::cache::NodeCache;
use crate::vtree::file::IndexFile;
use crate::vtree::node::{LeafEntry, Node, NodeOffset};
use crate::vtree::split::{split_items, ChildRef};

/// Result of a delete against one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
    /// The entry was removed; the new root, or `None` when the tree emptied.
    Updated(Option<NodeOffset>),
    /// No entry with the given key under the given box.
    NotFound,
}

enum InsertOutcome {
    Placed(Mbr, NodeOffset),
    Split(Mbr, NodeOffset, NodeOffset),
}

enum RemoveOutcome {
    Replaced(NodeOffset),
    Empty,
    NotFound,
}

/// Tree engine over one index file. Cheap to construct; holds no tree
/// state of its own, only the file handle, the shared node cache and the
/// fill bounds.
pub struct Vtree<'a> {
    file: &'a IndexFile,
    cache: &'a NodeCache,
    config: TreeConfig,
}

impl<'a> Vtree<'a> {
    pub fn new(file: &'a IndexFile, cache: &'a NodeCache, config: TreeConfig) -> Vtree<'a> {
        Vtree {
            file,
            cache,
            config,
        }
    }

    /// Reads the node at `offset`, through the cache.
    pub fn get_node(&self, offset: NodeOffset) -> SpatialResult<Arc<Node>> {
        if let Some(node) = self.cache.get(offset) {
            return Ok(node);
        }
        let node = Arc::new(self.file.read_node(offset)?);
        self.cache.insert(offset, node.clone());
        Ok(node)
    }

    fn append(&self, node: Node) -> SpatialResult<NodeOffset> {
        let offset = self.file.append_node(&node)?;
        self.cache.insert(offset, Arc::new(node));
        Ok(offset)
    }

    /// Inserts one entry, returning the new root's MBR and offset.
    pub fn insert(&self, root: Option<NodeOffset>, entry: LeafEntry) -> SpatialResult<(Mbr, NodeOffset)> {
        match root {
            None => {
                let node = Node::leaf(vec![entry]);
                let mbr = *node.mbr();
                Ok((mbr, self.append(node)?))
            }
            Some(offset) => match self.insert_at(offset, entry)? {
                InsertOutcome::Placed(mbr, offset) => Ok((mbr, offset)),
                InsertOutcome::Split(mbr, first, second) => {
                    // Root split: a new root one level up holds both halves.
                    let offset = self.append(Node::Inner {
                        mbr,
                        children: vec![first, second],
                    })?;
                    Ok((mbr, offset))
                }
            },
        }
    }

    fn insert_at(&self, offset: NodeOffset, entry: LeafEntry) -> SpatialResult<InsertOutcome> {
        let node = self.get_node(offset)?;
        let entry_mbr = entry.mbr;
        match &*node {
            Node::Leaf { mbr, entries } => {
                let mut entries = entries.clone();
                entries.push(entry);
                if entries.len() < self.config.max_filled {
                    let merged = mbr.merge(&entry_mbr);
                    let offset = self.append(Node::Leaf {
                        mbr: merged,
                        entries,
                    })?;
                    Ok(InsertOutcome::Placed(merged, offset))
                } else {
                    let outer = mbr.merge(&entry_mbr);
                    let halves = split_items(&outer, entries);
                    let merged = halves.first_mbr.merge(&halves.second_mbr);
                    let first = self.append(Node::Leaf {
                        mbr: halves.first_mbr,
                        entries: halves.first,
                    })?;
                    let second = self.append(Node::Leaf {
                        mbr: halves.second_mbr,
                        entries: halves.second,
                    })?;
                    Ok(InsertOutcome::Split(merged, first, second))
                }
            }
            Node::Inner { mbr, children } => {
                let refs = self.materialize(children)?;
                let target = choose_subtree(&refs, &entry_mbr);
                match self.insert_at(refs[target].offset, entry)? {
                    InsertOutcome::Placed(child_mbr, child_offset) => {
                        let mut children = children.clone();
                        children[target] = child_offset;
                        let merged = mbr.merge(&child_mbr);
                        let offset = self.append(Node::Inner {
                            mbr: merged,
                            children,
                        })?;
                        Ok(InsertOutcome::Placed(merged, offset))
                    }
                    InsertOutcome::Split(split_mbr, first, second) => {
                        let mut refs = refs;
                        refs[target] = ChildRef {
                            mbr: *self.get_node(first)?.mbr(),
                            offset: first,
                        };
                        refs.insert(
                            target + 1,
                            ChildRef {
                                mbr: *self.get_node(second)?.mbr(),
                                offset: second,
                            },
                        );
                        let merged = mbr.merge(&split_mbr);
                        if refs.len() < self.config.max_filled {
                            let offset = self.append(Node::Inner {
                                mbr: merged,
                                children: refs.iter().map(|r| r.offset).collect(),
                            })?;
                            Ok(InsertOutcome::Placed(merged, offset))
                        } else {
                            let halves = split_items(&merged, refs);
                            let outer = halves.first_mbr.merge(&halves.second_mbr);
                            let first = self.append(Node::Inner {
                                mbr: halves.first_mbr,
                                children: halves.first.iter().map(|r| r.offset).collect(),
                            })?;
                            let second = self.append(Node::Inner {
                                mbr: halves.second_mbr,
                                children: halves.second.iter().map(|r| r.offset).collect(),
                            })?;
                            Ok(InsertOutcome::Split(outer, first, second))
                        }
                    }
                }
            }
        }
    }

    fn materialize(&self, children: &[NodeOffset]) -> SpatialResult<Vec<ChildRef>> {
        children
            .iter()
            .map(|&offset| {
                Ok(ChildRef {
                    mbr: *self.get_node(offset)?.mbr(),
                    offset,
                })
            })
            .collect()
    }

    /// Removes the entry with `key`, guided by the box it was inserted
    /// under. The tree only shrinks when subtrees empty out entirely;
    /// nothing is rebalanced.
    pub fn delete(
        &self,
        root: Option<NodeOffset>,
        key: &[u8],
        doc_mbr: &Mbr,
    ) -> SpatialResult<DeleteResult> {
        let Some(offset) = root else {
            return Ok(DeleteResult::NotFound);
        };
        match self.remove_at(offset, key, doc_mbr)? {
            RemoveOutcome::Replaced(offset) => Ok(DeleteResult::Updated(Some(offset))),
            RemoveOutcome::Empty => Ok(DeleteResult::Updated(None)),
            RemoveOutcome::NotFound => Ok(DeleteResult::NotFound),
        }
    }

    fn remove_at(
        &self,
        offset: NodeOffset,
        key: &[u8],
        doc_mbr: &Mbr,
    ) -> SpatialResult<RemoveOutcome> {
        let node = self.get_node(offset)?;
        if !doc_mbr.within(node.mbr()) {
            return Ok(RemoveOutcome::NotFound);
        }
        match &*node {
            Node::Leaf { entries, .. } => match entries.iter().position(|e| e.key == key) {
                None => Ok(RemoveOutcome::NotFound),
                Some(_) if entries.len() == 1 => Ok(RemoveOutcome::Empty),
                Some(found) => {
                    let mut entries = entries.clone();
                    entries.remove(found);
                    let offset = self.append(Node::leaf(entries))?;
                    Ok(RemoveOutcome::Replaced(offset))
                }
            },
            Node::Inner { children, .. } => {
                for (i, &child) in children.iter().enumerate() {
                    match self.remove_at(child, key, doc_mbr)? {
                        RemoveOutcome::NotFound => continue,
                        RemoveOutcome::Replaced(new_child) => {
                            let mut children = children.clone();
                            children[i] = new_child;
                            return Ok(RemoveOutcome::Replaced(self.rebuild_inner(children)?));
                        }
                        RemoveOutcome::Empty => {
                            let mut children = children.clone();
                            children.remove(i);
                            if children.is_empty() {
                                return Ok(RemoveOutcome::Empty);
                            }
                            return Ok(RemoveOutcome::Replaced(self.rebuild_inner(children)?));
                        }
                    }
                }
                Ok(RemoveOutcome::NotFound)
            }
        }
    }

    /// Re-derives an inner node's MBR from its remaining children and
    /// appends it.
    fn rebuild_inner(&self, children: Vec<NodeOffset>) -> SpatialResult<NodeOffset> {
        let mut mbr = *self.get_node(children[0])?.mbr();
        for &child in &children[1..] {
            mbr = mbr.merge(self.get_node(child)?.mbr());
        }
        self.append(Node::Inner { mbr, children })
    }

    /// Returns every entry whose box shares at least a point with `query`.
    /// Results are unordered.
    pub fn lookup(&self, root: Option<NodeOffset>, query: &Mbr) -> SpatialResult<Vec<LeafEntry>> {
        let mut results = Vec::new();
        if let Some(offset) = root {
            self.search(offset, query, &mut results)?;
        }
        Ok(results)
    }

    fn search(
        &self,
        offset: NodeOffset,
        query: &Mbr,
        results: &mut Vec<LeafEntry>,
    ) -> SpatialResult<()> {
        let node = self.get_node(offset)?;
        if node.mbr().disjoint(query) {
            return Ok(());
        }
        match &*node {
            Node::Leaf { entries, .. } => {
                for entry in entries {
                    if !entry.mbr.disjoint(query) {
                        results.push(entry.clone());
                    }
                }
            }
            Node::Inner { children, .. } => {
                for &child in children {
                    self.search(child, query, results)?;
                }
            }
        }
        Ok(())
    }

    /// Applies `removes` then `adds`, each individually, returning the final
    /// root. A remove that finds nothing is an error: removals are computed
    /// from the id-map and must exist.
    pub fn add_remove(
        &self,
        root: Option<NodeOffset>,
        adds: &[LeafEntry],
        removes: &[(Vec<u8>, Mbr)],
    ) -> SpatialResult<Option<NodeOffset>> {
        let mut root = root;
        for (key, mbr) in removes {
            match self.delete(root, key, mbr)? {
                DeleteResult::Updated(new_root) => root = new_root,
                DeleteResult::NotFound => {
                    log::error!("stale removal: entry missing from tree");
                    return Err(SpatialError::EntryNotFound);
                }
            }
        }
        for entry in adds {
            let (_, offset) = self.insert(root, entry.clone())?;
            root = Some(offset);
        }
        Ok(root)
    }
}

/// Minimal-expansion choose-subtree; ties go to the first child in order.
fn choose_subtree(children: &[ChildRef], entry_mbr: &Mbr) -> usize {
    let mut best = 0;
    let mut best_expansion = f64::INFINITY;
    for (i, child) in children.iter().enumerate() {
        let expansion = child.mbr.expansion(entry_mbr);
        if expansion < best_expansion {
            best_expansion = expansion;
            best = i;
        }
    }
    best
}
