//! Contracts to the outside world: the document database feeding the index
//! and the runtime that evaluates user spatial functions against documents.
//!
//! The index never reads documents directly. It consumes an ordered change
//! stream keyed by update sequence, asks the [`SpatialEval`] runtime what
//! each document emits, and checks the database's committed sequence before
//! making any of its own state durable.
//!
//! [`MemoryDatabase`] is an in-process implementation with explicit commit
//! control, the backend the test suites drive durability scenarios with.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::bounding_box::Mbr;
use crate::errors::SpatialResult;

/// One emission of a spatial function: a box and an opaque value.
pub type Emission = (Mbr, Vec<u8>);

/// A document as delivered by the change stream. Deletions arrive as
/// tombstones with `deleted` set and an empty body.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub deleted: bool,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Document {
        Document {
            id: id.into(),
            deleted: false,
            body,
        }
    }

    pub fn tombstone(id: impl Into<String>) -> Document {
        Document {
            id: id.into(),
            deleted: true,
            body: Value::Null,
        }
    }
}

/// A document update at a database sequence number.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub seq: u64,
    pub doc: Document,
}

/// The document database the index trails behind.
pub trait SourceDatabase: Send + Sync {
    fn name(&self) -> String;

    /// Latest update sequence the database has accepted.
    fn update_seq(&self) -> u64;

    /// Latest update sequence the database has made durable. The index
    /// header is never committed past this point.
    fn committed_seq(&self) -> u64;

    /// Advances when documents are purged (removed without tombstones).
    /// An index older than this can no longer trust its removal records.
    fn purge_seq(&self) -> u64;

    /// All changes with a sequence strictly greater than `seq`, ascending.
    fn changes_since(&self, seq: u64) -> SpatialResult<Vec<DocChange>>;
}

/// Runtime executing a user spatial function body against a document.
pub trait SpatialEval: Send + Sync {
    fn map(&self, body: &str, doc: &Document) -> SpatialResult<Vec<Emission>>;
}

/// Wraps a closure as a [`SpatialEval`] runtime.
pub struct FnEval<F>(pub F);

impl<F> SpatialEval for FnEval<F>
where
    F: Fn(&str, &Document) -> SpatialResult<Vec<Emission>> + Send + Sync,
{
    fn map(&self, body: &str, doc: &Document) -> SpatialResult<Vec<Emission>> {
        (self.0)(body, doc)
    }
}

struct MemoryDbState {
    update_seq: u64,
    committed_seq: u64,
    purge_seq: u64,
    changes: Vec<DocChange>,
}

struct MemoryDbInner {
    name: String,
    state: RwLock<MemoryDbState>,
}

/// In-process [`SourceDatabase`] with explicit commit control.
///
/// Writes advance the update sequence immediately; the committed sequence
/// only moves when the caller says so, which is what lets tests hold the
/// delayed header commit hostage.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryDbInner>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> MemoryDatabase {
        MemoryDatabase {
            inner: Arc::new(MemoryDbInner {
                name: name.into(),
                state: RwLock::new(MemoryDbState {
                    update_seq: 0,
                    committed_seq: 0,
                    purge_seq: 0,
                    changes: Vec::new(),
                }),
            }),
        }
    }

    /// Writes a document, returning its sequence.
    pub fn put(&self, id: impl Into<String>, body: Value) -> u64 {
        let mut state = self.inner.state.write();
        state.update_seq += 1;
        let seq = state.update_seq;
        state.changes.push(DocChange {
            seq,
            doc: Document::new(id, body),
        });
        seq
    }

    /// Deletes a document, leaving a tombstone in the change stream.
    pub fn remove(&self, id: impl Into<String>) -> u64 {
        let mut state = self.inner.state.write();
        state.update_seq += 1;
        let seq = state.update_seq;
        state.changes.push(DocChange {
            seq,
            doc: Document::tombstone(id),
        });
        seq
    }

    /// Purges a document: its changes vanish without tombstones and the
    /// purge sequence advances. The update sequence is untouched; purges
    /// are not changes.
    pub fn purge(&self, id: &str) {
        let mut state = self.inner.state.write();
        state.changes.retain(|c| c.doc.id != id);
        state.purge_seq += 1;
    }

    /// Marks everything written so far as durable.
    pub fn commit_all(&self) {
        let mut state = self.inner.state.write();
        state.committed_seq = state.update_seq;
    }

    /// Marks sequences up to `seq` as durable.
    pub fn commit_through(&self, seq: u64) {
        let mut state = self.inner.state.write();
        state.committed_seq = seq.min(state.update_seq);
    }
}

impl SourceDatabase for MemoryDatabase {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn update_seq(&self) -> u64 {
        self.inner.state.read().update_seq
    }

    fn committed_seq(&self) -> u64 {
        self.inner.state.read().committed_seq
    }

    fn purge_seq(&self) -> u64 {
        self.inner.state.read().purge_seq
    }

    fn changes_since(&self, seq: u64) -> SpatialResult<Vec<DocChange>> {
        let state = self.inner.state.read();
        Ok(state
            .changes
            .iter()
            .filter(|c| c.seq > seq)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_advances_update_seq_only() {
        let db = MemoryDatabase::new("testdb");
        assert_eq!(db.update_seq(), 0);

        let seq = db.put("doc1", json!({"x": 1}));
        assert_eq!(seq, 1);
        assert_eq!(db.update_seq(), 1);
        assert_eq!(db.committed_seq(), 0);

        db.commit_all();
        assert_eq!(db.committed_seq(), 1);
    }

    #[test]
    fn test_changes_since_is_ascending_and_exclusive() {
        let db = MemoryDatabase::new("testdb");
        db.put("a", json!(1));
        db.put("b", json!(2));
        db.remove("a");

        let changes = db.changes_since(1).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].seq, 2);
        assert_eq!(changes[1].seq, 3);
        assert!(changes[1].doc.deleted);

        assert!(db.changes_since(3).unwrap().is_empty());
    }

    #[test]
    fn test_purge_erases_history() {
        let db = MemoryDatabase::new("testdb");
        db.put("a", json!(1));
        db.put("b", json!(2));
        db.purge("a");

        assert_eq!(db.purge_seq(), 1);
        assert_eq!(db.update_seq(), 2);
        let ids: Vec<_> = db
            .changes_since(0)
            .unwrap()
            .into_iter()
            .map(|c| c.doc.id)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_commit_through_clamps() {
        let db = MemoryDatabase::new("testdb");
        db.put("a", json!(1));
        db.commit_through(10);
        assert_eq!(db.committed_seq(), 1);
    }

    #[test]
    fn test_fn_eval_delegates() {
        let eval = FnEval(|_body: &str, doc: &Document| {
            Ok(vec![(
                Mbr::new(0.0, 0.0, 1.0, 1.0),
                doc.id.clone().into_bytes(),
            )])
        });
        let doc = Document::new("d", json!({}));
        let emissions = eval.map("fn", &doc).unwrap();
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].1, b"d".to_vec());
    }
}
