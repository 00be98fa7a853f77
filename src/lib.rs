//! # Geostore - Persistent Spatial Indexing for Document Databases
//!
//! Geostore maintains disk-resident R-tree indices over the documents of an
//! external database. Each design document yields a *group* of named
//! spatial indices sharing one append-only file; a background updater
//! trails the database's change stream and advances the trees, while
//! readers take consistent snapshots at any committed root without ever
//! blocking on the updater.
//!
//! ## Key Properties
//!
//! - **Copy-on-write trees**: mutations append fresh node chains; a root
//!   offset is a stable snapshot forever
//! - **Crash safety**: the file header is committed only after its nodes
//!   are durable, and only once the source database has made the indexed
//!   sequence durable itself
//! - **Non-blocking readers**: snapshots hold their own file handle and
//!   survive header rewrites and group restarts
//! - **Signature-keyed storage**: index files are named by a digest of the
//!   index definition; a changed definition starts a fresh file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use geostore::{
//!     DesignDoc, GroupConfig, Mbr, MemoryDatabase, SpatialServer,
//!     source::{Document, FnEval},
//! };
//!
//! # fn main() -> Result<(), geostore::SpatialError> {
//! let server = SpatialServer::new("/var/lib/geostore", GroupConfig::default());
//!
//! let db = MemoryDatabase::new("places");
//! db.put("museum", serde_json::json!({ "bbox": [12.0, 41.0, 13.0, 42.0] }));
//!
//! let eval = Arc::new(FnEval(|_body: &str, doc: &Document| {
//!     let b = doc.body["bbox"].as_array().cloned().unwrap_or_default();
//!     let f = |i: usize| b.get(i).and_then(|v| v.as_f64()).unwrap_or(0.0);
//!     Ok(vec![(Mbr::new(f(0), f(1), f(2), f(3)), doc.id.clone().into_bytes())])
//! }));
//!
//! let design = DesignDoc {
//!     id: "_design/geo".into(),
//!     language: "javascript".into(),
//!     indices: BTreeMap::from([("by_bbox".to_string(), "emit_bbox".to_string())]),
//!     options: BTreeMap::new(),
//! };
//!
//! let group = server.open_db_group(Arc::new(db), eval, &design)?;
//! let snapshot = group.request_group(1)?;
//! let hits = snapshot.query_by_name("by_bbox", &Mbr::new(12.5, 41.5, 12.6, 41.6))?;
//! # Ok(())
//! # }
//! ```

pub mod bounding_box;
pub mod config;
pub mod errors;
pub mod group;
pub mod source;
pub mod vtree;

pub use bounding_box::Mbr;
pub use config::{GroupConfig, TreeConfig};
pub use errors::{SpatialError, SpatialResult};
pub use group::{
    DesignDoc, Group, GroupCoordinator, GroupDef, GroupSnapshot, IndexDef, SpatialServer,
};
pub use source::{DocChange, Document, Emission, MemoryDatabase, SourceDatabase, SpatialEval};
pub use vtree::{DeleteResult, IndexFile, IndexHeader, LeafEntry, Node, NodeOffset, Vtree};
