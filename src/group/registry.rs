//! The per-process registry of live spatial groups.
//!
//! One coordinator runs per (database, signature) pair. Groups are created
//! lazily on first request, re-created if their task has died (an updater
//! failure takes the whole group down), and shut down together when their
//! database closes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::GroupConfig;
use crate::errors::SpatialResult;
use crate::group::coordinator::GroupCoordinator;
use crate::group::definition::{DesignDoc, GroupDef};
use crate::group::Group;
use crate::source::{SourceDatabase, SpatialEval};
use crate::vtree::file::IndexFile;

struct ServerInner {
    root_dir: PathBuf,
    config: GroupConfig,
    groups: RwLock<HashMap<(String, String), GroupCoordinator>>,
}

/// Owns every live group below one index root directory.
#[derive(Clone)]
pub struct SpatialServer {
    inner: Arc<ServerInner>,
}

impl SpatialServer {
    pub fn new(root_dir: impl Into<PathBuf>, config: GroupConfig) -> SpatialServer {
        SpatialServer {
            inner: Arc::new(ServerInner {
                root_dir: root_dir.into(),
                config,
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns the live group for `design` over `db`, opening (or creating)
    /// its index file and spawning its task on first use. A group whose
    /// task has died is replaced by a fresh one.
    pub fn open_db_group(
        &self,
        db: Arc<dyn SourceDatabase>,
        eval: Arc<dyn SpatialEval>,
        design: &DesignDoc,
    ) -> SpatialResult<GroupCoordinator> {
        let def = Arc::new(GroupDef::from_design(db.name(), design)?);
        let key = (def.db_name.clone(), def.hex_signature());

        {
            let groups = self.inner.groups.read();
            if let Some(coordinator) = groups.get(&key) {
                if coordinator.is_alive() {
                    return Ok(coordinator.clone());
                }
            }
        }

        let mut groups = self.inner.groups.write();
        if let Some(coordinator) = groups.get(&key) {
            if coordinator.is_alive() {
                return Ok(coordinator.clone());
            }
            log::warn!(
                "spatial group {} for {:?} died, spawning a fresh one",
                key.1,
                key.0
            );
        }

        let path = def.file_path(&self.inner.root_dir);
        let (file, header) = IndexFile::open_or_create(&path, def.signature, def.indices.len())?;
        let group = Group::from_header(def, &header);
        let coordinator =
            GroupCoordinator::spawn(file, group, db, eval, self.inner.config.clone());
        groups.insert(key, coordinator.clone());
        Ok(coordinator)
    }

    /// Shuts down every group belonging to `db_name`. Pending waiters get
    /// a shutdown reply; snapshots already handed out keep working.
    pub fn close_db(&self, db_name: &str) {
        let mut groups = self.inner.groups.write();
        groups.retain(|(name, _), coordinator| {
            if name.as_str() == db_name {
                coordinator.notify_db_closed();
                false
            } else {
                true
            }
        });
    }

    /// Number of registered groups, dead or alive.
    pub fn group_count(&self) -> usize {
        self.inner.groups.read().len()
    }
}
